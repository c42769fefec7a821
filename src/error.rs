//! Errors reported by the fiber queue.
//!
//! Only setup and teardown are fallible. Capacity violations and broken
//! internal invariants are assertions, not error values.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum FiberQueueError {
    /// The create info failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A fiber stack could not be allocated.
    #[error("failed to allocate a {size}-byte stack for fiber {fiber}")]
    FiberStack {
        fiber: u32,
        size: usize,
        #[source]
        source: io::Error,
    },

    /// The OS refused to spawn a fiber thread.
    #[error("failed to spawn fiber thread {thread}")]
    ThreadSpawn {
        thread: usize,
        #[source]
        source: io::Error,
    },

    /// Fiber threads panicked outside of any job.
    #[error("{0} fiber thread(s) panicked")]
    WorkerPanicked(usize),
}

pub type Result<T> = std::result::Result<T, FiberQueueError>;
