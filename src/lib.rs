//! # fiberqueue - Fiber-Based Cooperative Job Scheduler
//!
//! A pool of OS threads multiplexes a fixed number of fibers (stackful
//! execution contexts) to run short jobs submitted from any thread. Jobs are
//! grouped in batches sharing one join counter, and a job may submit and
//! wait on sub-jobs without blocking its OS thread.
//!
//! ## Architecture
//!
//! - **Lock-free queue**: fixed-arena MPMC queue holding pending jobs and
//!   free fiber ids
//! - **Fibers**: stackful coroutines with dedicated stacks, switched into and
//!   out of explicitly
//! - **Fiber threads**: OS threads running the scheduling loop
//! - **Fiber queue**: the service tying it together (submission, fiber pool,
//!   sleep/wakeup of waiting fibers)
//!
//! Capacity is fixed at setup. Overflowing the job queue aborts the process.
//!
//! ## Example
//!
//! ```no_run
//! use fiberqueue::{FiberQueue, FiberQueueCreateInfo};
//! use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
//!
//! fn bump(hits: *mut AtomicUsize) {
//!     unsafe { &*hits }.fetch_add(1, Ordering::Relaxed);
//! }
//!
//! let queue = FiberQueue::setup(FiberQueueCreateInfo::new(4, 16)).unwrap();
//!
//! let hits = AtomicUsize::new(0);
//! let counter = AtomicI32::new(0);
//! let contexts = vec![&hits as *const AtomicUsize as *mut AtomicUsize; 10];
//!
//! unsafe { queue.enqueue(bump, &contexts, &counter) };
//! queue.lock(&counter, 0);
//!
//! assert_eq!(hits.load(Ordering::Relaxed), 10);
//! queue.discard().unwrap();
//! ```

pub mod error;
pub mod fiber;
pub mod fiber_queue;
pub mod fiber_thread;
pub mod job;
pub mod lockfree_queue;
pub mod metrics;
pub mod profiler;

use core_affinity::CoreId;
use serde::{Deserialize, Serialize};

/// Strategy for pinning fiber threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    None,
    /// Linear pinning (thread i -> logical processor i).
    #[default]
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

impl PinningStrategy {
    /// Picks the core for fiber thread `index`. Wraps around when there are
    /// more threads than eligible cores.
    pub fn core_for(self, index: usize, cores: &[CoreId]) -> Option<CoreId> {
        if cores.is_empty() {
            return None;
        }
        match self {
            PinningStrategy::None => None,
            PinningStrategy::Linear => Some(cores[index % cores.len()]),
            PinningStrategy::AvoidSMT => {
                let physical = cores.len().div_ceil(2);
                Some(cores[(index % physical) * 2])
            }
        }
    }
}

pub use error::{FiberQueueError, Result};
pub use fiber::Fiber;
pub use fiber_queue::{FiberQueue, FiberQueueCreateInfo, FiberQueueHandle};
pub use job::Job;
pub use lockfree_queue::LockFreeQueue;
pub use metrics::MetricsSnapshot;
