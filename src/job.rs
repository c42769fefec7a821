//! Job definitions and execution logic.
//!
//! A job is a plain function pointer, the opaque context it is called with and
//! the join counter it decrements when it finishes. The context and the
//! counter belong to whoever submitted the job; the scheduler only copies the
//! pointers around.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};

/// Type-erased job entry point.
pub type JobFn = fn(*mut ());

/// A unit of work to be executed on a fiber.
#[derive(Clone, Copy, Debug)]
pub struct Job {
    function: JobFn,
    id: u32,
    context: *mut (),
    counter: *const AtomicI32,
}

// Jobs travel through the pending queue to whichever thread picks them up.
unsafe impl Send for Job {}

impl Job {
    /// Fiber id of a job that has not been bound to a fiber yet.
    pub const UNBOUND: u32 = u32::MAX;

    /// Creates an unbound job calling `function(context)` and decrementing
    /// `counter` once it returns.
    pub fn new<T>(function: fn(*mut T), context: *mut T, counter: &AtomicI32) -> Self {
        // SAFETY: `*mut T` and `*mut ()` are both thin pointers, so the two fn
        // pointer types share one calling convention.
        let function = unsafe { std::mem::transmute::<fn(*mut T), JobFn>(function) };
        Job {
            function,
            id: Self::UNBOUND,
            context: context.cast(),
            counter: counter as *const AtomicI32,
        }
    }

    /// Returns the job bound to fiber slot `id`.
    pub fn bind(self, id: u32) -> Self {
        Job { id, ..self }
    }

    /// The fiber slot running this job, or [`Job::UNBOUND`].
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn counter(&self) -> *const AtomicI32 {
        self.counter
    }

    /// Runs the job function and then decrements the job counter, even if the
    /// function panicked. The panic payload is handed back to the caller.
    ///
    /// # Safety
    ///
    /// The context and the counter passed to [`Job::new`] must still be valid.
    pub unsafe fn execute(&self) -> Result<(), Box<dyn Any + Send>> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.function)(self.context)));
        // Release: the job's side effects happen-before whoever observes the
        // counter reaching its target.
        unsafe {
            (*self.counter).fetch_sub(1, Ordering::AcqRel);
        }
        result
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn add_one(hits: *mut AtomicUsize) {
        unsafe { &*hits }.fetch_add(1, Ordering::SeqCst);
    }

    fn explode(_: *mut ()) {
        panic!("Intentional panic for testing");
    }

    #[test]
    fn test_job_execution() {
        let hits = AtomicUsize::new(0);
        let counter = AtomicI32::new(1);

        let job = Job::new(add_one, &hits as *const _ as *mut _, &counter);
        assert_eq!(job.id(), Job::UNBOUND);

        unsafe { job.execute() }.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bind_keeps_payload() {
        let hits = AtomicUsize::new(0);
        let counter = AtomicI32::new(2);

        let job = Job::new(add_one, &hits as *const _ as *mut _, &counter).bind(5);
        assert_eq!(job.id(), 5);
        assert_eq!(job.counter(), &counter as *const AtomicI32);

        unsafe { job.execute() }.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_job_still_completes() {
        let counter = AtomicI32::new(1);
        let job = Job::new(explode, std::ptr::null_mut(), &counter);

        let payload = unsafe { job.execute() }.unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "Intentional panic for testing");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
