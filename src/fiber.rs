//! Fiber management and execution context.
//!
//! A [`Fiber`] is a stackful coroutine with its own dedicated stack. It does
//! nothing until a [`ThreadFiber`] switches into it, and it only gives the CPU
//! back at explicit points: when its job completes or when the job parks
//! itself with [`Fiber::switch_to_thread`]. A parked fiber may later be
//! resumed by a different OS thread.

use crate::job::{Job, panic_message};
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::any::Any;
use std::cell::Cell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicI32;
use tracing::error;

/// Default fiber stack size.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Smallest stack a fiber may be created with.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// What a thread fiber hands to a fiber when switching into it.
pub enum FiberInput {
    /// Run a freshly bound job from the top of the trampoline.
    Start(Job),
    /// Continue a fiber parked in [`Fiber::switch_to_thread`].
    Resume,
}

/// Why a fiber switched back to its thread fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum YieldType {
    /// Park until `*counter == target`.
    Wait {
        counter: *const AtomicI32,
        target: i32,
    },
    /// The job finished and the fiber is back at the top of its trampoline.
    Complete { panicked: bool },
}

/// Outcome of [`ThreadFiber::switch_to`].
pub enum FiberState {
    /// Job done, the fiber can take another one.
    Complete { panicked: bool },
    /// The job parked itself waiting for `*counter == target`.
    Waiting {
        counter: *const AtomicI32,
        target: i32,
    },
    /// A panic escaped the trampoline; the fiber is unusable.
    Panic(Box<dyn Any + Send>),
}

#[derive(Clone, Copy)]
struct FiberHandle {
    id: u32,
    yielder: *const Yielder<FiberInput, YieldType>,
}

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberHandle>> = const { Cell::new(None) };
    static THREAD_FIBER: Cell<bool> = const { Cell::new(false) };
}

// Fibers migrate between threads, so thread-local accesses made around a
// suspension point must not be folded into one cached TLS address.
#[inline(never)]
fn set_current(handle: Option<FiberHandle>) {
    CURRENT_FIBER.set(handle);
}

#[inline(never)]
fn current() -> Option<FiberHandle> {
    CURRENT_FIBER.get()
}

/// Represents a fiber - a stackful execution context bound to one job at a
/// time.
///
/// The coroutine runs a trampoline that never returns: each
/// [`FiberInput::Start`] runs one job, then the fiber switches back with
/// [`YieldType::Complete`] and waits at the top of the loop for the next job.
pub struct Fiber {
    id: u32,
    stack_size: usize,
    coroutine: Coroutine<FiberInput, YieldType, (), DefaultStack>,
}

// A parked fiber is resumed by whichever thread wakes it. Jobs must not keep
// references to thread-local state across `wait`.
unsafe impl Send for Fiber {}

impl Fiber {
    /// Creates fiber `id` with a dedicated stack of `stack_size` bytes.
    pub fn new(id: u32, stack_size: usize) -> std::io::Result<Self> {
        let stack = DefaultStack::new(stack_size)?;

        let coroutine = Coroutine::with_stack(stack, move |yielder, mut input: FiberInput| {
            let handle = FiberHandle {
                id,
                yielder: yielder as *const _,
            };

            loop {
                let job = match input {
                    FiberInput::Start(job) => job,
                    FiberInput::Resume => panic!("idle fiber {id} resumed without a job"),
                };

                set_current(Some(handle));
                // SAFETY: the submitter keeps context and counter alive until
                // the counter reaches its target, which cannot happen before
                // this job decrements it.
                let panicked = match unsafe { job.execute() } {
                    Ok(()) => false,
                    Err(payload) => {
                        error!(
                            fiber = id,
                            "job panicked: {}",
                            panic_message(payload.as_ref())
                        );
                        true
                    }
                };
                set_current(None);

                input = yielder.suspend(YieldType::Complete { panicked });
            }
        });

        Ok(Fiber {
            id,
            stack_size,
            coroutine,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Returns the id of the fiber running on this thread, if any.
    pub fn current() -> Option<u32> {
        current().map(|handle| handle.id)
    }

    /// Suspends the running fiber and switches back to the thread fiber that
    /// resumed it. Returns once some thread switches into this fiber again,
    /// possibly on another OS thread.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a fiber.
    pub fn switch_to_thread(reason: YieldType) {
        let Some(handle) = current() else {
            panic!("Fiber::switch_to_thread called outside of a fiber");
        };

        set_current(None);
        // SAFETY: the yielder lives on this fiber's own stack, which is the
        // stack we are executing on.
        let _ = unsafe { (*handle.yielder).suspend(reason) };
        set_current(Some(handle));
    }
}

/// The continuation of an OS thread, usable as a switch target.
///
/// Every fiber switched into from a thread returns to that thread's
/// `ThreadFiber`. There is at most one per OS thread.
pub struct ThreadFiber {
    _not_send: PhantomData<*const ()>,
}

/// Converts the calling thread into a [`ThreadFiber`].
///
/// # Panics
///
/// Panics if the thread already is a fiber.
pub fn thread_to_fiber() -> ThreadFiber {
    assert!(
        !THREAD_FIBER.replace(true),
        "thread_to_fiber called twice on the same thread"
    );
    ThreadFiber {
        _not_send: PhantomData,
    }
}

impl ThreadFiber {
    /// Suspends the thread's own continuation and runs `fiber` until it
    /// switches back.
    pub fn switch_to(&mut self, fiber: &mut Fiber, input: FiberInput) -> FiberState {
        if fiber.coroutine.done() {
            return FiberState::Panic(Box::new(format!("fiber {} is no longer runnable", fiber.id)));
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.coroutine.resume(input)));
        set_current(None);

        match result {
            Ok(CoroutineResult::Yield(YieldType::Complete { panicked })) => {
                FiberState::Complete { panicked }
            }
            Ok(CoroutineResult::Yield(YieldType::Wait { counter, target })) => {
                FiberState::Waiting { counter, target }
            }
            Ok(CoroutineResult::Return(())) => {
                FiberState::Panic(Box::new(format!("fiber {} trampoline returned", fiber.id)))
            }
            Err(payload) => FiberState::Panic(payload),
        }
    }

    /// Turns the thread fiber back into a plain thread, after which
    /// [`thread_to_fiber`] may be called again. Dropping a `ThreadFiber` does
    /// the same.
    pub fn into_thread(self) {
        drop(self);
    }
}

impl Drop for ThreadFiber {
    fn drop(&mut self) {
        THREAD_FIBER.set(false);
    }
}
