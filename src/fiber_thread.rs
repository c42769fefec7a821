//! Fiber thread implementation.
//!
//! Each fiber thread converts itself into a thread fiber and then runs a
//! scheduling loop: resume a sleeping fiber whose wait condition holds, or
//! bind a pending job to a free fiber, or poll again. Exactly one fiber runs
//! on a thread at any instant, and control always comes back to the thread
//! fiber between two fibers.

use crate::error::{FiberQueueError, Result};
use crate::fiber::{FiberInput, FiberState, ThreadFiber, thread_to_fiber};
use crate::fiber_queue::{FiberContext, FiberWaitContext, Shared, SlotState};
use crate::job::panic_message;
use crate::metrics::Metrics;
use crate::profiler::{self, CollectorGuard, TraceGuard};
use core_affinity::CoreId;
use crossbeam::utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

/// Owner-side handle of a fiber thread.
pub struct FiberThread {
    index: usize,
    handle: Option<JoinHandle<()>>,
}

impl FiberThread {
    /// Spawns fiber thread `index`, named and optionally pinned to `core`.
    pub(crate) fn spawn(index: usize, shared: Arc<Shared>, core: Option<CoreId>) -> Result<Self> {
        let name = format!("FiberThread #{index}");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || FiberThread::run(index, &name, shared, core))
            .map_err(|source| FiberQueueError::ThreadSpawn {
                thread: index,
                source,
            })?;

        Ok(FiberThread {
            index,
            handle: Some(handle),
        })
    }

    fn run(index: usize, name: &str, shared: Arc<Shared>, core: Option<CoreId>) {
        if let Some(core) = core {
            if core_affinity::set_for_current(core) {
                debug!(thread = index, core = core.id, "pinned fiber thread");
            } else {
                warn!(thread = index, core = core.id, "failed to pin fiber thread");
            }
        }

        let profiling = shared.config.enable_profiling;
        let _collector = profiling.then(|| {
            profiler::register_thread(index, name);
            CollectorGuard
        });

        let mut scheduler = Scheduler {
            index,
            shared: &shared,
            thread_fiber: thread_to_fiber(),
            profiling,
        };
        debug!(thread = index, "fiber thread started");
        scheduler.run_loop();
        scheduler.thread_fiber.into_thread();
        debug!(thread = index, "fiber thread stopped");
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Waits for the thread to finish.
    pub fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

/// The thread-side state of a fiber thread.
struct Scheduler<'a> {
    index: usize,
    shared: &'a Shared,
    thread_fiber: ThreadFiber,
    profiling: bool,
}

impl Scheduler<'_> {
    fn run_loop(&mut self) {
        let backoff = Backoff::new();
        while !self.shared.stop.load(Ordering::Acquire) {
            if self.wakeup_fiber() || self.start_pending_job() {
                backoff.reset();
                continue;
            }
            Metrics::bump(&self.shared.metrics.idle_iterations);
            backoff.snooze();
        }
    }

    /// Resumes one sleeping fiber whose counter reached its target.
    fn wakeup_fiber(&mut self) -> bool {
        let Some(waiter) = self.shared.take_ready_sleeper() else {
            return false;
        };
        let id = waiter.context.fiber_id;
        self.shared
            .transition(id, SlotState::Sleeping, SlotState::Running);
        Metrics::bump(&self.shared.metrics.fibers_woken);
        trace!(thread = self.index, fiber = id, "waking fiber");

        self.run_fiber(waiter.context, FiberInput::Resume);
        true
    }

    /// Binds one pending job to a free fiber and runs it.
    ///
    /// The fiber id is taken first so that a job is never dequeued without a
    /// fiber to run it on; with the pool exhausted the job stays pending.
    fn start_pending_job(&mut self) -> bool {
        let Some(id) = self.shared.free_ids.dequeue() else {
            return false;
        };
        let Some(job) = self.shared.pending.dequeue() else {
            self.shared.free_ids.enqueue(id);
            return false;
        };

        let job = job.bind(id);
        self.shared.transition(id, SlotState::Idle, SlotState::Running);
        trace!(thread = self.index, fiber = id, "starting job");

        let context = FiberContext {
            fiber_id: id,
            counter: job.counter(),
        };
        self.run_fiber(context, FiberInput::Start(job));
        true
    }

    fn run_fiber(&mut self, context: FiberContext, input: FiberInput) {
        let id = context.fiber_id;

        // SAFETY: this thread holds slot `id` until it hands it back below.
        let fiber = unsafe { self.shared.fiber_mut(id) };
        let state = {
            let _span = self.profiling.then(|| TraceGuard::new("fiber", self.index));
            self.thread_fiber.switch_to(fiber, input)
        };

        match state {
            FiberState::Complete { panicked } => {
                Metrics::bump(&self.shared.metrics.jobs_completed);
                if panicked {
                    Metrics::bump(&self.shared.metrics.jobs_panicked);
                }
                self.release(id);
            }
            FiberState::Waiting { counter, target } => {
                self.shared
                    .transition(id, SlotState::Running, SlotState::Sleeping);
                Metrics::bump(&self.shared.metrics.fibers_parked);
                trace!(thread = self.index, fiber = id, target, "fiber parked");
                // The fiber is off this stack now, so another thread may pick
                // it up as soon as it is visible in the list.
                self.shared.park(FiberWaitContext {
                    context: FiberContext {
                        fiber_id: id,
                        counter,
                    },
                    target_value: target,
                });
            }
            FiberState::Panic(payload) => {
                error!(
                    thread = self.index,
                    fiber = id,
                    counter = ?context.counter,
                    "fiber died: {}",
                    panic_message(payload.as_ref())
                );
                // SAFETY: still holding slot `id`.
                match unsafe { self.shared.rebuild_fiber(id) } {
                    Ok(()) => self.release(id),
                    Err(e) => {
                        error!(fiber = id, "failed to rebuild fiber, retiring slot: {e}");
                        self.shared.transition(id, SlotState::Running, SlotState::Idle);
                    }
                }
            }
        }
    }

    /// Returns slot `id` to the free pool.
    fn release(&self, id: u32) {
        self.shared.transition(id, SlotState::Running, SlotState::Idle);
        self.shared.free_ids.enqueue(id);
    }
}
