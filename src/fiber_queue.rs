//! The fiber queue: job submission, the fiber pool and the sleep/wakeup
//! protocol.
//!
//! [`FiberQueue`] owns the worker threads and is the only way to create or tear
//! down the service. Jobs that need to submit or wait on sub-jobs reach the
//! service through a [`FiberQueueHandle`] stored in their context.

use crate::PinningStrategy;
use crate::error::{FiberQueueError, Result};
use crate::fiber::{DEFAULT_STACK_SIZE, Fiber, MIN_STACK_SIZE, YieldType};
use crate::fiber_thread::FiberThread;
use crate::job::Job;
use crate::lockfree_queue::{LockFreeQueue, MAX_CAPACITY};
use crate::metrics::{Metrics, MetricsSnapshot};
use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{error, info, trace, warn};

/// Default capacity of the pending-job queue.
pub const DEFAULT_JOB_QUEUE_CAPACITY: usize = 65535;

/// Default number of fibers in the pool.
pub const DEFAULT_NUM_FIBERS: u32 = 128;

/// Configuration for [`FiberQueue::setup`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberQueueCreateInfo {
    /// Number of fiber threads. Default: available parallelism.
    pub num_threads: u32,
    /// Number of fibers shared by all threads. Default: 128.
    ///
    /// A fiber parked in `wait` keeps its slot, so nested batches need at
    /// least one fiber per job that can be waiting at once, plus one to run
    /// the leaves. With fewer, the pool drains and nothing makes progress.
    pub num_fibers: u32,
    /// Stack size of every fiber in bytes. Default: 64KB.
    pub stack_size: usize,
    /// Maximum number of jobs waiting to be picked up. Default: 65535.
    pub job_queue_capacity: usize,
    /// How fiber threads are pinned to cores. Default: linear.
    pub pinning: PinningStrategy,
    /// Record per-thread Chrome trace events. Default: off.
    pub enable_profiling: bool,
}

impl Default for FiberQueueCreateInfo {
    fn default() -> Self {
        let num_threads = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);
        Self {
            num_threads,
            num_fibers: DEFAULT_NUM_FIBERS,
            stack_size: DEFAULT_STACK_SIZE,
            job_queue_capacity: DEFAULT_JOB_QUEUE_CAPACITY,
            pinning: PinningStrategy::Linear,
            enable_profiling: false,
        }
    }
}

impl FiberQueueCreateInfo {
    pub fn new(num_threads: u32, num_fibers: u32) -> Self {
        Self {
            num_threads,
            num_fibers,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(FiberQueueError::InvalidConfig(
                "num_threads must be at least 1".into(),
            ));
        }
        if self.num_fibers == 0 || self.num_fibers as usize > MAX_CAPACITY {
            return Err(FiberQueueError::InvalidConfig(format!(
                "num_fibers must be in 1..={MAX_CAPACITY}, got {}",
                self.num_fibers
            )));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(FiberQueueError::InvalidConfig(format!(
                "stack_size must be at least {MIN_STACK_SIZE} bytes, got {}",
                self.stack_size
            )));
        }
        if self.job_queue_capacity == 0 || self.job_queue_capacity > MAX_CAPACITY {
            return Err(FiberQueueError::InvalidConfig(format!(
                "job_queue_capacity must be in 1..={MAX_CAPACITY}, got {}",
                self.job_queue_capacity
            )));
        }
        Ok(())
    }
}

/// Where a fiber slot currently is. A slot is in exactly one state at a time.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    Idle = 0,
    Running = 1,
    Sleeping = 2,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SlotState::Idle,
            1 => SlotState::Running,
            _ => SlotState::Sleeping,
        }
    }
}

struct FiberSlot {
    fiber: UnsafeCell<ManuallyDrop<Fiber>>,
    state: AtomicU8,
}

// The fiber itself is only touched by the thread holding the slot id, which
// it obtained from the free-id queue or the sleeping list.
unsafe impl Sync for FiberSlot {}

/// A running fiber and the counter its job decrements.
#[derive(Clone, Copy, Debug)]
pub struct FiberContext {
    pub fiber_id: u32,
    pub counter: *const AtomicI32,
}

/// A fiber parked by `wait` until `*counter == target_value`.
#[derive(Clone, Copy, Debug)]
pub struct FiberWaitContext {
    pub context: FiberContext,
    pub target_value: i32,
}

unsafe impl Send for FiberWaitContext {}

impl FiberWaitContext {
    fn is_ready(&self) -> bool {
        // SAFETY: the parked job keeps its counter alive until it is resumed.
        unsafe { (*self.context.counter).load(Ordering::Acquire) == self.target_value }
    }
}

/// State shared by the queue handle and every fiber thread.
pub(crate) struct Shared {
    slots: Box<[FiberSlot]>,
    pub(crate) free_ids: LockFreeQueue<u32>,
    pub(crate) pending: LockFreeQueue<Job>,
    sleeping: Mutex<Vec<FiberWaitContext>>,
    sleeping_len: AtomicUsize,
    pub(crate) stop: AtomicBool,
    pub(crate) metrics: Metrics,
    pub(crate) config: FiberQueueCreateInfo,
}

impl Shared {
    fn new(config: &FiberQueueCreateInfo) -> Result<Self> {
        let num_fibers = config.num_fibers as usize;
        let free_ids = LockFreeQueue::new(num_fibers);
        let mut slots = Vec::with_capacity(num_fibers);

        for id in 0..config.num_fibers {
            let fiber = Fiber::new(id, config.stack_size).map_err(|source| {
                FiberQueueError::FiberStack {
                    fiber: id,
                    size: config.stack_size,
                    source,
                }
            })?;
            slots.push(FiberSlot {
                fiber: UnsafeCell::new(ManuallyDrop::new(fiber)),
                state: AtomicU8::new(SlotState::Idle as u8),
            });
            free_ids.enqueue(id);
        }

        Ok(Shared {
            slots: slots.into_boxed_slice(),
            free_ids,
            pending: LockFreeQueue::new(config.job_queue_capacity),
            sleeping: Mutex::new(Vec::new()),
            sleeping_len: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            metrics: Metrics::new(),
            config: config.clone(),
        })
    }

    /// Moves slot `id` from `from` to `to`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not in state `from`.
    pub(crate) fn transition(&self, id: u32, from: SlotState, to: SlotState) {
        let result = self.slots[id as usize].state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(actual) = result {
            panic!(
                "fiber {id} expected {from:?} -> {to:?}, found {:?}",
                SlotState::from_u8(actual)
            );
        }
    }

    /// # Safety
    ///
    /// The caller must hold slot `id`: it dequeued the id from the free-id
    /// queue or removed it from the sleeping list, and has not handed it back.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn fiber_mut(&self, id: u32) -> &mut Fiber {
        unsafe { &mut *self.slots[id as usize].fiber.get() }
    }

    /// Replaces a fiber that can no longer run.
    ///
    /// # Safety
    ///
    /// Same contract as [`Shared::fiber_mut`].
    pub(crate) unsafe fn rebuild_fiber(&self, id: u32) -> std::io::Result<()> {
        let fresh = Fiber::new(id, self.config.stack_size)?;
        let slot = unsafe { &mut *self.slots[id as usize].fiber.get() };
        // The dead coroutine has already unwound; dropping it is safe.
        unsafe { ManuallyDrop::drop(slot) };
        *slot = ManuallyDrop::new(fresh);
        Ok(())
    }

    fn sleeping(&self) -> MutexGuard<'_, Vec<FiberWaitContext>> {
        self.sleeping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a fiber that has fully switched out to the sleeping list.
    pub(crate) fn park(&self, waiter: FiberWaitContext) {
        let mut sleeping = self.sleeping();
        sleeping.push(waiter);
        self.sleeping_len.store(sleeping.len(), Ordering::Release);
    }

    /// Removes the first sleeping fiber whose condition now holds.
    pub(crate) fn take_ready_sleeper(&self) -> Option<FiberWaitContext> {
        if self.sleeping_len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut sleeping = self.sleeping();
        let position = sleeping.iter().position(FiberWaitContext::is_ready)?;
        let waiter = sleeping.swap_remove(position);
        self.sleeping_len.store(sleeping.len(), Ordering::Release);
        Some(waiter)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mut leaked = 0;
        for slot in self.slots.iter_mut() {
            if SlotState::from_u8(*slot.state.get_mut()) == SlotState::Idle {
                // SAFETY: every thread has been joined and the slot is never
                // touched again.
                unsafe { ManuallyDrop::drop(slot.fiber.get_mut()) };
            } else {
                // Unwinding a fiber parked inside a job would run the job's
                // destructors on a half-finished stack. Leak it instead.
                leaked += 1;
            }
        }
        if leaked > 0 {
            warn!(leaked, "leaked fibers that never finished their jobs");
        }
    }
}

/// Cloneable access to a running [`FiberQueue`], for use inside jobs.
#[derive(Clone)]
pub struct FiberQueueHandle {
    shared: Arc<Shared>,
}

impl FiberQueueHandle {
    /// Sets `*counter` to `contexts.len()` and submits one job per context,
    /// each calling `function(context)`.
    ///
    /// The counter reaching 0 is the only signal that the whole batch has
    /// completed.
    ///
    /// # Safety
    ///
    /// Every context pointer and `counter` must stay valid until the counter
    /// has reached 0. The function must be safe to call with each context
    /// from any fiber thread.
    ///
    /// # Aborts
    ///
    /// Aborts the process if the batch does not fit in the pending-job
    /// queue. Nothing has been enqueued and the counter is untouched at that
    /// point.
    ///
    /// # Panics
    ///
    /// Panics if the batch is too large for an `i32` counter.
    pub unsafe fn enqueue<T>(&self, function: fn(*mut T), contexts: &[*mut T], counter: &AtomicI32) {
        let count = i32::try_from(contexts.len()).unwrap_or_else(|_| {
            panic!("job batch of {} does not fit a join counter", contexts.len())
        });

        let pending = &self.shared.pending;
        if !pending.try_reserve(contexts.len()) {
            error!(
                jobs = count,
                pending = pending.len(),
                capacity = pending.capacity(),
                "job queue capacity exceeded, aborting"
            );
            eprintln!(
                "fiberqueue: job queue capacity exceeded ({} pending + {} > {}), aborting",
                pending.len(),
                count,
                pending.capacity()
            );
            process::abort();
        }

        counter.store(count, Ordering::Release);
        for &context in contexts {
            pending.enqueue_reserved(Job::new(function, context, counter));
        }

        self.shared
            .metrics
            .jobs_enqueued
            .fetch_add(contexts.len() as u64, Ordering::Relaxed);
        trace!(jobs = count, pending = self.shared.pending.len(), "enqueued batch");
    }

    /// Cooperatively waits until `*counter == target`.
    ///
    /// The calling fiber is parked and its thread goes on servicing other
    /// work; execution continues after this call once some fiber thread sees
    /// the condition hold.
    ///
    /// # Panics
    ///
    /// Must be called from a job running on a fiber; panics otherwise. Use
    /// [`FiberQueueHandle::lock`] from plain threads.
    pub fn wait(&self, counter: &AtomicI32, target: i32) {
        if counter.load(Ordering::Acquire) == target {
            return;
        }
        assert!(
            Fiber::current().is_some(),
            "FiberQueueHandle::wait called outside of a fiber; use lock instead"
        );
        Fiber::switch_to_thread(YieldType::Wait {
            counter: counter as *const AtomicI32,
            target,
        });
    }

    /// Spins until `*counter == target`, without yielding to the scheduler.
    pub fn lock(&self, counter: &AtomicI32, target: i32) {
        let backoff = Backoff::new();
        while counter.load(Ordering::Acquire) != target {
            backoff.snooze();
        }
    }

    pub fn num_fibers(&self) -> usize {
        self.shared.slots.len()
    }

    /// Jobs waiting for a fiber.
    pub fn pending_jobs(&self) -> usize {
        self.shared.pending.len()
    }

    /// Fibers sitting in the free pool.
    pub fn free_fibers(&self) -> usize {
        self.shared.free_ids.len()
    }

    /// Fibers parked by `wait`.
    pub fn sleeping_fibers(&self) -> usize {
        self.shared.sleeping_len.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

/// The fiber-based job scheduler.
///
/// Created with [`FiberQueue::setup`], torn down with
/// [`FiberQueue::discard`] (or on drop).
pub struct FiberQueue {
    handle: FiberQueueHandle,
    threads: Vec<FiberThread>,
}

impl FiberQueue {
    /// Allocates the fiber pool and the queues, then starts the fiber threads.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fiberqueue::{FiberQueue, FiberQueueCreateInfo};
    ///
    /// let queue = FiberQueue::setup(FiberQueueCreateInfo::new(4, 64)).unwrap();
    /// assert_eq!(queue.num_threads(), 4);
    /// queue.discard().unwrap();
    /// ```
    pub fn setup(info: FiberQueueCreateInfo) -> Result<Self> {
        info.validate()?;

        let shared = Arc::new(Shared::new(&info)?);
        let cores = core_affinity::get_core_ids().unwrap_or_default();

        let mut queue = FiberQueue {
            handle: FiberQueueHandle { shared },
            threads: Vec::with_capacity(info.num_threads as usize),
        };

        for index in 0..info.num_threads as usize {
            let core = info.pinning.core_for(index, &cores);
            // On failure, dropping `queue` stops the threads started so far.
            let thread = FiberThread::spawn(index, Arc::clone(&queue.handle.shared), core)?;
            queue.threads.push(thread);
        }

        info!(
            threads = info.num_threads,
            fibers = info.num_fibers,
            stack_size = info.stack_size,
            job_queue_capacity = info.job_queue_capacity,
            pinning = ?info.pinning,
            "fiber queue started"
        );
        Ok(queue)
    }

    /// Stops and joins every fiber thread.
    ///
    /// Jobs still pending are not run, and fibers still parked are leaked;
    /// nothing is cancelled mid-flight.
    pub fn discard(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.threads.is_empty() {
            return Ok(());
        }

        let shared = &self.handle.shared;
        shared.stop.store(true, Ordering::Release);

        let mut failed = 0;
        for thread in self.threads.drain(..) {
            let index = thread.index();
            if thread.join().is_err() {
                failed += 1;
                warn!(thread = index, "fiber thread panicked");
            }
        }

        let pending = shared.pending.len();
        if pending > 0 {
            warn!(pending, "fiber queue discarded with jobs still pending");
        }
        let sleeping = shared.sleeping_len.load(Ordering::Acquire);
        if sleeping > 0 {
            warn!(sleeping, "fiber queue discarded with fibers still waiting");
        }
        info!("fiber queue stopped");

        if failed > 0 {
            Err(FiberQueueError::WorkerPanicked(failed))
        } else {
            Ok(())
        }
    }

    pub fn handle(&self) -> FiberQueueHandle {
        self.handle.clone()
    }

    /// See [`FiberQueueHandle::enqueue`].
    ///
    /// # Safety
    ///
    /// Same contract as [`FiberQueueHandle::enqueue`].
    pub unsafe fn enqueue<T>(&self, function: fn(*mut T), contexts: &[*mut T], counter: &AtomicI32) {
        unsafe { self.handle.enqueue(function, contexts, counter) }
    }

    /// See [`FiberQueueHandle::wait`].
    pub fn wait(&self, counter: &AtomicI32, target: i32) {
        self.handle.wait(counter, target);
    }

    /// See [`FiberQueueHandle::lock`].
    pub fn lock(&self, counter: &AtomicI32, target: i32) {
        self.handle.lock(counter, target);
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn num_fibers(&self) -> usize {
        self.handle.num_fibers()
    }

    pub fn pending_jobs(&self) -> usize {
        self.handle.pending_jobs()
    }

    pub fn free_fibers(&self) -> usize {
        self.handle.free_fibers()
    }

    pub fn sleeping_fibers(&self) -> usize {
        self.handle.sleeping_fibers()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.handle.metrics()
    }
}

impl Drop for FiberQueue {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("fiber queue shutdown failed: {e}");
        }
    }
}
