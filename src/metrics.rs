//! Scheduler counters.
//!
//! Every counter is a relaxed atomic bumped on the hot path; a
//! [`MetricsSnapshot`] gives a consistent-enough view for diagnostics and
//! tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    /// Jobs pushed onto the pending queue.
    pub jobs_enqueued: AtomicU64,
    /// Jobs whose fiber switched back with `Complete`.
    pub jobs_completed: AtomicU64,
    /// Completed jobs whose function panicked.
    pub jobs_panicked: AtomicU64,
    /// Fibers parked in the sleeping list by `wait`.
    pub fibers_parked: AtomicU64,
    /// Sleeping fibers resumed by a scheduling loop.
    pub fibers_woken: AtomicU64,
    /// Scheduling loop iterations that found no work.
    pub idle_iterations: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_enqueued: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_panicked: AtomicU64::new(0),
            fibers_parked: AtomicU64::new(0),
            fibers_woken: AtomicU64::new(0),
            idle_iterations: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_panicked: self.jobs_panicked.load(Ordering::Relaxed),
            fibers_parked: self.fibers_parked.load(Ordering::Relaxed),
            fibers_woken: self.fibers_woken.load(Ordering::Relaxed),
            idle_iterations: self.idle_iterations.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub jobs_panicked: u64,
    pub fibers_parked: u64,
    pub fibers_woken: u64,
    pub idle_iterations: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Jobs submitted but not completed yet (pending, running or parked).
    pub fn in_flight(&self) -> u64 {
        self.jobs_enqueued.saturating_sub(self.jobs_completed)
    }
}
