//! Chrome Tracing collector for fiber thread activity.
//!
//! Events are recorded into thread-local buffers without contention. Each
//! fiber thread flushes its buffer into the global list when it exits, and
//! [`export_to_file`] writes everything collected so far as a JSON array that
//! chrome://tracing or ui.perfetto.dev can open.

use serde::Serialize;
use std::borrow::Cow;
use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A single trace event in Chrome Tracing format.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: Cow<'static, str>,
    /// Phase: `X` for a complete span, `M` for metadata.
    pub ph: &'static str,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<u64>,
    pub pid: u32,
    pub tid: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<EventArgs>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventArgs {
    pub name: String,
}

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<TraceEvent>> = RefCell::new(Vec::with_capacity(1024));
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default();
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceEvent>>> = Mutex::new(Vec::new());
}

fn timestamp_us(at: Instant) -> u64 {
    at.saturating_duration_since(*GLOBAL_START).as_micros() as u64 + *EPOCH_START_US
}

fn push_local(event: TraceEvent) {
    TRACE_BUFFER.with(|buf| buf.borrow_mut().push(event));
}

/// Startup hook for a fiber thread: names `tid` in the trace.
pub fn register_thread(tid: usize, name: &str) {
    push_local(TraceEvent {
        name: Cow::Borrowed("thread_name"),
        ph: "M",
        ts: timestamp_us(Instant::now()),
        dur: None,
        pid: 1,
        tid,
        args: Some(EventArgs {
            name: name.to_owned(),
        }),
    });
}

/// Records a span of work.
pub fn record_event(name: &'static str, tid: usize, start: Instant, duration: Duration) {
    push_local(TraceEvent {
        name: Cow::Borrowed(name),
        ph: "X",
        ts: timestamp_us(start),
        dur: Some(duration.as_micros() as u64),
        pid: 1,
        tid,
        args: None,
    });
}

/// Moves this thread's buffer into the global list.
pub fn collect_local_trace() {
    TRACE_BUFFER.with(|buf| {
        let mut local = buf.borrow_mut();
        if !local.is_empty() {
            ALL_BUFFERS
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(std::mem::take(&mut *local));
        }
    });
}

/// Removes and returns every collected event.
pub fn take_events() -> Vec<TraceEvent> {
    let mut buffers = ALL_BUFFERS.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::take(&mut *buffers).into_iter().flatten().collect()
}

/// Exports all collected trace events to a JSON file.
pub fn export_to_file(path: impl AsRef<Path>) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    let buffers = ALL_BUFFERS.lock().unwrap_or_else(PoisonError::into_inner);
    let events: Vec<&TraceEvent> = buffers.iter().flatten().collect();
    serde_json::to_writer(&mut writer, &events)?;
    writer.flush()
}

/// Helper for RAII tracing.
pub struct TraceGuard {
    name: &'static str,
    tid: usize,
    start: Instant,
}

impl TraceGuard {
    pub fn new(name: &'static str, tid: usize) -> Self {
        Self {
            name,
            tid,
            start: Instant::now(),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        record_event(self.name, self.tid, self.start, self.start.elapsed());
    }
}

/// RAII guard that collects the local trace when dropped.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_local_trace();
    }
}
