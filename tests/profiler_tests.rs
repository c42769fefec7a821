use fiberqueue::profiler;
use fiberqueue::{FiberQueue, FiberQueueCreateInfo, PinningStrategy};
use std::sync::atomic::{AtomicI32, Ordering};

fn noop(_: *mut ()) {}

#[test]
fn test_profiling_records_threads_and_fibers() {
    let queue = FiberQueue::setup(FiberQueueCreateInfo {
        pinning: PinningStrategy::None,
        enable_profiling: true,
        ..FiberQueueCreateInfo::new(2, 8)
    })
    .unwrap();

    let counter = AtomicI32::new(0);
    unsafe { queue.enqueue(noop, &[std::ptr::null_mut(); 20], &counter) };
    queue.lock(&counter, 0);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // Buffers are flushed when the fiber threads exit.
    queue.discard().unwrap();

    let path = std::env::temp_dir().join(format!("fiberqueue-trace-{}.json", std::process::id()));
    profiler::export_to_file(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    let events: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
    let thread_names: Vec<&str> = events
        .iter()
        .filter(|e| e["ph"] == "M")
        .filter_map(|e| e["args"]["name"].as_str())
        .collect();
    assert!(thread_names.contains(&"FiberThread #0"));
    assert!(thread_names.contains(&"FiberThread #1"));

    let spans = events.iter().filter(|e| e["name"] == "fiber").count();
    assert!(spans >= 20, "expected one span per job, got {spans}");
}
