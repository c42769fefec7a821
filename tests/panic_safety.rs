use fiberqueue::{FiberQueue, FiberQueueCreateInfo, PinningStrategy};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

fn setup() -> FiberQueue {
    FiberQueue::setup(FiberQueueCreateInfo {
        pinning: PinningStrategy::None,
        ..FiberQueueCreateInfo::new(1, 4)
    })
    .unwrap()
}

fn explode(_: *mut ()) {
    panic!("Intentional panic for testing");
}

fn mark(flag: *mut AtomicBool) {
    unsafe { &*flag }.store(true, Ordering::SeqCst);
}

#[test]
fn test_panic_safety_counter_decrement() {
    let queue = setup();
    let counter = AtomicI32::new(0);

    unsafe { queue.enqueue(explode, &[std::ptr::null_mut()], &counter) };

    // Counter should be decremented despite panic
    queue.lock(&counter, 0);
    let start = Instant::now();
    while queue.metrics().jobs_panicked == 0 {
        assert!(start.elapsed() < Duration::from_secs(5), "panic was not recorded");
        std::thread::sleep(Duration::from_millis(1));
    }
    queue.discard().unwrap();
}

#[test]
fn test_worker_recovery_after_panic() {
    let queue = setup();

    // 1. Panicking job on the only thread
    let counter = AtomicI32::new(0);
    unsafe { queue.enqueue(explode, &[std::ptr::null_mut(); 3], &counter) };
    queue.lock(&counter, 0);

    // 2. The same thread and fibers keep working
    let success = AtomicBool::new(false);
    let counter2 = AtomicI32::new(0);
    unsafe {
        queue.enqueue(
            mark,
            &[&success as *const AtomicBool as *mut AtomicBool],
            &counter2,
        )
    };
    queue.lock(&counter2, 0);

    assert!(success.load(Ordering::SeqCst), "Subsequent job failed to run");
    // The worker survived, so discard reports no panicked threads.
    queue.discard().unwrap();
}
