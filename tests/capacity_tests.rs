//! Pending-job queue capacity at the scheduler level.
//!
//! Overflow aborts the process, so those cases re-run this test binary with
//! only the one test selected and inspect how the child exited.

use fiberqueue::{FiberQueue, FiberQueueCreateInfo, FiberQueueHandle, PinningStrategy};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const CHILD_ENV: &str = "FIBERQUEUE_CAPACITY_CHILD";
const SURVIVED: &str = "overflow returned to the caller";

fn setup(job_queue_capacity: usize) -> FiberQueue {
    FiberQueue::setup(FiberQueueCreateInfo {
        job_queue_capacity,
        pinning: PinningStrategy::None,
        ..FiberQueueCreateInfo::new(1, 4)
    })
    .unwrap()
}

fn noop(_: *mut ()) {}

fn bump(hits: *mut AtomicUsize) {
    unsafe { &*hits }.fetch_add(1, Ordering::SeqCst);
}

fn in_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

fn run_in_child(test_name: &str) -> Output {
    Command::new(std::env::current_exe().unwrap())
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap()
}

fn assert_aborted(output: Output) {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "child exited cleanly\nstdout:\n{stdout}\nstderr:\n{stderr}"
    );
    assert!(!stdout.contains(SURVIVED), "child kept running:\n{stdout}");
    assert!(
        stderr.contains("job queue capacity exceeded"),
        "missing abort message:\n{stderr}"
    );

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGABRT
        assert_eq!(output.status.signal(), Some(6));
    }
}

#[test]
fn test_overflow_from_main_thread_aborts() {
    if !in_child() {
        assert_aborted(run_in_child("test_overflow_from_main_thread_aborts"));
        return;
    }

    let queue = setup(4);
    let counter = AtomicI32::new(0);
    unsafe { queue.enqueue(noop, &[std::ptr::null_mut(); 5], &counter) };
    println!("{SURVIVED}");
}

struct Overflow {
    queue: FiberQueueHandle,
    width: usize,
}

fn overflow_sub_batch(ctx: *mut Overflow) {
    let overflow = unsafe { &*ctx };
    let counter = AtomicI32::new(0);
    let contexts = vec![std::ptr::null_mut::<()>(); overflow.width];
    unsafe { overflow.queue.enqueue(noop, &contexts, &counter) };
    overflow.queue.wait(&counter, 0);
}

#[test]
fn test_overflow_from_inside_job_aborts() {
    if !in_child() {
        assert_aborted(run_in_child("test_overflow_from_inside_job_aborts"));
        return;
    }

    let queue = setup(4);
    let overflow = Overflow {
        queue: queue.handle(),
        width: 8,
    };
    let ctx = &overflow as *const Overflow as *mut Overflow;
    let counter = AtomicI32::new(0);
    unsafe { queue.enqueue(overflow_sub_batch, &[ctx], &counter) };

    // Only reached if the overflow did not take the process down.
    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) != 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    println!("{SURVIVED}");
}

#[test]
fn test_sub_batch_filling_capacity_exactly() {
    let queue = setup(8);
    let hits = AtomicUsize::new(0);

    struct Fill<'a> {
        queue: FiberQueueHandle,
        hits: &'a AtomicUsize,
    }
    fn fill(ctx: *mut Fill<'_>) {
        let fill = unsafe { &*ctx };
        let counter = AtomicI32::new(0);
        let hits = fill.hits as *const AtomicUsize as *mut AtomicUsize;
        // The outer job has been dequeued, so all 8 slots are free.
        unsafe { fill.queue.enqueue(bump, &[hits; 8], &counter) };
        fill.queue.wait(&counter, 0);
    }

    let ctx = Fill {
        queue: queue.handle(),
        hits: &hits,
    };
    let counter = AtomicI32::new(0);
    unsafe { queue.enqueue(fill, &[&ctx as *const Fill as *mut Fill], &counter) };
    queue.lock(&counter, 0);

    assert_eq!(hits.load(Ordering::SeqCst), 8);
    assert_eq!(queue.pending_jobs(), 0);
    assert_eq!(queue.metrics().jobs_panicked, 0);
    queue.discard().unwrap();
}

#[test]
fn test_capacity_is_reusable_after_draining() {
    let queue = setup(4);
    let hits = AtomicUsize::new(0);
    let contexts = [&hits as *const AtomicUsize as *mut AtomicUsize; 4];

    for _ in 0..10 {
        let counter = AtomicI32::new(0);
        unsafe { queue.enqueue(bump, &contexts, &counter) };
        queue.lock(&counter, 0);
    }

    assert_eq!(hits.load(Ordering::SeqCst), 40);
    assert_eq!(queue.pending_jobs(), 0);
    queue.discard().unwrap();
}
