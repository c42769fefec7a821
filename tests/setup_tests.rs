use fiberqueue::{FiberQueue, FiberQueueCreateInfo, FiberQueueError};

#[test]
fn test_setup_rejects_invalid_config() {
    let result = FiberQueue::setup(FiberQueueCreateInfo::new(0, 16));
    assert!(matches!(result, Err(FiberQueueError::InvalidConfig(_))));

    let result = FiberQueue::setup(FiberQueueCreateInfo {
        stack_size: 512,
        ..FiberQueueCreateInfo::new(2, 16)
    });
    match result {
        Err(e) => assert!(e.to_string().contains("stack_size")),
        Ok(_) => panic!("tiny stacks must be rejected"),
    }
}

#[test]
fn test_setup_and_discard_cycles() {
    for _ in 0..5 {
        let queue = FiberQueue::setup(FiberQueueCreateInfo::new(2, 8)).unwrap();
        assert_eq!(queue.num_threads(), 2);
        assert_eq!(queue.num_fibers(), 8);
        queue.discard().unwrap();
    }
}

#[test]
fn test_small_job_queue_capacity() {
    use std::sync::atomic::AtomicI32;
    fn noop(_: *mut ()) {}

    let queue = FiberQueue::setup(FiberQueueCreateInfo {
        job_queue_capacity: 8,
        ..FiberQueueCreateInfo::new(2, 4)
    })
    .unwrap();

    let counter = AtomicI32::new(0);
    unsafe { queue.enqueue(noop, &[std::ptr::null_mut(); 8], &counter) };
    queue.lock(&counter, 0);
    queue.discard().unwrap();
}
