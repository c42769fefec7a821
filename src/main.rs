use fiberqueue::{FiberQueue, FiberQueueCreateInfo, FiberQueueHandle, profiler};
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

struct FanOut<'a> {
    queue: FiberQueueHandle,
    hits: &'a AtomicUsize,
    width: usize,
}

fn leaf(ctx: *mut FanOut<'_>) {
    let fan = unsafe { &*ctx };
    // Simulate some work
    let mut local = 0usize;
    for i in 0..100 {
        local = local.wrapping_add(i);
    }
    std::hint::black_box(local);
    fan.hits.fetch_add(1, Ordering::Relaxed);
}

fn inner(ctx: *mut FanOut<'_>) {
    let fan = unsafe { &*ctx };
    let counter = AtomicI32::new(0);
    let contexts = vec![ctx; fan.width];
    unsafe { fan.queue.enqueue(leaf, &contexts, &counter) };
    fan.queue.wait(&counter, 0);
}

fn outer(ctx: *mut FanOut<'_>) {
    let fan = unsafe { &*ctx };
    let counter = AtomicI32::new(0);
    unsafe { fan.queue.enqueue(inner, &[ctx], &counter) };
    fan.queue.wait(&counter, 0);
}

fn load_config() -> Result<FiberQueueCreateInfo, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?),
        None => Ok(FiberQueueCreateInfo {
            num_fibers: 256,
            ..FiberQueueCreateInfo::default()
        }),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("fiberqueue - Fiber-Based Cooperative Job Scheduler\n");

    let config = load_config()?;
    let profiling = config.enable_profiling;
    let queue = FiberQueue::setup(config.clone())?;
    println!(
        "Initialized fiber queue with {} threads and {} fibers\n",
        config.num_threads, config.num_fibers
    );

    // Example 1: one job fanning out through a nested batch
    println!("Example 1: Nested fan-out");
    let hits = AtomicUsize::new(0);
    let fan = FanOut {
        queue: queue.handle(),
        hits: &hits,
        width: 100,
    };
    let fan_ctx = &fan as *const FanOut as *mut FanOut;
    let counter = AtomicI32::new(0);

    let start = Instant::now();
    unsafe { queue.enqueue(outer, &[fan_ctx], &counter) };
    queue.lock(&counter, 0);
    println!(
        "  Ran {} leaf jobs in {:?}\n",
        hits.load(Ordering::Relaxed),
        start.elapsed()
    );

    // Example 2: a hundred of those at once
    println!("Example 2: Wide nested fan-out");
    hits.store(0, Ordering::Relaxed);
    let contexts = vec![fan_ctx; 100];

    let start = Instant::now();
    unsafe { queue.enqueue(outer, &contexts, &counter) };
    queue.lock(&counter, 0);
    let duration = start.elapsed();
    let total = hits.load(Ordering::Relaxed);
    println!("  Ran {} leaf jobs in {:?} (expected: 10000)", total, duration);
    println!(
        "  Throughput: {:.2} jobs/second\n",
        total as f64 / duration.as_secs_f64()
    );

    let metrics = queue.metrics();
    println!(
        "Metrics: {} enqueued, {} completed, {} parked, {} woken",
        metrics.jobs_enqueued, metrics.jobs_completed, metrics.fibers_parked, metrics.fibers_woken
    );

    println!("Shutting down fiber queue...");
    queue.discard()?;

    if profiling {
        profiler::export_to_file("fiberqueue_trace.json")?;
        println!("Trace written to fiberqueue_trace.json");
    }
    println!("Done!");
    Ok(())
}
