//! Lock-free queue benchmark using criterion.
//!
//! Single-threaded enqueue/dequeue pairs, and a contended run with several
//! threads doing the same against one queue.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use fiberqueue::LockFreeQueue;
use std::sync::Arc;
use std::thread;

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("lockfree_queue");

    group.bench_function("enqueue_dequeue_pair", |b| {
        let queue = LockFreeQueue::<u64>::new(1024);
        b.iter(|| {
            queue.enqueue(std::hint::black_box(7));
            std::hint::black_box(queue.dequeue());
        });
    });

    for threads in [2usize, 4] {
        group.bench_with_input(BenchmarkId::new("contended", threads), &threads, |b, &threads| {
            b.iter(|| {
                let queue = Arc::new(LockFreeQueue::<u64>::new(threads * 1024));
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let queue = queue.clone();
                        thread::spawn(move || {
                            for i in 0..1000u64 {
                                queue.enqueue(i);
                                std::hint::black_box(queue.dequeue());
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_queue);
criterion_main!(benches);
