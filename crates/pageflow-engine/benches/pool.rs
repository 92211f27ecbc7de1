//! Page pool and SPSC queue hot-path benchmarks.

use criterion::{criterion_group, criterion_main, Criterion};

use pageflow_engine::{PagePool, SpscQueue};

fn bench_pool(c: &mut Criterion) {
    let pool = PagePool::new(1024, 8, 64).unwrap();

    c.bench_function("pool_allocate_release", |b| {
        b.iter(|| {
            let id = pool.allocate().unwrap();
            pool.release(id).unwrap();
        })
    });

    c.bench_function("pool_allocate_release_batch_16", |b| {
        b.iter(|| {
            let held: Vec<u32> = (0..16).map(|_| pool.allocate().unwrap()).collect();
            for id in held {
                pool.release(id).unwrap();
            }
        })
    });
}

fn bench_queue(c: &mut Criterion) {
    let queue: SpscQueue<u64> = SpscQueue::new(1024);

    c.bench_function("spsc_push_pop", |b| {
        b.iter(|| {
            queue.push(42).unwrap();
            queue.pop().unwrap();
        })
    });
}

criterion_group!(benches, bench_pool, bench_queue);
criterion_main!(benches);
