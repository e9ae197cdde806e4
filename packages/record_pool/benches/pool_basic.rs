//! Basic benchmarks for the `record_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use record_pool::RecordPool;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestRecord = [u64; 4];
const TEST_VALUE: TestRecord = [1, 2, 3, 4];

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_basic");

    group.bench_function("insert_remove", |b| {
        let mut pool = RecordPool::<TestRecord>::new();

        b.iter(|| {
            let key = pool
                .insert(black_box(TEST_VALUE))
                .expect("benchmark pool never hits its growth limits");
            black_box(pool.remove(key));
        });
    });

    group.bench_function("insert_churn", |b| {
        let mut pool = RecordPool::<TestRecord>::new();
        let mut keys = Vec::with_capacity(1024);

        b.iter(|| {
            for _ in 0..1024 {
                keys.push(
                    pool.insert(black_box(TEST_VALUE))
                        .expect("benchmark pool never hits its growth limits"),
                );
            }
            for key in keys.drain(..) {
                black_box(pool.remove(key));
            }
        });
    });

    group.finish();
}
