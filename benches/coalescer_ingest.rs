//! Benchmarks for the coalesced write path.
//!
//! Run with: cargo bench --bench coalescer_ingest

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use giles::coalescer::{Coalescer, CoalescerConfig};
use giles::core::{Reading, StreamId};
use giles::tsengine::MemoryTimeseries;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn readings(count: usize) -> Vec<Reading> {
    (0..count as u64).map(|i| Reading::new(1_351_043_674_000_000_000 + i * 1_000_000, i as f64)).collect()
}

fn bench_add(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();
    let coalescer = Coalescer::new(Arc::new(MemoryTimeseries::new()), CoalescerConfig::default()).unwrap();

    let mut group = c.benchmark_group("coalescer_add");
    for batch in [1usize, 64, 1024] {
        let data = readings(batch);
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &data, |b, data| {
            let id = StreamId::new_v4();
            b.iter(|| coalescer.add(id, black_box(data)));
        });
    }
    group.finish();
}

fn bench_add_and_commit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();
    let coalescer = Coalescer::new(Arc::new(MemoryTimeseries::new()), CoalescerConfig::default()).unwrap();
    let data = readings(16_384);

    let mut group = c.benchmark_group("coalescer_commit");
    group.throughput(Throughput::Elements(data.len() as u64));
    group.bench_function("full_buffer", |b| {
        let id = StreamId::new_v4();
        b.iter(|| {
            coalescer.add(id, &data);
            rt.block_on(coalescer.commit(id)).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_add, bench_add_and_commit);
criterion_main!(benches);
