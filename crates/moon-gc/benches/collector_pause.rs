//! Benchmarks for collection cost.
//!
//! Compares a stop-the-world full collection against one incremental step
//! and one minor collection over heaps of a few sizes.

#![allow(clippy::cast_possible_wrap)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use moon_gc::{GcConfig, GcRef, Heap, Value};

/// A pinned list of `nodes` tables, each holding a small payload.
fn populated(config: GcConfig, nodes: usize) -> (Heap, GcRef) {
    let mut heap = Heap::with_config(config).expect("heap");
    let root = heap.new_table().expect("table");
    heap.pin(root.into()).expect("pin");
    for i in 0..nodes {
        let node = heap.new_table().expect("table");
        heap.table_set(node, Value::Integer(1), Value::Integer(i as i64))
            .expect("store");
        heap.table_set(root, Value::Integer(i as i64 + 1), node.into())
            .expect("store");
    }
    (heap, root)
}

fn benchmark_full_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_collect");
    group.sample_size(10);
    group.warm_up_time(std::time::Duration::from_millis(500));

    for nodes in [1_000, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, &nodes| {
            let (mut heap, _root) = populated(GcConfig::incremental(), nodes);
            b.iter(|| {
                heap.full_collect();
                std::hint::black_box(heap.total_bytes());
            });
        });
    }
    group.finish();
}

fn benchmark_incremental_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_step");
    group.sample_size(10);

    for nodes in [10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, &nodes| {
            let (mut heap, _root) = populated(GcConfig::incremental(), nodes);
            b.iter(|| {
                for _ in 0..64 {
                    heap.new_table().expect("table");
                }
                heap.step_kb(8);
            });
        });
    }
    group.finish();
}

fn benchmark_minor_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("minor_collection");
    group.sample_size(10);

    for nodes in [10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, &nodes| {
            let (mut heap, _root) = populated(GcConfig::generational(), nodes);
            heap.full_collect();
            b.iter(|| {
                for _ in 0..256 {
                    heap.new_table().expect("table");
                }
                heap.step_kb(0);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_full_collect,
    benchmark_incremental_step,
    benchmark_minor_collection
);
criterion_main!(benches);
