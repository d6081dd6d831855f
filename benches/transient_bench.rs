//! Benchmark for transient batch mutation.
//!
//! Compares the transient builders against their persistent counterparts
//! and the standard library equivalents for batch operations.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use std::hint::black_box;

use arbors::{PersistentHashMap, PersistentTreeMap, PersistentVector, TransientVector};

fn benchmark_vector_build(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("transient_vector_push_back");

    for size in [1_000, 10_000, 100_000] {
        group.bench_with_input(
            BenchmarkId::new("TransientVector", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut transient = TransientVector::new();
                    for index in 0..size {
                        transient.push_back(black_box(index));
                    }
                    black_box(transient.persistent())
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("PersistentVector", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut vector = PersistentVector::new();
                    for index in 0..size {
                        vector = vector.push_back(black_box(index));
                    }
                    black_box(vector)
                });
            },
        );
    }

    group.finish();
}

fn benchmark_hashmap_build(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("transient_hashmap_insert");

    for size in [1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("TransientHashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut transient = PersistentHashMap::new().transient();
                    for index in 0..size {
                        transient.insert(black_box(index), index);
                    }
                    black_box(transient.persistent())
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("PersistentHashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = PersistentHashMap::new();
                    for index in 0..size {
                        map = map.insert(black_box(index), index);
                    }
                    black_box(map)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("HashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = HashMap::new();
                    for index in 0..size {
                        map.insert(black_box(index), index);
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

fn benchmark_treemap_build(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("transient_treemap_insert");

    for size in [1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("TransientTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut transient = PersistentTreeMap::new().transient();
                    for index in 0..size {
                        transient.insert(black_box(index), index);
                    }
                    black_box(transient.persistent())
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("PersistentTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = PersistentTreeMap::new();
                    for index in 0..size {
                        map = map.insert(black_box(index), index);
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_vector_build,
    benchmark_hashmap_build,
    benchmark_treemap_build
);
criterion_main!(benches);
