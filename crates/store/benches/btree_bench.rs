//! B+ tree engine benchmarks.
//!
//! These benchmarks measure tree performance for key operations: point lookups against a
//! committed tree, sequential and random inserts with and without log-buffered leaves,
//! commits, and ordered iteration.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, time::Duration};

use arbor_store::{
    BTree, FileStorage, InMemoryStorage, StoreConfig, root_index::root_index_segment_size,
    storage::StaticHeader,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn config(log_buffered_leaves: bool) -> StoreConfig {
    StoreConfig::builder()
        .segment_size(16 * 1024 * 1024)
        .log_buffered_leaves(log_buffered_leaves)
        .sync_on_commit(false)
        .build()
        .expect("valid config")
}

/// Deterministic key scramble (splitmix64 finalizer).
fn scramble(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

fn file_tree(dir: &TempDir, config: &StoreConfig) -> BTree<FileStorage> {
    let header = StaticHeader::from_config(config);
    let roots_header = header.with_segment_size(root_index_segment_size(header.segment_size));
    BTree::create(
        FileStorage::create(dir.path(), "index", header).expect("create index"),
        FileStorage::create(dir.path(), "roots", roots_header).expect("create roots"),
        config,
    )
    .expect("create tree")
}

/// Populates a tree with `count` keys, committing every `batch_size` writes.
fn populate<S: arbor_store::StorageBackend>(tree: &BTree<S>, count: u64, batch_size: u64) {
    for key in 0..count {
        tree.put(key, key).expect("put");
        if (key + 1) % batch_size == 0 {
            tree.commit().expect("commit");
        }
    }
    tree.commit().expect("commit");
}

// =============================================================================
// Point Lookups
// =============================================================================

/// Point lookups at various tree sizes. Measures traversal cost as the tree grows deeper.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/point_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [1_000u64, 10_000, 100_000] {
        let dir = TempDir::new().expect("create temp dir");
        let tree = file_tree(&dir, &config(false));
        populate(&tree, count, 1000);

        group.bench_with_input(
            BenchmarkId::new("committed", format!("{}k", count / 1000)),
            &count,
            |b, &count| {
                let mut counter = 0u64;
                b.iter(|| {
                    counter = (counter + 1) % count;
                    black_box(tree.get(scramble(counter) % count, None))
                });
            },
        );
    }

    group.finish();
}

/// Lookups of a historical version walk the version chain first.
fn bench_versioned_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/versioned_lookup");
    group.throughput(Throughput::Elements(1));

    let tree = BTree::in_memory(&config(false)).expect("create tree");
    for key in 0..1000 {
        tree.put(key, key).expect("put");
    }

    for depth in [1u64, 100, 900] {
        group.bench_with_input(BenchmarkId::new("versions_back", depth), &depth, |b, &depth| {
            let version = 999 - depth;
            b.iter(|| black_box(tree.get(version / 2, Some(version))));
        });
    }

    group.finish();
}

// =============================================================================
// Inserts
// =============================================================================

/// Sequential and random inserts into an in-memory tree, with and without leaf logs.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/insert");
    let count = 10_000u64;
    group.throughput(Throughput::Elements(count));

    for (name, logged) in [("plain", false), ("log_buffered", true)] {
        group.bench_function(BenchmarkId::new("sequential", name), |b| {
            b.iter(|| {
                let tree = BTree::in_memory(&config(logged)).expect("create tree");
                for key in 0..count {
                    tree.put(key, key).expect("put");
                }
                black_box(tree.version())
            });
        });

        group.bench_function(BenchmarkId::new("random", name), |b| {
            b.iter(|| {
                let tree = BTree::in_memory(&config(logged)).expect("create tree");
                for i in 0..count {
                    tree.put(scramble(i), i).expect("put");
                }
                black_box(tree.version())
            });
        });
    }

    group.finish();
}

/// Commit cost for batches of random writes against a populated file-backed tree.
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/commit");

    for batch in [1u64, 100, 1000] {
        let dir = TempDir::new().expect("create temp dir");
        let tree = file_tree(&dir, &config(false));
        populate(&tree, 10_000, 1000);

        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            let mut counter = 0u64;
            b.iter(|| {
                for _ in 0..batch {
                    counter += 1;
                    tree.put(scramble(counter) % 10_000, counter).expect("put");
                }
                black_box(tree.commit().expect("commit"))
            });
        });
    }

    group.finish();
}

// =============================================================================
// Iteration
// =============================================================================

fn bench_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/iteration");
    let count = 10_000u64;
    group.throughput(Throughput::Elements(count));

    let tree: BTree<InMemoryStorage> = BTree::in_memory(&config(false)).expect("create tree");
    populate(&tree, count, count);

    group.bench_function("full_scan", |b| {
        b.iter(|| black_box(tree.iter().filter_map(Result::ok).count()));
    });
    group.bench_function("range_1k", |b| {
        b.iter(|| black_box(tree.range(4000..5000).filter_map(Result::ok).count()));
    });

    group.finish();
}

// =============================================================================
// Criterion Configuration
// =============================================================================

criterion_group! {
    name = lookup_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_point_lookup, bench_versioned_lookup
}

criterion_group! {
    name = insert_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_insert, bench_commit
}

criterion_group! {
    name = scan_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_iteration
}

criterion_main!(lookup_benches, insert_benches, scan_benches);
