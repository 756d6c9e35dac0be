//! Segmented storage benchmarks.
//!
//! Measures append throughput per page size, concurrent page mapping (reads never take
//! the append lock, so readers should scale), value log reads and the cost of each
//! checksum algorithm over one page.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, sync::Arc};

use arbor_store::{
    ChecksumType, FileStorage, InMemoryStorage, StorageBackend, StoreConfig, ValueLog,
    storage::StaticHeader,
};
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn header(page_size: usize) -> StaticHeader {
    let config = StoreConfig::builder()
        .page_size(page_size)
        .segment_size(8 * 1024 * 1024)
        .build()
        .expect("valid config");
    StaticHeader::from_config(&config)
}

/// Creates a storage holding `page_count` pages of distinct data.
fn populated_storage(page_count: u64) -> (TempDir, Arc<FileStorage>) {
    let dir = TempDir::new().expect("tempdir");
    let storage = FileStorage::create(dir.path(), "bench", header(4096)).expect("create");
    for page in 0..page_count {
        let mut data = vec![(page & 0xFF) as u8; storage.page_size()];
        data[0] = 0xBE;
        storage.append(&data).expect("append");
    }
    storage.flush(false).expect("flush");
    (dir, Arc::new(storage))
}

// =============================================================================
// Appends
// =============================================================================

/// Appends 256 pages into a fresh storage. Recreating the storage per iteration keeps the
/// files bounded.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage/append");
    let dir = TempDir::new().expect("tempdir");

    for page_size in [512usize, 4096, 16384] {
        group.throughput(Throughput::Bytes(256 * page_size as u64));
        let page = vec![0x5A; page_size];

        group.bench_with_input(BenchmarkId::new("file", page_size), &page, |b, page| {
            b.iter_batched(
                || FileStorage::create(dir.path(), "bench", header(page_size)).expect("create"),
                |storage| {
                    for _ in 0..256 {
                        black_box(storage.append(page).expect("append"));
                    }
                    storage
                },
                BatchSize::PerIteration,
            );
        });
        group.bench_with_input(BenchmarkId::new("memory", page_size), &page, |b, page| {
            b.iter_batched(
                || InMemoryStorage::new(header(page_size)),
                |storage| {
                    for _ in 0..256 {
                        black_box(storage.append(page).expect("append"));
                    }
                    storage
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

// =============================================================================
// Concurrent Reads
// =============================================================================

/// Readers map distinct pages concurrently; wall-clock time should stay near a single
/// reader's.
fn bench_concurrent_map_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage/concurrent_maps");
    let (_dir, storage) = populated_storage(64);

    for thread_count in [1usize, 4, 8, 16] {
        group.bench_with_input(
            BenchmarkId::new("readers", thread_count),
            &thread_count,
            |b, &threads| {
                b.iter(|| {
                    std::thread::scope(|scope| {
                        for t in 0..threads {
                            let storage = &storage;
                            scope.spawn(move || {
                                for i in 0..32u64 {
                                    let page = (t as u64 + i) % 64;
                                    black_box(storage.map_page(page).expect("map_page"));
                                }
                            });
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// Value Log
// =============================================================================

fn bench_value_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage/value_log");
    let dir = TempDir::new().expect("tempdir");
    let log =
        ValueLog::new(FileStorage::create(dir.path(), "values", header(4096)).expect("create"));

    for size in [16usize, 256, 4096] {
        let value = vec![0xC3; size];
        let offsets: Vec<u64> = (0..256).map(|_| log.append(&value).expect("append")).collect();
        log.flush(false).expect("flush");

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("read", size), &offsets, |b, offsets| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % offsets.len();
                black_box(log.read(offsets[i]).expect("read"))
            });
        });
    }

    group.finish();
}

// =============================================================================
// Checksums
// =============================================================================

fn bench_checksums(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage/checksum");
    let page = vec![0xA7u8; 4096];
    group.throughput(Throughput::Bytes(page.len() as u64));

    for checksum in [
        ChecksumType::Crc32,
        ChecksumType::Fletcher32,
        ChecksumType::Fletcher64,
        ChecksumType::Sha256,
        ChecksumType::Xxh3,
    ] {
        group.bench_function(format!("{checksum:?}"), |b| {
            b.iter(|| black_box(checksum.compute(&[page.as_slice()])));
        });
    }

    group.finish();
}

criterion_group!(
    storage_benches,
    bench_append,
    bench_concurrent_map_scaling,
    bench_value_log,
    bench_checksums
);
criterion_main!(storage_benches);
