//! Micro-benchmarks for ProximaDB core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- search    # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};

use proximadb::{Database, DbConfig, IndexType, Metric};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Benchmark dimension — typical small-embedding width.
const DIM: usize = 64;

/// Deterministic pseudo-random row.
fn row(i: usize) -> Vec<f32> {
    (0..DIM)
        .map(|d| ((i * 31 + d * 7) % 2087) as f32 / 2087.0 - 0.5)
        .collect()
}

/// Open a WAL-less HNSW database forced onto the indexed path.
fn open_hnsw(dir: &std::path::Path) -> Database {
    let config = DbConfig {
        dimension: DIM,
        index_type: IndexType::Hnsw,
        exact_search_threshold: 0,
        wal_path: None,
        ..DbConfig::default()
    };
    Database::open(dir, config).expect("open database")
}

/// Populated database of `n` rows.
fn populated(dir: &std::path::Path, n: usize) -> Database {
    let db = open_hnsw(dir);
    for i in 0..n {
        db.add_vector(&row(i), &[]).expect("insert");
    }
    db
}

// ------------------------------------------------------------------------------------------------
// Benchmarks
// ------------------------------------------------------------------------------------------------

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hnsw_no_wal", |b| {
        b.iter_batched(
            || {
                let tmp = TempDir::new().unwrap();
                let db = open_hnsw(tmp.path());
                (tmp, db, row(12345))
            },
            |(_tmp, db, v)| {
                db.add_vector(black_box(&v), &[]).unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("hnsw_with_wal", |b| {
        b.iter_batched(
            || {
                let tmp = TempDir::new().unwrap();
                let config = DbConfig {
                    dimension: DIM,
                    index_type: IndexType::Hnsw,
                    exact_search_threshold: 0,
                    wal_path: Some(tmp.path().join("db.wal")),
                    ..DbConfig::default()
                };
                let db = Database::open(tmp.path(), config).unwrap();
                (tmp, db, row(12345))
            },
            |(_tmp, db, v)| {
                db.add_vector(black_box(&v), &[]).unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    group.throughput(Throughput::Elements(1));

    let tmp = TempDir::new().unwrap();
    let db = populated(tmp.path(), 2000);
    let query = row(999);

    group.bench_function("hnsw_top10_2k_rows", |b| {
        b.iter(|| {
            let hits = db.search(black_box(&query), 10, Metric::L2).unwrap();
            black_box(hits);
        });
    });

    let tmp_exact = TempDir::new().unwrap();
    let exact = {
        let config = DbConfig {
            dimension: DIM,
            index_type: IndexType::Exact,
            wal_path: None,
            ..DbConfig::default()
        };
        let db = Database::open(tmp_exact.path(), config).unwrap();
        for i in 0..2000 {
            db.add_vector(&row(i), &[]).unwrap();
        }
        db
    };

    group.bench_function("exact_top10_2k_rows", |b| {
        b.iter(|| {
            let hits = exact.search(black_box(&query), 10, Metric::L2).unwrap();
            black_box(hits);
        });
    });

    group.finish();
}

fn bench_distance_heavy_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    let tmp = TempDir::new().unwrap();
    let db = populated(tmp.path(), 500);
    let query = row(250);

    for (name, metric) in [
        ("l2", Metric::L2),
        ("cosine", Metric::Cosine),
        ("dot", Metric::Dot),
        ("manhattan", Metric::Manhattan),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let hits = db.search(black_box(&query), 5, metric).unwrap();
                black_box(hits);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_search, bench_distance_heavy_metrics);
criterion_main!(benches);
