//! Integration tests for the public `Database` API.
//!
//! These tests exercise the full engine stack (WAL → store → metadata
//! index → vector index → compaction) through the public
//! `proximadb::{Database, DbConfig, DbError}` surface only. No internal
//! modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, idempotent close, crash-style drops
//! - **CRUD**: add, get, update, update_metadata, delete, double delete
//! - **Search**: cosine/L2/dot/Manhattan k-NN, range search, batches,
//!   filtered queries, oversampling on the indexed path
//! - **Persistence**: WAL replay after restart, snapshot round-trips,
//!   read-only snapshot opens
//! - **Compaction**: synchronous compact, ordinal renumbering, WAL
//!   truncation
//! - **Concurrency**: concurrent readers during writes
//!
//! ## See also
//! - `db::tests` — engine-level unit tests
//! - `index::hnsw::tests` / `index::diskann::tests` — per-index tests
//! - `wal::tests` — log framing and corruption tests

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use proximadb::{
    Database, DbConfig, DbError, Filter, IndexType, MetaValue, Metric,
};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn config(dimension: usize, index_type: IndexType) -> DbConfig {
    DbConfig {
        dimension,
        index_type,
        wal_path: Some(PathBuf::from("db.wal")),
        ..DbConfig::default()
    }
}

fn wave_row(i: usize, dim: usize) -> Vec<f32> {
    (0..dim)
        .map(|d| ((i as f32) + 0.5 * d as f32).sin())
        .collect()
}

fn meta(key: &str, value: &str) -> Vec<(String, MetaValue)> {
    vec![(key.to_string(), MetaValue::Str(value.to_string()))]
}

// ================================================================================================

#[test]
fn test_end_to_end_hnsw_cosine() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path(), config(4, IndexType::Hnsw)).unwrap();

    db.add_vector(&[1.0, 0.0, 0.0, 0.0], &[]).unwrap();
    db.add_vector(&[0.0, 1.0, 0.0, 0.0], &[]).unwrap();
    db.add_vector(&[0.0, 0.0, 1.0, 0.0], &[]).unwrap();
    db.add_vector(&[0.5, 0.5, 0.5, 0.5], &[]).unwrap();

    let hits = db.search(&[1.0, 0.0, 0.0, 0.0], 2, Metric::Cosine).unwrap();
    assert_eq!(hits[0].ordinal, 0);
    assert!(hits[0].distance.abs() < 1e-6);
    assert_eq!(hits[1].ordinal, 3);
    assert!((hits[1].distance - 0.5).abs() < 1e-5);

    db.close().unwrap();
}

#[test]
fn test_end_to_end_diskann_build_and_search() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(8, IndexType::DiskAnn);
    cfg.exact_search_threshold = 0;
    let db = Database::open(tmp.path(), cfg).unwrap();

    for i in 0..64 {
        db.add_vector(&wave_row(i, 8), &[]).unwrap();
    }

    let hits = db.search(&wave_row(0, 8), 5, Metric::L2).unwrap();
    assert_eq!(hits[0].ordinal, 0);
    assert!(hits[0].distance < 1e-3);
    assert_eq!(hits.len(), 5);

    db.close().unwrap();
}

#[test]
fn test_metadata_filter_selects_tagged_row() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path(), config(4, IndexType::Hnsw)).unwrap();

    let tagged = db
        .add_vector(&[1.0, 0.0, 0.0, 0.0], &meta("category", "science"))
        .unwrap();
    db.add_vector(&[0.9, 0.1, 0.0, 0.0], &[]).unwrap();

    let filter = Filter::eq("category", MetaValue::Str("science".into()));
    let hits = db
        .search_filtered(&[1.0, 0.0, 0.0, 0.0], 5, Metric::L2, &filter)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].ordinal, tagged);
}

#[test]
fn test_crash_recovery_via_wal_replay() {
    let tmp = TempDir::new().unwrap();
    {
        let db = Database::open(tmp.path(), config(4, IndexType::Hnsw)).unwrap();
        for i in 0..100 {
            db.add_vector(&[i as f32, 0.0, 0.0, 0.0], &[]).unwrap();
        }
        db.delete_vector(0).unwrap();
        // Dropped without close(): the WAL is the only durable state.
    }

    let db = Database::open(tmp.path(), config(4, IndexType::Hnsw)).unwrap();
    assert!(db.is_deleted(0).unwrap());
    let stats = db.stats().unwrap();
    assert_eq!(stats.count, 100);
    assert_eq!(stats.live_count, 99);
}

#[test]
fn test_snapshot_roundtrip_preserves_search_results() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(8, IndexType::Hnsw);
    cfg.exact_search_threshold = 0;

    let before = {
        let db = Database::open(tmp.path(), cfg.clone()).unwrap();
        for i in 0..50 {
            db.add_vector(&wave_row(i, 8), &meta("i", &i.to_string()))
                .unwrap();
        }
        let hits = db.search(&wave_row(10, 8), 10, Metric::L2).unwrap();
        db.close().unwrap();
        hits
    };

    let db = Database::open(tmp.path(), cfg).unwrap();
    let after = db.search(&wave_row(10, 8), 10, Metric::L2).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_read_only_snapshot_open() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path(), config(4, IndexType::Hnsw)).unwrap();
    db.add_vector(&[1.0, 2.0, 3.0, 4.0], &meta("k", "v")).unwrap();
    db.save().unwrap();
    drop(db);

    let snapshot = tmp.path().join("snapshot.pxdb");
    let mut cfg = config(4, IndexType::Hnsw);
    cfg.wal_path = None;
    let ro = Database::open_read_only(&snapshot, cfg).unwrap();

    let (vector, metadata) = ro.get(0).unwrap();
    assert_eq!(vector, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(metadata[0].0, "k");
    assert!(matches!(
        ro.add_vector(&[0.0; 4], &[]).unwrap_err(),
        DbError::InvalidArgument(_)
    ));
}

#[test]
fn test_cosine_normalized_insert() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(4, IndexType::Hnsw);
    cfg.cosine_normalized = true;
    let db = Database::open(tmp.path(), cfg).unwrap();

    let ordinal = db.add_vector(&[2.0, 0.0, 0.0, 0.0], &[]).unwrap();
    let (stored, _) = db.get(ordinal).unwrap();
    let norm: f32 = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-6);

    let hits = db.search(&[1.0, 0.0, 0.0, 0.0], 1, Metric::Cosine).unwrap();
    assert!(hits[0].distance.abs() < 1e-6);
}

#[test]
fn test_compaction_full_cycle() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path(), config(4, IndexType::Hnsw)).unwrap();

    for i in 0..20 {
        db.add_vector(&[i as f32, 0.0, 0.0, 0.0], &meta("i", &i.to_string()))
            .unwrap();
    }
    for i in 0..10 {
        db.delete_vector(i).unwrap();
    }
    db.compact().unwrap();

    let stats = db.stats().unwrap();
    assert_eq!(stats.count, 10);
    assert_eq!(stats.live_count, 10);
    assert_eq!(stats.deleted_count, 0);
    assert_eq!(stats.wal_bytes, 0);

    // Every surviving row kept its payload; ordinals are packed.
    for ordinal in 0..10 {
        assert!(!db.is_deleted(ordinal).unwrap());
        let (vector, metadata) = db.get(ordinal).unwrap();
        assert_eq!(vector[0], (ordinal + 10) as f32);
        assert_eq!(
            metadata[0].1,
            MetaValue::Str((ordinal + 10).to_string())
        );
    }
}

#[test]
fn test_dot_and_manhattan_metrics() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path(), config(2, IndexType::Exact)).unwrap();
    db.add_vector(&[1.0, 0.0], &[]).unwrap();
    db.add_vector(&[3.0, 0.0], &[]).unwrap();

    // Dot: larger inner product sorts first.
    let hits = db.search(&[1.0, 0.0], 2, Metric::Dot).unwrap();
    assert_eq!(hits[0].ordinal, 1);
    assert_eq!(hits[0].distance, -3.0);

    // Manhattan.
    let hits = db.search(&[0.0, 0.0], 2, Metric::Manhattan).unwrap();
    assert_eq!(hits[0].ordinal, 0);
    assert_eq!(hits[0].distance, 1.0);
}

#[test]
fn test_range_search_and_batches() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path(), config(2, IndexType::Hnsw)).unwrap();
    for i in 0..10 {
        db.add_vector(&[i as f32, 0.0], &[]).unwrap();
    }

    let in_radius = db.range_search(&[0.0, 0.0], 3.5, Metric::L2, None).unwrap();
    let ordinals: Vec<u64> = in_radius.iter().map(|h| h.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2, 3]);

    let batched = db
        .search_batch(
            &[vec![0.0, 0.0], vec![9.0, 0.0]],
            1,
            Metric::L2,
        )
        .unwrap();
    assert_eq!(batched[0][0].ordinal, 0);
    assert_eq!(batched[1][0].ordinal, 9);
}

#[test]
fn test_concurrent_readers_during_writes() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(8, IndexType::Hnsw);
    cfg.wal_path = None; // keep the loop fast
    let db = Arc::new(Database::open(tmp.path(), cfg).unwrap());

    for i in 0..50 {
        db.add_vector(&wave_row(i, 8), &[]).unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 50..150 {
                db.add_vector(&wave_row(i, 8), &[]).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|r| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..50 {
                    let q = wave_row((i + r * 7) % 50, 8);
                    let hits = db.search(&q, 5, Metric::L2).unwrap();
                    // Readers always observe a consistent snapshot:
                    // results are live rows in ascending distance order.
                    for pair in hits.windows(2) {
                        assert!(pair[0].distance <= pair[1].distance);
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(db.stats().unwrap().count, 150);
}

#[test]
fn test_update_then_search_finds_new_value_first() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path(), config(4, IndexType::Hnsw)).unwrap();
    for i in 0..10 {
        db.add_vector(&[i as f32, 0.0, 0.0, 0.0], &[]).unwrap();
    }

    let target = [99.0, 1.0, 2.0, 3.0];
    db.update_vector(4, &target).unwrap();

    let hits = db.search(&target, 1, Metric::L2).unwrap();
    assert_eq!(hits[0].ordinal, 4);
    assert!(hits[0].distance < 1e-5);
}

#[test]
fn test_stats_shape() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path(), config(4, IndexType::Hnsw)).unwrap();
    db.add_vector(&[0.0; 4], &[]).unwrap();
    db.search(&[0.0; 4], 1, Metric::L2).unwrap();

    let stats = db.stats().unwrap();
    assert_eq!(stats.dimension, 4);
    assert_eq!(stats.index_type, IndexType::Hnsw);
    assert_eq!(stats.count, 1);
    assert_eq!(stats.search_count, 1);
    assert_eq!(stats.mutation_count, 1);
    assert!(stats.wal_bytes > 0);
}
