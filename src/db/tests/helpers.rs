use std::path::PathBuf;

use crate::db::{Database, DbConfig};
use crate::index::IndexType;
use crate::metadata::{MetaPair, MetaValue};

/// Config for a 4-dimensional HNSW database with WAL enabled.
pub fn hnsw_config() -> DbConfig {
    DbConfig {
        dimension: 4,
        index_type: IndexType::Hnsw,
        wal_path: Some(PathBuf::from("db.wal")),
        ..DbConfig::default()
    }
}

/// Config running every query through the exact-scan path.
pub fn exact_config(dimension: usize) -> DbConfig {
    DbConfig {
        dimension,
        index_type: IndexType::Exact,
        wal_path: Some(PathBuf::from("db.wal")),
        ..DbConfig::default()
    }
}

/// Force the indexed path even for tiny row counts.
pub fn indexed(mut config: DbConfig) -> DbConfig {
    config.exact_search_threshold = 0;
    config
}

pub fn open(dir: &std::path::Path, config: DbConfig) -> Database {
    Database::open(dir, config).expect("open database")
}

pub fn tag(key: &str, value: &str) -> Vec<MetaPair> {
    vec![(key.to_string(), MetaValue::Str(value.to_string()))]
}

/// Deterministic pseudo-random row.
pub fn synthetic_row(i: usize, dim: usize) -> Vec<f32> {
    (0..dim)
        .map(|d| ((i * 31 + d * 7) % 997) as f32 / 997.0 - 0.5)
        .collect()
}
