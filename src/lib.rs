//! # ProximaDB
//!
//! An embeddable, persistent **vector database engine**. Stores
//! fixed-dimensional `f32` vectors with typed metadata, indexes them for
//! approximate and exact nearest-neighbor retrieval, and keeps every
//! mutation durable through a write-ahead log.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      Database                          │
//! │  ┌────────────┐  ┌───────────────┐  ┌──────────────┐   │
//! │  │ SoA vector │  │  Metadata     │  │ Vector index │   │
//! │  │ store      │  │  inverted     │  │ HNSW | Disk- │   │
//! │  │ + tombs    │  │  index        │  │ ANN | Exact  │   │
//! │  └─────┬──────┘  └──────┬────────┘  └──────┬───────┘   │
//! │        │    mutations flow WAL-first       │           │
//! │  ┌─────┴─────────────────┴─────────────────┴────────┐  │
//! │  │          Write-ahead log (CRC-protected)         │  │
//! │  └──────────────────────────────────────────────────┘  │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │  Compactor (tombstone reclaim + index rebuild)   │  │
//! │  └──────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Database composition — open, mutate, search, snapshot, stats |
//! | [`store`] | Structure-of-arrays vector store with tombstones |
//! | [`metadata`] | Inverted metadata index and filter evaluation |
//! | [`distance`] | Distance kernels (L2, cosine, dot, Manhattan) |
//! | [`index`] | Pluggable vector indexes — HNSW and DiskANN/Vamana |
//! | [`wal`] | Generic, CRC-protected write-ahead log |
//! | [`compaction`] | Synchronous compaction pass and background worker |
//! | [`encoding`] | Deterministic binary wire format for persistence |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation is persisted and fsynced
//!   before being acknowledged; crash recovery replays the log on open.
//! - **Tombstoned deletes** — rows die logically and keep their ordinal
//!   until a compaction pass rewrites the store.
//! - **Pluggable indexes** — an in-memory HNSW small-world graph
//!   (optionally binary-quantized) and an SSD-resident DiskANN/Vamana
//!   graph with a product-quantized navigator and an LRU page cache.
//! - **Metadata filtering** — compound AND/OR/NOT filters evaluated
//!   against an inverted index, with oversampling on approximate indexes.
//! - **Snapshots** — a single CRC-trailed file that can be memory-mapped
//!   and opened read-only without a WAL.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use proximadb::{Database, DbConfig, Metric};
//!
//! let config = DbConfig {
//!     dimension: 4,
//!     ..DbConfig::default()
//! };
//!
//! let db = Database::open("/tmp/my_vectors", config).unwrap();
//!
//! // Insert
//! let id = db.add_vector(&[0.1, 0.2, 0.3, 0.4], &[]).unwrap();
//!
//! // Search
//! let hits = db.search(&[0.1, 0.2, 0.3, 0.4], 5, Metric::Cosine).unwrap();
//! assert_eq!(hits[0].ordinal, id);
//!
//! // Delete
//! db.delete_vector(id).unwrap();
//!
//! // Graceful shutdown
//! db.close().unwrap();
//! ```

pub mod compaction;
pub mod db;
pub mod distance;
pub mod encoding;
pub mod index;
pub mod metadata;
pub mod store;
pub mod wal;

pub use db::{Database, DbConfig, DbError, DbStats, SearchResult};
pub use distance::Metric;
pub use index::IndexType;
pub use metadata::{CmpOp, Filter, MetaValue};
pub use store::RowId;
