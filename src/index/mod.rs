//! Pluggable vector-index layer.
//!
//! The database holds exactly one active index behind the
//! [`VectorIndex`] trait: build, incremental insert/remove/update, k-NN
//! and range search, and snapshot serialization are the uniform
//! contract. Two implementations ship:
//!
//! - [`hnsw::HnswIndex`] — an in-memory hierarchical small-world graph,
//!   optionally binary-quantized.
//! - [`diskann::DiskAnnIndex`] — a Vamana graph whose full vectors live
//!   in a sector-aligned file on disk, navigated by product-quantized
//!   codes in RAM through an LRU page cache.
//!
//! Indexes address rows **by ordinal only** — graph nodes live in
//! ordinal-keyed arenas and neighbor lists store ordinals, never
//! pointers, which keeps save/load symmetric with the in-memory
//! representation.
//!
//! The exact-scan strategy has no index structure at all; the database
//! dispatcher (`db` module) linearly scans the store when the active
//! index is [`IndexType::Exact`] or the row count is below the exact
//! threshold.

pub mod diskann;
pub mod hnsw;

use std::io;

use thiserror::Error;

use crate::distance::Metric;
use crate::encoding::EncodingError;
use crate::store::{RowId, StoreError, VectorStore};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Underlying I/O error (DiskANN slot file, save/load).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error in a save file.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Bad magic, version, or structurally impossible save data.
    #[error("Format error: {0}")]
    Format(String),

    /// A codebook-requiring operation ran before the index was built.
    #[error("Index not trained")]
    NotTrained,

    /// The operation is unsupported by the active index type.
    #[error("Index incompatible: {0}")]
    Incompatible(String),

    /// Invalid parameter (k = 0, negative radius, bad tuning).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Error surfaced from the vector store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Shared types
// ------------------------------------------------------------------------------------------------

/// Which index variant a database runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// Hierarchical small-world graph, fully in memory.
    Hnsw,
    /// Vamana graph with on-disk vectors and a PQ navigator.
    DiskAnn,
    /// No index — every query linearly scans the store.
    Exact,
}

impl IndexType {
    /// Stable on-disk tag for the snapshot header.
    pub fn as_tag(self) -> u32 {
        match self {
            IndexType::Hnsw => 0,
            IndexType::DiskAnn => 1,
            IndexType::Exact => 2,
        }
    }

    /// Inverse of [`IndexType::as_tag`].
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(IndexType::Hnsw),
            1 => Some(IndexType::DiskAnn),
            2 => Some(IndexType::Exact),
            _ => None,
        }
    }
}

/// One search hit: a live row ordinal and its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Row ordinal.
    pub ordinal: RowId,
    /// Distance under the query's metric (smaller = closer).
    pub distance: f32,
}

/// One row recovered from an index save block (snapshot format ≥ 2
/// embeds vectors and metadata inside the index block), used to rebuild
/// the store on load. Rows appear in ordinal order; tombstoned rows are
/// present so ordinals survive the round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRow {
    /// Row components.
    pub vector: Vec<f32>,
    /// Metadata chain.
    pub metadata: Vec<crate::metadata::MetaPair>,
    /// Whether the row was tombstoned at save time.
    pub deleted: bool,
}

/// Per-query knobs threaded through the dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    /// Override the index's configured beam width for this query.
    pub ef_override: Option<usize>,
    /// Whether a metadata filter will post-filter the results. HNSW
    /// widens its beam for filtered queries when ACORN is enabled.
    pub filtered: bool,
}

// ------------------------------------------------------------------------------------------------
// The uniform index contract
// ------------------------------------------------------------------------------------------------

/// Uniform operations over the active index variant.
///
/// All mutating operations run under the database write guard; searches
/// run under the read guard (DiskANN's page cache uses its own interior
/// mutex so reads stay shareable).
pub trait VectorIndex: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> IndexType;

    /// Number of indexed nodes, including tombstoned ones.
    fn len(&self) -> usize;

    /// Whether the index holds no nodes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard any existing graph and index every live row of `store`.
    fn build(&mut self, store: &VectorStore) -> Result<(), IndexError>;

    /// Index one newly-appended row.
    fn insert(&mut self, store: &VectorStore, ordinal: RowId) -> Result<(), IndexError>;

    /// Tombstone one row in the index.
    fn remove(&mut self, store: &VectorStore, ordinal: RowId) -> Result<(), IndexError>;

    /// Re-index one row after an in-place vector overwrite.
    fn update(&mut self, store: &VectorStore, ordinal: RowId) -> Result<(), IndexError>;

    /// k-nearest-neighbor search. Returns at most `k` live ordinals in
    /// non-decreasing distance order; never a tombstoned row.
    fn search(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Metric,
        opts: &SearchOptions,
    ) -> Result<Vec<Neighbor>, IndexError>;

    /// Range search: every live row within `radius`, closest first,
    /// truncated at `max_results` when given.
    fn range_search(
        &self,
        store: &VectorStore,
        query: &[f32],
        radius: f32,
        metric: Metric,
        max_results: Option<usize>,
    ) -> Result<Vec<Neighbor>, IndexError>;

    /// Serialize the index (including per-row metadata chains, snapshot
    /// format ≥ 2) into `buf`.
    fn save_to(&self, store: &VectorStore, buf: &mut Vec<u8>) -> Result<(), IndexError>;
}

// ------------------------------------------------------------------------------------------------
// Shared helpers
// ------------------------------------------------------------------------------------------------

/// Sort neighbors by distance, tie-breaking on ordinal so result order
/// is deterministic across runs and reloads.
pub(crate) fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.ordinal.cmp(&b.ordinal))
    });
}

/// Validate the `k` of a k-NN call.
pub(crate) fn check_k(k: usize) -> Result<(), IndexError> {
    if k == 0 {
        return Err(IndexError::InvalidArgument("k must be non-zero".into()));
    }
    Ok(())
}
