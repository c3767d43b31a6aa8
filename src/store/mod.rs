//! Structure-of-arrays vector store.
//!
//! The authoritative data plane of the engine: one contiguous `f32`
//! buffer holding `count · dimension` components, with parallel arrays
//! for tombstone flags and per-row metadata chains.
//!
//! ## Design Invariants
//!
//! - A row is identified by its **ordinal** — the 64-bit insertion
//!   number. Rows are never renumbered while the store lives; ordinals
//!   survive tombstoning and are reassigned only when compaction builds
//!   a replacement store.
//! - Every row (live or tombstoned) keeps exactly `dimension` floats of
//!   storage. The dimension is fixed at construction.
//! - Tombstoned rows are invisible to `get_view` and `iter_live` but
//!   their bytes remain addressable through [`VectorStore::vector_raw`],
//!   because graph indexes may still traverse *through* them.
//! - `count = live_count + tombstones`, always.
//!
//! ## Growth
//!
//! The buffer grows by capacity doubling using `try_reserve_exact`, so
//! allocation failure surfaces as [`StoreError::OutOfMemory`] instead of
//! aborting the process.
//!
//! ## Ownership
//!
//! The store exclusively owns all row bytes. Views handed out are plain
//! borrows whose lifetime is bounded by the caller's read guard on the
//! database.


use thiserror::Error;
use tracing::trace;

use crate::metadata::MetaPair;

/// Stable 64-bit row ordinal — the identity of a vector across its
/// lifetime.
pub type RowId = u64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row had the wrong number of components.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The store's fixed dimension.
        expected: usize,
        /// The offending row length.
        actual: usize,
    },

    /// The ordinal is outside `0..count`.
    #[error("row {0} not found")]
    NotFound(RowId),

    /// The row exists but is tombstoned.
    #[error("row {0} is deleted")]
    Deleted(RowId),

    /// The row was already tombstoned when a delete was requested.
    #[error("row {0} already deleted")]
    AlreadyDeleted(RowId),

    /// Buffer growth failed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Invalid construction parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// Row view
// ------------------------------------------------------------------------------------------------

/// Borrowed view of one live row.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    /// The row's ordinal.
    pub ordinal: RowId,
    /// The row's `dimension` components.
    pub vector: &'a [f32],
    /// The row's metadata chain (possibly empty).
    pub metadata: &'a [MetaPair],
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

/// Dense structure-of-arrays storage for fixed-dimension rows.
#[derive(Debug)]
pub struct VectorStore {
    /// Fixed row dimension.
    dimension: usize,

    /// `count · dimension` components, row-major.
    data: Vec<f32>,

    /// Tombstone flag per row.
    tombstones: Vec<bool>,

    /// Metadata chain per row. An empty chain means "no metadata".
    metadata: Vec<Vec<MetaPair>>,

    /// Number of rows that are not tombstoned.
    live_count: usize,
}

impl VectorStore {
    /// Create an empty store with the given fixed dimension.
    pub fn new(dimension: usize) -> Result<Self, StoreError> {
        if dimension == 0 {
            return Err(StoreError::InvalidArgument(
                "dimension must be non-zero".into(),
            ));
        }
        Ok(Self {
            dimension,
            data: Vec::new(),
            tombstones: Vec::new(),
            metadata: Vec::new(),
            live_count: 0,
        })
    }

    /// The fixed row dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Total number of rows ever appended (the next ordinal).
    pub fn count(&self) -> u64 {
        self.tombstones.len() as u64
    }

    /// Number of rows that are not tombstoned.
    pub fn live_count(&self) -> u64 {
        self.live_count as u64
    }

    /// Number of tombstoned rows awaiting compaction.
    pub fn deleted_count(&self) -> u64 {
        self.count() - self.live_count()
    }

    /// Grow the data buffer to hold one more row, doubling capacity.
    fn reserve_row(&mut self) -> Result<(), StoreError> {
        let needed = self.data.len() + self.dimension;
        if needed > self.data.capacity() {
            let target = needed.max(self.data.capacity() * 2);
            self.data
                .try_reserve_exact(target - self.data.len())
                .map_err(|e| StoreError::OutOfMemory(e.to_string()))?;
        }
        self.tombstones
            .try_reserve(1)
            .map_err(|e| StoreError::OutOfMemory(e.to_string()))?;
        self.metadata
            .try_reserve(1)
            .map_err(|e| StoreError::OutOfMemory(e.to_string()))?;
        Ok(())
    }

    /// Append a row and return its ordinal.
    pub fn add(&mut self, row: &[f32], metadata: Vec<MetaPair>) -> Result<RowId, StoreError> {
        if row.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: row.len(),
            });
        }
        self.reserve_row()?;

        let ordinal = self.count();
        self.data.extend_from_slice(row);
        self.tombstones.push(false);
        self.metadata.push(metadata);
        self.live_count += 1;

        trace!(ordinal, "row appended");
        Ok(ordinal)
    }

    /// Borrow a live row.
    ///
    /// Fails `NotFound` for out-of-range ordinals and `Deleted` for
    /// tombstoned rows; callers that treat the two alike map the latter.
    pub fn get_view(&self, ordinal: RowId) -> Result<RowView<'_>, StoreError> {
        let idx = self.index_of(ordinal)?;
        if self.tombstones[idx] {
            return Err(StoreError::Deleted(ordinal));
        }
        Ok(RowView {
            ordinal,
            vector: self.row_slice(idx),
            metadata: &self.metadata[idx],
        })
    }

    /// Borrow a row's components regardless of its tombstone flag.
    ///
    /// Graph indexes traverse *through* tombstoned rows, so this only
    /// bounds-checks. Returns `None` for out-of-range ordinals.
    #[inline]
    pub fn vector_raw(&self, ordinal: RowId) -> Option<&[f32]> {
        let idx = usize::try_from(ordinal).ok()?;
        if idx >= self.tombstones.len() {
            return None;
        }
        Some(self.row_slice(idx))
    }

    /// Tombstone a row.
    pub fn mark_deleted(&mut self, ordinal: RowId) -> Result<(), StoreError> {
        let idx = self.index_of(ordinal)?;
        if self.tombstones[idx] {
            return Err(StoreError::AlreadyDeleted(ordinal));
        }
        self.tombstones[idx] = true;
        self.live_count -= 1;
        trace!(ordinal, "row tombstoned");
        Ok(())
    }

    /// Whether a row is tombstoned. Out-of-range ordinals are
    /// `NotFound`, never "deleted".
    pub fn is_deleted(&self, ordinal: RowId) -> Result<bool, StoreError> {
        let idx = self.index_of(ordinal)?;
        Ok(self.tombstones[idx])
    }

    /// Overwrite a live row's components in place.
    ///
    /// Touches no metadata.
    pub fn update_data(&mut self, ordinal: RowId, row: &[f32]) -> Result<(), StoreError> {
        if row.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: row.len(),
            });
        }
        let idx = self.index_of(ordinal)?;
        if self.tombstones[idx] {
            return Err(StoreError::Deleted(ordinal));
        }
        let start = idx * self.dimension;
        self.data[start..start + self.dimension].copy_from_slice(row);
        Ok(())
    }

    /// Replace a live row's metadata chain, returning the old chain.
    ///
    /// The caller must update the metadata index in the same critical
    /// section; the returned chain is what has to be un-registered.
    pub fn set_metadata(
        &mut self,
        ordinal: RowId,
        metadata: Vec<MetaPair>,
    ) -> Result<Vec<MetaPair>, StoreError> {
        let idx = self.index_of(ordinal)?;
        if self.tombstones[idx] {
            return Err(StoreError::Deleted(ordinal));
        }
        Ok(std::mem::replace(&mut self.metadata[idx], metadata))
    }

    /// Borrow a live row's metadata chain.
    pub fn metadata(&self, ordinal: RowId) -> Result<&[MetaPair], StoreError> {
        let idx = self.index_of(ordinal)?;
        if self.tombstones[idx] {
            return Err(StoreError::Deleted(ordinal));
        }
        Ok(&self.metadata[idx])
    }

    /// Iterate every live row in ordinal order.
    pub fn iter_live(&self) -> impl Iterator<Item = RowView<'_>> {
        (0..self.tombstones.len()).filter_map(move |idx| {
            if self.tombstones[idx] {
                return None;
            }
            Some(RowView {
                ordinal: idx as RowId,
                vector: self.row_slice(idx),
                metadata: &self.metadata[idx],
            })
        })
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    #[inline]
    fn index_of(&self, ordinal: RowId) -> Result<usize, StoreError> {
        let idx =
            usize::try_from(ordinal).map_err(|_| StoreError::NotFound(ordinal))?;
        if idx >= self.tombstones.len() {
            return Err(StoreError::NotFound(ordinal));
        }
        Ok(idx)
    }

    #[inline]
    fn row_slice(&self, idx: usize) -> &[f32] {
        let start = idx * self.dimension;
        &self.data[start..start + self.dimension]
    }
}
