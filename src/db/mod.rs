//! # Database composition layer
//!
//! Ties the subsystems together: the SoA [`VectorStore`], the
//! [`MetadataIndex`], the active vector index, the WAL, and the
//! background compactor.
//!
//! ## Data flow
//!
//! A mutation acquires the write lock, is framed as a [`WalRecord`] and
//! appended (fsynced) to the WAL, is applied to the store, registered
//! with the metadata index, and propagated to the active index. A query
//! acquires the read lock, selects a strategy (exact scan below the
//! threshold, indexed otherwise), optionally oversamples for filtered
//! approximate search, and returns the top k.
//!
//! ## Concurrency Model
//!
//! - One `RwLock` over the mutable engine state (`store`, metadata
//!   index, vector index).
//! - A dedicated mutex over the WAL handle, so appends serialize
//!   independently of readers and `set_wal`/`disable_wal` swap safely.
//! - A third mutex over the observability counters.
//! - The compactor worker has its own mutex + condvar (see
//!   [`crate::compaction`]).
//!
//! Writes on a single row are linearizable under the write lock; WAL
//! records are appended in lock-acquisition order; readers observe
//! every write that completed before their guard was acquired.
//!
//! ## Durability
//!
//! A successful `add`/`update`/`delete` returns only after the WAL
//! fsync succeeds; a failed append aborts the mutation with the
//! database unchanged. A crash between WAL commit and index update is
//! resolved by replay on the next open. Compaction persists a snapshot
//! of the compacted state **before** truncating the WAL, so the log's
//! base state is always on disk.
//!
//! ## Snapshot format
//!
//! ```text
//! [magic "PXDB"][version u32][dimension u32][index-type u32]
//! [index-specific block (vectors + metadata embedded, format >= 2)]
//! [crc32 over all preceding bytes]
//! ```
//!
//! Snapshots are memory-mapped on load and can be opened read-only
//! without a WAL via [`Database::open_read_only`].

#[cfg(test)]
mod tests;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compaction::{self, Compactor};
use crate::distance::{Metric, normalize};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::index::diskann::{DiskAnnConfig, DiskAnnIndex};
use crate::index::hnsw::{HnswConfig, HnswIndex};
use crate::index::{
    IndexError, IndexType, LoadedRow, Neighbor, SearchOptions, VectorIndex,
};
use crate::metadata::{
    EncodedPair, Filter, MetaPair, MetadataIndex, from_encoded_pairs, to_encoded_pairs,
};
use crate::store::{RowId, StoreError, VectorStore};
use crate::wal::{Wal, WalError, WalRecord};

/// Snapshot file name inside the database directory.
pub const SNAPSHOT_FILE: &str = "snapshot.pxdb";

/// Magic bytes opening every snapshot file.
pub const DB_MAGIC: [u8; 4] = *b"PXDB";

/// Snapshot format version. Version 2 embeds per-row metadata inside
/// each index block.
pub const DB_VERSION: u32 = 2;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Unified error type of the public database surface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Null/zero/ill-formed parameter or configuration.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The ordinal (or key) does not exist.
    #[error("Row {0} not found")]
    NotFound(RowId),

    /// The row was already tombstoned.
    #[error("Row {0} already deleted")]
    AlreadyDeleted(RowId),

    /// A vector had the wrong number of components.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The database dimension.
        expected: usize,
        /// The offending length.
        actual: usize,
    },

    /// Bad magic, version, or CRC in a persisted file.
    #[error("Format error: {0}")]
    FormatError(String),

    /// Disk read/write/open failure.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Allocation failure.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Surfaced from external collaborators (quota/tier managers); the
    /// core never raises it itself.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A codebook-requiring search ran before build.
    #[error("Index not trained")]
    NotTrained,

    /// Operation unsupported by the active index type.
    #[error("Index incompatible: {0}")]
    IndexIncompatible(String),

    /// WAL failure (the originating mutation was aborted).
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Serialization failure.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for DbError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DimensionMismatch { expected, actual } => {
                DbError::DimensionMismatch { expected, actual }
            }
            StoreError::NotFound(o) => DbError::NotFound(o),
            StoreError::Deleted(o) | StoreError::AlreadyDeleted(o) => DbError::AlreadyDeleted(o),
            StoreError::OutOfMemory(s) => DbError::OutOfMemory(s),
            StoreError::InvalidArgument(s) => DbError::InvalidArgument(s),
        }
    }
}

impl From<IndexError> for DbError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Io(e) => DbError::IoError(e),
            IndexError::Encoding(e) => DbError::Encoding(e),
            IndexError::Format(s) => DbError::FormatError(s),
            IndexError::NotTrained => DbError::NotTrained,
            IndexError::Incompatible(s) => DbError::IndexIncompatible(s),
            IndexError::InvalidArgument(s) => DbError::InvalidArgument(s),
            IndexError::Store(e) => e.into(),
            IndexError::Internal(s) => DbError::Internal(s),
        }
    }
}

impl From<compaction::CompactionError> for DbError {
    fn from(e: compaction::CompactionError) -> Self {
        match e {
            compaction::CompactionError::Store(e) => e.into(),
            compaction::CompactionError::Internal(s) => DbError::Internal(s),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Database`]. All options are programmatic —
/// there is no command-line surface.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Fixed vector dimension. Must be set; zero is rejected at open.
    pub dimension: usize,

    /// Which index variant to run.
    pub index_type: IndexType,

    /// Metric the index builds its graph under.
    pub metric: Metric,

    /// HNSW tuning (used when `index_type` is [`IndexType::Hnsw`]).
    pub hnsw: HnswConfig,

    /// DiskANN tuning (used when `index_type` is [`IndexType::DiskAnn`]).
    pub diskann: DiskAnnConfig,

    /// At or below this live row count, queries linearly scan the store.
    pub exact_search_threshold: u64,

    /// Force every query down the exact-scan path.
    pub force_exact_search: bool,

    /// Normalize every inserted/updated vector to unit L2 norm.
    pub cosine_normalized: bool,

    /// WAL file path; `None` disables write-ahead logging. Relative
    /// paths resolve against the database directory.
    pub wal_path: Option<PathBuf>,

    /// Background compaction interval in seconds; 0 disables the worker
    /// (synchronous [`Database::compact`] still works).
    pub compaction_interval_sec: u64,

    /// WAL size in bytes that triggers compaction; 0 disables the
    /// trigger.
    pub wal_compaction_threshold: u64,

    /// Tombstone ratio (`0..=1`) that triggers compaction.
    pub deleted_ratio_threshold: f64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            dimension: 0,
            index_type: IndexType::Hnsw,
            metric: Metric::L2,
            hnsw: HnswConfig::default(),
            diskann: DiskAnnConfig::default(),
            exact_search_threshold: 100,
            force_exact_search: false,
            cosine_normalized: false,
            wal_path: None,
            compaction_interval_sec: 0,
            wal_compaction_threshold: 128 * 1024 * 1024,
            deleted_ratio_threshold: 0.3,
        }
    }
}

impl DbConfig {
    /// Default search depth of the active index — the beam an unfiltered
    /// query would run with. Sizes the oversample pool when a filter
    /// cannot be served from posting lists.
    fn search_depth(&self) -> usize {
        match self.index_type {
            IndexType::Hnsw => self.hnsw.ef_search,
            IndexType::DiskAnn => self.diskann.search_beam_width,
            // The exact path filters during its scan and never
            // oversamples.
            IndexType::Exact => 0,
        }
    }

    fn validate(&self) -> Result<(), DbError> {
        if self.dimension == 0 {
            return Err(DbError::InvalidArgument("dimension must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.deleted_ratio_threshold) {
            return Err(DbError::InvalidArgument(format!(
                "deleted_ratio_threshold must be in 0..=1, got {}",
                self.deleted_ratio_threshold
            )));
        }
        match self.index_type {
            IndexType::Hnsw => self.hnsw.validate()?,
            IndexType::DiskAnn => self.diskann.validate()?,
            IndexType::Exact => {}
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Results and stats
// ------------------------------------------------------------------------------------------------

/// One search hit with its row payload.
///
/// The vector and metadata are owned copies — results stay valid after
/// the internal read guard is released.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Row ordinal.
    pub ordinal: RowId,
    /// Distance under the query metric (smaller = closer).
    pub distance: f32,
    /// The row's components.
    pub vector: Vec<f32>,
    /// The row's metadata chain.
    pub metadata: Vec<MetaPair>,
}

/// Snapshot of database statistics returned by [`Database::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct DbStats {
    /// Fixed vector dimension.
    pub dimension: usize,
    /// Active index variant.
    pub index_type: IndexType,
    /// Total rows ever appended (next ordinal).
    pub count: u64,
    /// Rows that are not tombstoned.
    pub live_count: u64,
    /// Tombstoned rows awaiting compaction.
    pub deleted_count: u64,
    /// Current WAL size in bytes (0 when disabled).
    pub wal_bytes: u64,
    /// Queries served since open.
    pub search_count: u64,
    /// Mutations applied since open.
    pub mutation_count: u64,
    /// Compaction passes completed since open.
    pub compaction_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    searches: u64,
    mutations: u64,
    compactions: u64,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// Engine state guarded by the database `RwLock`.
struct DbInner {
    store: VectorStore,
    metadata: MetadataIndex,
    /// `None` when running [`IndexType::Exact`].
    index: Option<Box<dyn VectorIndex>>,
}

struct DatabaseShared {
    inner: RwLock<DbInner>,
    /// WAL handle behind its own mutex so appends serialize
    /// independently of reads and handle swaps are race-free.
    wal: Mutex<Option<Wal<WalRecord>>>,
    /// Observability counters behind the third mutex.
    counters: Mutex<Counters>,
    /// Set while open() replays the WAL so the replay is not re-logged.
    wal_replaying: AtomicBool,
    /// Read-only databases reject every mutation.
    read_only: bool,
    /// Database directory (`None` for read-only snapshot opens).
    dir: Option<PathBuf>,
    config: DbConfig,
    /// Background worker; stopped on close.
    compactor: Mutex<Option<Compactor>>,
    closed: AtomicBool,
}

/// The embeddable vector database.
///
/// Cheap to clone — clones share the same engine state.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DatabaseShared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dimension", &self.shared.config.dimension)
            .field("index_type", &self.shared.config.index_type)
            .field("read_only", &self.shared.read_only)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Lifecycle
// ------------------------------------------------------------------------------------------------

impl Database {
    /// Open (or create) a database rooted at `dir`.
    ///
    /// On a fresh directory an empty store and index are created. On an
    /// existing directory the snapshot (if any) is loaded and the WAL
    /// (if configured) is replayed on top of it.
    pub fn open(dir: impl AsRef<Path>, mut config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // Resolve relative collaborator paths against the directory.
        if config.diskann.data_path.is_relative() {
            config.diskann.data_path = dir.join(&config.diskann.data_path);
        }
        if let Some(wal_path) = config.wal_path.take() {
            config.wal_path = Some(if wal_path.is_relative() {
                dir.join(wal_path)
            } else {
                wal_path
            });
        }

        // 1. Load the snapshot or start fresh.
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let (store, metadata, index) = if snapshot_path.exists() {
            load_snapshot(&snapshot_path, &config)?
        } else {
            let store = VectorStore::new(config.dimension)?;
            let index = make_index(&config)?;
            (store, MetadataIndex::new(), index)
        };

        // 2. Open the WAL.
        let wal = match &config.wal_path {
            Some(path) => Some(Wal::open(path, None)?),
            None => None,
        };

        let shared = Arc::new(DatabaseShared {
            inner: RwLock::new(DbInner {
                store,
                metadata,
                index,
            }),
            wal: Mutex::new(wal),
            counters: Mutex::new(Counters::default()),
            wal_replaying: AtomicBool::new(false),
            read_only: false,
            dir: Some(dir.clone()),
            config: config.clone(),
            compactor: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let db = Self { shared };

        // 3. Replay the WAL over the loaded base state.
        db.replay_wal()?;

        // 4. Start the background compactor.
        if config.compaction_interval_sec > 0 {
            let weak = Arc::downgrade(&db.shared);
            let compactor = Compactor::spawn(
                Duration::from_secs(config.compaction_interval_sec),
                move || {
                    if let Some(shared) = weak.upgrade() {
                        let db = Database { shared };
                        db.compact_if_needed();
                    }
                },
            );
            *db.shared
                .compactor
                .lock()
                .map_err(|_| DbError::Internal("compactor mutex poisoned".into()))? =
                Some(compactor);
        }

        info!(
            dir = %dir.display(),
            dimension = config.dimension,
            index_type = ?config.index_type,
            wal = config.wal_path.is_some(),
            "database opened"
        );
        Ok(db)
    }

    /// Open a snapshot file read-only: no WAL, no compactor, every
    /// mutation rejected. The snapshot is memory-mapped for the load.
    pub fn open_read_only(snapshot: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;
        let (store, metadata, index) = load_snapshot(snapshot.as_ref(), &config)?;

        let shared = Arc::new(DatabaseShared {
            inner: RwLock::new(DbInner {
                store,
                metadata,
                index,
            }),
            wal: Mutex::new(None),
            counters: Mutex::new(Counters::default()),
            wal_replaying: AtomicBool::new(false),
            read_only: true,
            dir: None,
            config,
            compactor: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        Ok(Self { shared })
    }

    /// Gracefully shut down: stop the compactor, persist a snapshot,
    /// and truncate the WAL. Idempotent.
    pub fn close(&self) -> Result<(), DbError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut slot) = self.shared.compactor.lock() {
            if let Some(mut compactor) = slot.take() {
                compactor.stop();
            }
        }
        if self.shared.read_only {
            return Ok(());
        }

        let inner = self
            .shared
            .inner
            .read()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        self.save_snapshot_locked(&inner)?;
        drop(inner);

        let wal = self
            .shared
            .wal
            .lock()
            .map_err(|_| DbError::Internal("WAL mutex poisoned".into()))?;
        if let Some(wal) = wal.as_ref() {
            wal.truncate()?;
        }
        info!("database closed");
        Ok(())
    }

    /// Persist a snapshot of the current state to the database
    /// directory.
    pub fn save(&self) -> Result<(), DbError> {
        self.ensure_writable()?;
        let inner = self
            .shared
            .inner
            .read()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        self.save_snapshot_locked(&inner)
    }

    fn ensure_writable(&self) -> Result<(), DbError> {
        if self.shared.read_only {
            return Err(DbError::InvalidArgument(
                "database is open read-only".into(),
            ));
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // WAL plumbing
    // --------------------------------------------------------------------------------------------

    /// Append one record, unless logging is disabled or a replay is in
    /// progress. A failure here aborts the originating mutation.
    fn append_wal(&self, record: &WalRecord) -> Result<(), DbError> {
        if self.shared.wal_replaying.load(Ordering::Acquire) {
            return Ok(());
        }
        let wal = self
            .shared
            .wal
            .lock()
            .map_err(|_| DbError::Internal("WAL mutex poisoned".into()))?;
        if let Some(wal) = wal.as_ref() {
            wal.append(record)?;
        }
        Ok(())
    }

    /// Replay every intact WAL record through the normal apply paths.
    ///
    /// A torn tail ends the replay and is truncated away, so the next
    /// append lands directly after the last durable record.
    fn replay_wal(&self) -> Result<(), DbError> {
        let mut iter = {
            let wal = self
                .shared
                .wal
                .lock()
                .map_err(|_| DbError::Internal("WAL mutex poisoned".into()))?;
            match wal.as_ref() {
                Some(wal) => wal.replay_iter(),
                None => return Ok(()),
            }
        };

        self.shared.wal_replaying.store(true, Ordering::Release);
        let mut replayed = 0u64;
        let mut torn_at: Option<u64> = None;
        let result = (|| {
            while let Some(record) = iter.next() {
                match record {
                    Ok(record) => {
                        self.apply_record(record)?;
                        replayed += 1;
                    }
                    Err(e) if e.is_torn_tail() => {
                        warn!(error = %e, replayed, "WAL replay stopped at torn tail");
                        torn_at = Some(iter.offset());
                        break;
                    }
                    Err(e) => return Err(DbError::Wal(e)),
                }
            }
            Ok(())
        })();
        self.shared.wal_replaying.store(false, Ordering::Release);
        result?;

        if let Some(valid_len) = torn_at {
            let wal = self
                .shared
                .wal
                .lock()
                .map_err(|_| DbError::Internal("WAL mutex poisoned".into()))?;
            if let Some(wal) = wal.as_ref() {
                wal.truncate_to(valid_len)?;
            }
        }
        if replayed > 0 {
            info!(replayed, "WAL replay complete");
        }
        Ok(())
    }

    /// Apply one replayed record. Deletes of already-deleted rows and
    /// references to vanished ordinals are tolerated — the log may
    /// legitimately be ahead of a snapshot taken mid-sequence.
    fn apply_record(&self, record: WalRecord) -> Result<(), DbError> {
        let mut inner = self
            .shared
            .inner
            .write()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        let inner = &mut *inner;

        let result = match record {
            WalRecord::Insert { vector, metadata } => {
                Self::apply_insert(inner, vector, from_encoded_pairs(metadata)).map(|_| ())
            }
            WalRecord::Update { ordinal, vector } => Self::apply_update(inner, ordinal, &vector),
            WalRecord::Delete { ordinal } => Self::apply_delete(inner, ordinal),
            WalRecord::MetadataUpdate { ordinal, metadata } => {
                Self::apply_metadata(inner, ordinal, from_encoded_pairs(metadata))
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(DbError::NotFound(o)) | Err(DbError::AlreadyDeleted(o)) => {
                warn!(ordinal = o, "skipping stale record during replay");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Render the WAL for operator diagnostics.
    pub fn dump_wal<W: Write>(&self, out: &mut W) -> Result<(), DbError> {
        let wal = self
            .shared
            .wal
            .lock()
            .map_err(|_| DbError::Internal("WAL mutex poisoned".into()))?;
        match wal.as_ref() {
            Some(wal) => Ok(wal.dump(out)?),
            None => Err(DbError::InvalidArgument("no WAL configured".into())),
        }
    }

    /// Flush and drop the WAL handle; subsequent mutations are not
    /// logged.
    pub fn disable_wal(&self) -> Result<(), DbError> {
        let mut wal = self
            .shared
            .wal
            .lock()
            .map_err(|_| DbError::Internal("WAL mutex poisoned".into()))?;
        if let Some(old) = wal.take() {
            old.sync()?;
        }
        info!("WAL disabled");
        Ok(())
    }

    /// Swap in a WAL at `path`, replacing (and syncing) any previous
    /// handle under the WAL mutex.
    pub fn set_wal(&self, path: impl AsRef<Path>) -> Result<(), DbError> {
        self.ensure_writable()?;
        let new = Wal::open(path.as_ref(), None)?;
        let mut wal = self
            .shared
            .wal
            .lock()
            .map_err(|_| DbError::Internal("WAL mutex poisoned".into()))?;
        if let Some(old) = wal.take() {
            old.sync()?;
        }
        *wal = Some(new);
        info!(path = %path.as_ref().display(), "WAL swapped");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    /// Insert a vector with its metadata chain; returns the new row's
    /// ordinal.
    pub fn add_vector(&self, vector: &[f32], metadata: &[MetaPair]) -> Result<RowId, DbError> {
        self.ensure_writable()?;
        let row = self.prepare_row(vector)?;
        let record = WalRecord::Insert {
            vector: row.clone(),
            metadata: to_encoded_pairs(metadata),
        };

        // The WAL append happens under the write guard, so log order is
        // exactly lock-acquisition order.
        let mut inner = self
            .shared
            .inner
            .write()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        self.append_wal(&record)?;
        let ordinal = Self::apply_insert(&mut inner, row, metadata.to_vec())?;
        drop(inner);

        self.bump_mutations();
        Ok(ordinal)
    }

    fn apply_insert(
        inner: &mut DbInner,
        row: Vec<f32>,
        metadata: Vec<MetaPair>,
    ) -> Result<RowId, DbError> {
        let ordinal = inner.store.add(&row, metadata.clone())?;
        inner.metadata.add_row(ordinal, &metadata);

        if let Some(index) = inner.index.as_mut() {
            if let Err(e) = index.insert(&inner.store, ordinal) {
                // Unwind so the failed mutation is not observable.
                inner.metadata.remove_all_for(ordinal);
                let _ = inner.store.mark_deleted(ordinal);
                return Err(e.into());
            }
        }
        Ok(ordinal)
    }

    /// Overwrite a live row's components in place.
    pub fn update_vector(&self, ordinal: RowId, vector: &[f32]) -> Result<(), DbError> {
        self.ensure_writable()?;
        let row = self.prepare_row(vector)?;
        let record = WalRecord::Update {
            ordinal,
            vector: row.clone(),
        };

        let mut inner = self
            .shared
            .inner
            .write()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        // Reject before logging: a doomed mutation must leave no record.
        if inner.store.is_deleted(ordinal)? {
            return Err(DbError::AlreadyDeleted(ordinal));
        }
        self.append_wal(&record)?;
        Self::apply_update(&mut inner, ordinal, &row)?;
        drop(inner);

        self.bump_mutations();
        Ok(())
    }

    fn apply_update(inner: &mut DbInner, ordinal: RowId, row: &[f32]) -> Result<(), DbError> {
        inner.store.update_data(ordinal, row)?;
        if let Some(index) = inner.index.as_mut() {
            index.update(&inner.store, ordinal)?;
        }
        Ok(())
    }

    /// Replace a live row's metadata chain.
    pub fn update_metadata(&self, ordinal: RowId, metadata: &[MetaPair]) -> Result<(), DbError> {
        self.ensure_writable()?;
        let record = WalRecord::MetadataUpdate {
            ordinal,
            metadata: to_encoded_pairs(metadata),
        };

        let mut inner = self
            .shared
            .inner
            .write()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        if inner.store.is_deleted(ordinal)? {
            return Err(DbError::AlreadyDeleted(ordinal));
        }
        self.append_wal(&record)?;
        Self::apply_metadata(&mut inner, ordinal, metadata.to_vec())?;
        drop(inner);

        self.bump_mutations();
        Ok(())
    }

    fn apply_metadata(
        inner: &mut DbInner,
        ordinal: RowId,
        metadata: Vec<MetaPair>,
    ) -> Result<(), DbError> {
        // Same critical section: store chain swap and index re-registration.
        let _old = inner.store.set_metadata(ordinal, metadata.clone())?;
        inner.metadata.remove_all_for(ordinal);
        inner.metadata.add_row(ordinal, &metadata);
        Ok(())
    }

    /// Tombstone a row.
    pub fn delete_vector(&self, ordinal: RowId) -> Result<(), DbError> {
        self.ensure_writable()?;
        let record = WalRecord::Delete { ordinal };

        let mut inner = self
            .shared
            .inner
            .write()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        if inner.store.is_deleted(ordinal)? {
            return Err(DbError::AlreadyDeleted(ordinal));
        }
        self.append_wal(&record)?;
        Self::apply_delete(&mut inner, ordinal)?;
        drop(inner);

        self.bump_mutations();
        Ok(())
    }

    fn apply_delete(inner: &mut DbInner, ordinal: RowId) -> Result<(), DbError> {
        inner.store.mark_deleted(ordinal)?;
        inner.metadata.remove_all_for(ordinal);
        if let Some(index) = inner.index.as_mut() {
            index.remove(&inner.store, ordinal)?;
        }
        Ok(())
    }

    /// Fetch one live row's vector and metadata.
    ///
    /// Tombstoned rows read as not-found — callers asked for a live row.
    pub fn get(&self, ordinal: RowId) -> Result<(Vec<f32>, Vec<MetaPair>), DbError> {
        let inner = self
            .shared
            .inner
            .read()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        match inner.store.get_view(ordinal) {
            Ok(view) => Ok((view.vector.to_vec(), view.metadata.to_vec())),
            Err(StoreError::Deleted(o)) => Err(DbError::NotFound(o)),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a row is tombstoned. Out-of-range ordinals are
    /// `NotFound`.
    pub fn is_deleted(&self, ordinal: RowId) -> Result<bool, DbError> {
        let inner = self
            .shared
            .inner
            .read()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        Ok(inner.store.is_deleted(ordinal)?)
    }

    /// Validate dimension and apply cosine normalization if configured.
    fn prepare_row(&self, vector: &[f32]) -> Result<Vec<f32>, DbError> {
        if vector.len() != self.shared.config.dimension {
            return Err(DbError::DimensionMismatch {
                expected: self.shared.config.dimension,
                actual: vector.len(),
            });
        }
        let mut row = vector.to_vec();
        if self.shared.config.cosine_normalized {
            normalize(&mut row);
        }
        Ok(row)
    }

    fn bump_mutations(&self) {
        if let Ok(mut counters) = self.shared.counters.lock() {
            counters.mutations += 1;
        }
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// k-nearest-neighbor search.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        metric: Metric,
    ) -> Result<Vec<SearchResult>, DbError> {
        self.search_inner(query, k, metric, None)
    }

    /// k-NN restricted to rows matching `filter`.
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        metric: Metric,
        filter: &Filter,
    ) -> Result<Vec<SearchResult>, DbError> {
        self.search_inner(query, k, metric, Some(filter))
    }

    /// Batch k-NN: one result list per query, evaluated independently.
    pub fn search_batch(
        &self,
        queries: &[Vec<f32>],
        k: usize,
        metric: Metric,
    ) -> Result<Vec<Vec<SearchResult>>, DbError> {
        queries
            .iter()
            .map(|q| self.search_inner(q, k, metric, None))
            .collect()
    }

    fn search_inner(
        &self,
        query: &[f32],
        k: usize,
        metric: Metric,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchResult>, DbError> {
        if k == 0 {
            return Err(DbError::InvalidArgument("k must be non-zero".into()));
        }
        if query.len() != self.shared.config.dimension {
            return Err(DbError::DimensionMismatch {
                expected: self.shared.config.dimension,
                actual: query.len(),
            });
        }

        let inner = self
            .shared
            .inner
            .read()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        self.bump_searches();

        let neighbors = if self.use_exact(&inner) {
            exact_knn(&inner.store, &inner.metadata, query, k, metric, filter)
        } else {
            let index = inner
                .index
                .as_ref()
                .ok_or_else(|| DbError::Internal("index missing for indexed search".into()))?;
            match filter {
                None => index.search(
                    &inner.store,
                    query,
                    k,
                    metric,
                    &SearchOptions::default(),
                )?,
                Some(filter) => {
                    self.oversampled_filtered_search(&inner, index.as_ref(), query, k, metric, filter)?
                }
            }
        };

        Ok(materialize(&inner.store, &neighbors))
    }

    /// Oversample then post-filter: fetch `k · max(2, ceil(pool / k))`
    /// candidates and keep the first `k` that satisfy the filter.
    fn oversampled_filtered_search(
        &self,
        inner: &DbInner,
        index: &dyn VectorIndex,
        query: &[f32],
        k: usize,
        metric: Metric,
        filter: &Filter,
    ) -> Result<Vec<Neighbor>, DbError> {
        let candidate_pool = filter
            .candidates(&inner.metadata)
            .map(|set| set.len())
            .unwrap_or(self.shared.config.search_depth() as u64);
        let factor = 2u64.max(candidate_pool.div_ceil(k as u64));
        let oversampled = (k as u64 * factor)
            .min(inner.store.live_count())
            .max(k as u64) as usize;

        debug!(k, candidate_pool, factor, oversampled, "filtered oversample");

        let opts = SearchOptions {
            ef_override: None,
            filtered: true,
        };
        let candidates = index.search(&inner.store, query, oversampled, metric, &opts)?;

        let mut kept = Vec::with_capacity(k);
        for neighbor in candidates {
            let Ok(pairs) = inner.store.metadata(neighbor.ordinal) else {
                continue;
            };
            if filter.matches(pairs) {
                kept.push(neighbor);
                if kept.len() == k {
                    break;
                }
            }
        }
        Ok(kept)
    }

    /// Every live row within `radius` of the query, closest first.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        metric: Metric,
        max_results: Option<usize>,
    ) -> Result<Vec<SearchResult>, DbError> {
        if radius < 0.0 || !radius.is_finite() {
            return Err(DbError::InvalidArgument(format!(
                "radius must be finite and >= 0, got {radius}"
            )));
        }
        if query.len() != self.shared.config.dimension {
            return Err(DbError::DimensionMismatch {
                expected: self.shared.config.dimension,
                actual: query.len(),
            });
        }

        let inner = self
            .shared
            .inner
            .read()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        self.bump_searches();

        let neighbors = if self.use_exact(&inner) {
            exact_range(&inner.store, query, radius, metric, max_results)
        } else {
            let index = inner
                .index
                .as_ref()
                .ok_or_else(|| DbError::Internal("index missing for indexed search".into()))?;
            index.range_search(&inner.store, query, radius, metric, max_results)?
        };

        Ok(materialize(&inner.store, &neighbors))
    }

    fn use_exact(&self, inner: &DbInner) -> bool {
        self.shared.config.force_exact_search
            || inner.index.is_none()
            || inner.store.count() <= self.shared.config.exact_search_threshold
    }

    fn bump_searches(&self) {
        if let Ok(mut counters) = self.shared.counters.lock() {
            counters.searches += 1;
        }
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Run a compaction pass synchronously: rewrite the store without
    /// tombstones (fresh ordinals), rebuild the metadata and vector
    /// indexes, persist a snapshot, truncate the WAL.
    pub fn compact(&self) -> Result<(), DbError> {
        self.ensure_writable()?;
        let mut inner = self
            .shared
            .inner
            .write()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        let inner = &mut *inner;

        let before = inner.store.count();
        let reclaimed = inner.store.deleted_count();
        let outcome = compaction::rewrite_store(&inner.store)?;
        inner.store = outcome.store;
        inner.metadata = outcome.metadata;
        if let Some(index) = inner.index.as_mut() {
            index.build(&inner.store)?;
        }

        // The compacted state must be durable before the log that
        // produced it disappears.
        self.save_snapshot_locked(inner)?;
        {
            let wal = self
                .shared
                .wal
                .lock()
                .map_err(|_| DbError::Internal("WAL mutex poisoned".into()))?;
            if let Some(wal) = wal.as_ref() {
                wal.truncate()?;
            }
        }

        if let Ok(mut counters) = self.shared.counters.lock() {
            counters.compactions += 1;
        }
        info!(
            before,
            after = inner.store.count(),
            reclaimed,
            "compaction complete"
        );
        Ok(())
    }

    /// Worker tick: compact when a threshold is exceeded.
    fn compact_if_needed(&self) {
        let trigger = {
            let Ok(inner) = self.shared.inner.read() else {
                return;
            };
            let wal_bytes = self.wal_bytes().unwrap_or(0);
            compaction::should_compact(
                inner.store.count(),
                inner.store.deleted_count(),
                wal_bytes,
                self.shared.config.deleted_ratio_threshold,
                self.shared.config.wal_compaction_threshold,
            )
        };
        if let Some(trigger) = trigger {
            info!(?trigger, "compaction triggered");
            if let Err(e) = self.compact() {
                warn!(error = %e, "background compaction failed");
            }
        }
    }

    fn wal_bytes(&self) -> Result<u64, DbError> {
        let wal = self
            .shared
            .wal
            .lock()
            .map_err(|_| DbError::Internal("WAL mutex poisoned".into()))?;
        match wal.as_ref() {
            Some(wal) => Ok(wal.file_size()?),
            None => Ok(0),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Stats
    // --------------------------------------------------------------------------------------------

    /// Snapshot of database statistics.
    pub fn stats(&self) -> Result<DbStats, DbError> {
        let inner = self
            .shared
            .inner
            .read()
            .map_err(|_| DbError::Internal("RwLock poisoned".into()))?;
        let counters = self
            .shared
            .counters
            .lock()
            .map_err(|_| DbError::Internal("counters mutex poisoned".into()))?;
        Ok(DbStats {
            dimension: self.shared.config.dimension,
            index_type: self.shared.config.index_type,
            count: inner.store.count(),
            live_count: inner.store.live_count(),
            deleted_count: inner.store.deleted_count(),
            wal_bytes: self.wal_bytes().unwrap_or(0),
            search_count: counters.searches,
            mutation_count: counters.mutations,
            compaction_count: counters.compactions,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Snapshot I/O
    // --------------------------------------------------------------------------------------------

    fn save_snapshot_locked(&self, inner: &DbInner) -> Result<(), DbError> {
        let Some(dir) = &self.shared.dir else {
            return Err(DbError::InvalidArgument(
                "read-only database has no directory".into(),
            ));
        };
        let path = dir.join(SNAPSHOT_FILE);

        let mut buf = Vec::new();
        DB_MAGIC.encode_to(&mut buf)?;
        DB_VERSION.encode_to(&mut buf)?;
        (self.shared.config.dimension as u32).encode_to(&mut buf)?;
        self.shared.config.index_type.as_tag().encode_to(&mut buf)?;

        match inner.index.as_ref() {
            Some(index) => index.save_to(&inner.store, &mut buf)?,
            None => save_exact_block(&inner.store, &mut buf)?,
        }

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        hasher.finalize().encode_to(&mut buf)?;

        // Write-then-rename so a crash never leaves a torn snapshot.
        let tmp = path.with_extension("pxdb.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        if let Ok(dir_handle) = fs::File::open(dir) {
            dir_handle.sync_all()?;
        }

        info!(path = %path.display(), bytes = buf.len(), "snapshot saved");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Snapshot load helpers
// ------------------------------------------------------------------------------------------------

type LoadedState = (VectorStore, MetadataIndex, Option<Box<dyn VectorIndex>>);

fn make_index(config: &DbConfig) -> Result<Option<Box<dyn VectorIndex>>, DbError> {
    Ok(match config.index_type {
        IndexType::Hnsw => Some(Box::new(HnswIndex::new(
            config.metric,
            config.hnsw.clone(),
        )?)),
        IndexType::DiskAnn => Some(Box::new(DiskAnnIndex::new(
            config.dimension,
            config.diskann.clone(),
        )?)),
        IndexType::Exact => None,
    })
}

/// Memory-map and parse a snapshot file.
fn load_snapshot(path: &Path, config: &DbConfig) -> Result<LoadedState, DbError> {
    let file = fs::File::open(path)?;
    // Safe for the duration of the load: the snapshot is replaced only
    // by atomic rename, never rewritten in place.
    let mmap = unsafe { Mmap::map(&file)? };
    let data: &[u8] = &mmap;

    if data.len() < DB_MAGIC.len() + 12 {
        return Err(DbError::FormatError("snapshot file too short".into()));
    }

    // CRC trailer over everything before it.
    let (body, trailer) = data.split_at(data.len() - 4);
    let stored_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(DbError::FormatError("snapshot CRC mismatch".into()));
    }

    let (magic, mut offset) = <[u8; 4]>::decode_from(body)?;
    if magic != DB_MAGIC {
        return Err(DbError::FormatError("unrecognized snapshot magic".into()));
    }
    let (version, n) = u32::decode_from(&body[offset..])?;
    offset += n;
    if version != DB_VERSION {
        return Err(DbError::FormatError(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let (dimension, n) = u32::decode_from(&body[offset..])?;
    offset += n;
    if dimension as usize != config.dimension {
        return Err(DbError::FormatError(format!(
            "snapshot dimension {dimension} does not match configured {}",
            config.dimension
        )));
    }
    let (index_tag, n) = u32::decode_from(&body[offset..])?;
    offset += n;
    let index_type = IndexType::from_tag(index_tag)
        .ok_or_else(|| DbError::FormatError(format!("unknown index type tag {index_tag}")))?;
    if index_type != config.index_type {
        return Err(DbError::FormatError(format!(
            "snapshot index type {index_type:?} does not match configured {:?}",
            config.index_type
        )));
    }

    let (index, rows): (Option<Box<dyn VectorIndex>>, Vec<LoadedRow>) = match index_type {
        IndexType::Hnsw => {
            let (index, rows, _) = HnswIndex::load(&body[offset..])?;
            (Some(Box::new(index)), rows)
        }
        IndexType::DiskAnn => {
            let (index, rows, _) = DiskAnnIndex::load(&body[offset..])?;
            (Some(Box::new(index)), rows)
        }
        IndexType::Exact => {
            let (rows, _) = load_exact_block(&body[offset..])?;
            (None, rows)
        }
    };

    // Rebuild the store and metadata index; tombstoned rows are
    // re-added then re-tombstoned so ordinals survive the round-trip.
    let mut store = VectorStore::new(config.dimension)?;
    let mut metadata = MetadataIndex::new();
    for row in rows {
        let ordinal = store.add(&row.vector, row.metadata.clone())?;
        if row.deleted {
            store.mark_deleted(ordinal)?;
        } else {
            metadata.add_row(ordinal, &row.metadata);
        }
    }

    info!(
        path = %path.display(),
        rows = store.count(),
        live = store.live_count(),
        "snapshot loaded"
    );
    Ok((store, metadata, index))
}

/// Row-only block for `IndexType::Exact` databases.
fn save_exact_block(store: &VectorStore, buf: &mut Vec<u8>) -> Result<(), DbError> {
    store.count().encode_to(buf)?;
    for ordinal in 0..store.count() {
        let deleted = store.is_deleted(ordinal)?;
        deleted.encode_to(buf)?;
        let vector = store
            .vector_raw(ordinal)
            .ok_or_else(|| DbError::Internal(format!("missing row {ordinal}")))?;
        vector.encode_to(buf)?;
        let pairs = if deleted {
            Vec::new()
        } else {
            to_encoded_pairs(store.metadata(ordinal)?)
        };
        encoding::encode_vec(&pairs, buf)?;
    }
    Ok(())
}

fn load_exact_block(buf: &[u8]) -> Result<(Vec<LoadedRow>, usize), DbError> {
    let (count, mut offset) = u64::decode_from(buf)?;
    let mut rows = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (deleted, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let (vector, n) = Vec::<f32>::decode_from(&buf[offset..])?;
        offset += n;
        let (pairs, n) = encoding::decode_vec::<EncodedPair>(&buf[offset..])?;
        offset += n;
        rows.push(LoadedRow {
            vector,
            metadata: from_encoded_pairs(pairs),
            deleted,
        });
    }
    Ok((rows, offset))
}

// ------------------------------------------------------------------------------------------------
// Exact-scan strategy
// ------------------------------------------------------------------------------------------------

/// Linear top-k scan over live rows, respecting tombstones and the
/// optional filter. Uses the filter's candidate set when it is
/// index-servable.
fn exact_knn(
    store: &VectorStore,
    metadata: &MetadataIndex,
    query: &[f32],
    k: usize,
    metric: Metric,
    filter: Option<&Filter>,
) -> Vec<Neighbor> {
    use std::collections::BinaryHeap;

    // Max-heap keyed on distance so the worst survivor is on top.
    #[derive(PartialEq)]
    struct Entry(f32, RowId);
    impl Eq for Entry {}
    impl PartialOrd for Entry {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for Entry {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.1.cmp(&other.1))
        }
    }

    let mut heap: BinaryHeap<Entry> = BinaryHeap::with_capacity(k + 1);

    let mut consider = |ordinal: RowId| {
        let Ok(view) = store.get_view(ordinal) else {
            return;
        };
        if let Some(filter) = filter {
            if !filter.matches(view.metadata) {
                return;
            }
        }
        let d = metric.distance(query, view.vector);
        heap.push(Entry(d, ordinal));
        if heap.len() > k {
            heap.pop();
        }
    };

    match filter.and_then(|f| f.candidates(metadata)) {
        Some(set) => {
            for ordinal in set.iter() {
                consider(ordinal);
            }
        }
        None => {
            for ordinal in 0..store.count() {
                consider(ordinal);
            }
        }
    }

    let mut neighbors: Vec<Neighbor> = heap
        .into_sorted_vec()
        .into_iter()
        .map(|Entry(distance, ordinal)| Neighbor { ordinal, distance })
        .collect();
    crate::index::sort_neighbors(&mut neighbors);
    neighbors
}

/// Linear range scan over live rows.
fn exact_range(
    store: &VectorStore,
    query: &[f32],
    radius: f32,
    metric: Metric,
    max_results: Option<usize>,
) -> Vec<Neighbor> {
    let mut neighbors: Vec<Neighbor> = store
        .iter_live()
        .filter_map(|view| {
            let d = metric.distance(query, view.vector);
            (d <= radius).then_some(Neighbor {
                ordinal: view.ordinal,
                distance: d,
            })
        })
        .collect();
    crate::index::sort_neighbors(&mut neighbors);
    if let Some(max) = max_results {
        neighbors.truncate(max);
    }
    neighbors
}

/// Clone row payloads for the hits under the still-held read guard.
fn materialize(store: &VectorStore, neighbors: &[Neighbor]) -> Vec<SearchResult> {
    neighbors
        .iter()
        .filter_map(|n| {
            store.get_view(n.ordinal).ok().map(|view| SearchResult {
                ordinal: n.ordinal,
                distance: n.distance,
                vector: view.vector.to_vec(),
                metadata: view.metadata.to_vec(),
            })
        })
        .collect()
}
