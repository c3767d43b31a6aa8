//! Write-Ahead Logging (WAL) Module
//!
//! A **durable**, **append-only**, headerless write-ahead log driving
//! crash recovery. Any record type implementing [`WalData`] can be
//! persisted; the database instantiates it with [`WalRecord`].
//!
//! # On-disk layout
//!
//! ```text
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! Each record is a 4-byte little-endian length prefix, the serialized
//! record bytes ([`crate::encoding`] format), and a CRC32 computed over
//! `len ‖ record_bytes`. There is no file header: an empty WAL is an
//! empty file, and replay starts at offset 0.
//!
//! # Concurrency model
//!
//! - The file handle is shared via `Arc<Mutex<File>>`, so appends
//!   serialize independently of database reads.
//! - [`WalIter`] tracks its own logical offset, seeking before each read
//!   to avoid races with concurrent appenders.
//!
//! # Guarantees
//!
//! - **Durability:** every `append()` is followed by an `fsync()` via
//!   [`File::sync_all`] before the mutation is acknowledged.
//! - **Corruption detection:** replay verifies each record checksum and
//!   stops at the first failed checksum or truncated write — the tail
//!   of a crashed append is discarded, never misread.
//! - **Replay idempotence:** the typed records carry ordinals, so
//!   replaying the same log over the same base state reproduces the
//!   same rows.

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::metadata::EncodedPair;
use crate::store::RowId;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds the configured maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Unexpected end-of-file during read (torn final record).
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalError {
    /// Whether this error marks the benign end of a crashed log — a torn
    /// or corrupt final record that replay should discard, as opposed to
    /// an I/O failure that must abort recovery.
    pub fn is_torn_tail(&self) -> bool {
        matches!(
            self,
            WalError::ChecksumMismatch | WalError::UnexpectedEof | WalError::RecordTooLarge(_)
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Record type
// ------------------------------------------------------------------------------------------------

/// One logged mutation.
///
/// `Insert` carries no ordinal: the ordinal is re-derived on replay from
/// the store's monotonic counter, which is what makes replay idempotent
/// over a fixed base state.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    /// A new row with its vector and metadata chain.
    Insert {
        /// Row components.
        vector: Vec<f32>,
        /// Metadata pairs attached at insert time.
        metadata: Vec<EncodedPair>,
    },
    /// In-place overwrite of a row's components.
    Update {
        /// Target row.
        ordinal: RowId,
        /// Replacement components.
        vector: Vec<f32>,
    },
    /// Tombstoning of a row.
    Delete {
        /// Target row.
        ordinal: RowId,
    },
    /// Replacement of a row's metadata chain.
    MetadataUpdate {
        /// Target row.
        ordinal: RowId,
        /// Replacement metadata pairs.
        metadata: Vec<EncodedPair>,
    },
}

impl Encode for WalRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            WalRecord::Insert { vector, metadata } => {
                0u32.encode_to(buf)?;
                vector.encode_to(buf)?;
                encoding::encode_vec(metadata, buf)
            }
            WalRecord::Update { ordinal, vector } => {
                1u32.encode_to(buf)?;
                ordinal.encode_to(buf)?;
                vector.encode_to(buf)
            }
            WalRecord::Delete { ordinal } => {
                2u32.encode_to(buf)?;
                ordinal.encode_to(buf)
            }
            WalRecord::MetadataUpdate { ordinal, metadata } => {
                3u32.encode_to(buf)?;
                ordinal.encode_to(buf)?;
                encoding::encode_vec(metadata, buf)
            }
        }
    }
}

impl Decode for WalRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        let record = match tag {
            0 => {
                let (vector, n) = Vec::<f32>::decode_from(&buf[offset..])?;
                offset += n;
                let (metadata, n) = encoding::decode_vec::<EncodedPair>(&buf[offset..])?;
                offset += n;
                WalRecord::Insert { vector, metadata }
            }
            1 => {
                let (ordinal, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (vector, n) = Vec::<f32>::decode_from(&buf[offset..])?;
                offset += n;
                WalRecord::Update { ordinal, vector }
            }
            2 => {
                let (ordinal, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                WalRecord::Delete { ordinal }
            }
            3 => {
                let (ordinal, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (metadata, n) = encoding::decode_vec::<EncodedPair>(&buf[offset..])?;
                offset += n;
                WalRecord::MetadataUpdate { ordinal, metadata }
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "WalRecord",
                });
            }
        };
        Ok((record, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Trait for data types that can be written to and read from the WAL.
///
/// A marker requiring [`crate::encoding`] serialization plus
/// [`Send`] + [`Sync`] + [`Debug`].
pub trait WalData: Encode + Decode + std::fmt::Debug + Send + Sync {}
impl<T> WalData for T where T: Encode + Decode + std::fmt::Debug + Send + Sync {}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// A generic, thread-safe write-ahead log for durable record storage.
///
/// See the [module-level documentation](self) for format, concurrency,
/// and guarantees.
#[derive(Debug)]
pub struct Wal<T: WalData> {
    /// Thread-safe file handle for WAL operations.
    inner_file: Arc<Mutex<File>>,

    /// Path to the WAL file on disk.
    path: PathBuf,

    /// Maximum record size accepted by `append`.
    max_record_size: u32,

    /// Marker field associating this WAL with the record type `T`.
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalData> Wal<T> {
    /// Default maximum record size (64 MiB) — sized for wide embedding
    /// rows plus their metadata chains.
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

    /// Open or create a WAL file at the given path.
    pub fn open<P: AsRef<Path>>(path: P, max_record_size: Option<u32>) -> Result<Self, WalError> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        let size = file.metadata()?.len();
        info!(path = %path_ref.display(), size, "WAL opened");

        Ok(Self {
            inner_file: Arc::new(Mutex::new(file)),
            path: path_ref.to_path_buf(),
            max_record_size: max_record_size.unwrap_or(Self::DEFAULT_MAX_RECORD_SIZE),
            _phantom: std::marker::PhantomData,
        })
    }

    /// Append a single record and fsync.
    ///
    /// The record is written as `[u32 len LE][record_bytes][u32 crc32 LE]`
    /// with the CRC computed over `len ‖ record_bytes`.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        let record_bytes = encoding::encode_to_vec(record)?;
        let record_len = u32::try_from(record_bytes.len())
            .map_err(|_| WalError::RecordTooLarge(record_bytes.len()))?;

        if record_len > self.max_record_size {
            return Err(WalError::RecordTooLarge(record_len as usize));
        }

        let len_bytes = record_len.to_le_bytes();
        let checksum = compute_crc(&[&len_bytes, &record_bytes]);

        // Lock and append atomically from the caller's perspective.
        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.write_all(&len_bytes)?;
        guard.write_all(&record_bytes)?;
        guard.write_all(&checksum.to_le_bytes())?;
        guard.sync_all()?;

        trace!(
            len = record_len,
            crc = format_args!("{checksum:08x}"),
            "WAL record appended"
        );
        Ok(())
    }

    /// Returns an iterator that replays all records from offset 0.
    ///
    /// The iterator verifies CRC checksums and decodes each entry into
    /// `T`. Recovery treats a torn tail ([`WalError::is_torn_tail`]) as
    /// the end of the log.
    pub fn replay_iter(&self) -> WalIter<T> {
        debug!(path = %self.path.display(), "WAL replay started");
        WalIter {
            file: Arc::clone(&self.inner_file),
            offset: 0,
            max_record_size: self.max_record_size as usize,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Truncate (clear) the WAL.
    ///
    /// After truncation the file is empty; compaction calls this once
    /// the compacted state is durable.
    pub fn truncate(&self) -> Result<(), WalError> {
        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.set_len(0)?;
        guard.seek(SeekFrom::Start(0))?;
        guard.sync_all()?;

        info!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    /// Truncate the WAL back to `len` bytes.
    ///
    /// Recovery calls this after replay stops at a torn tail: the
    /// garbage bytes must go, or the next append would land behind them
    /// and be unreachable by every future replay.
    pub fn truncate_to(&self, len: u64) -> Result<(), WalError> {
        let guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.set_len(len)?;
        guard.sync_all()?;

        warn!(path = %self.path.display(), len, "WAL truncated to valid prefix");
        Ok(())
    }

    /// Write a human-readable rendering of every record to `out`.
    ///
    /// Operator diagnostics only; the format is unstable. Stops at the
    /// first torn/corrupt record and notes it.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<(), WalError> {
        writeln!(out, "WAL {}", self.path.display())?;
        for (i, result) in self.replay_iter().enumerate() {
            match result {
                Ok(record) => writeln!(out, "  #{i:06} {record:?}")?,
                Err(e) if e.is_torn_tail() => {
                    writeln!(out, "  #{i:06} <torn tail: {e}>")?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Flush the OS buffers for the underlying file.
    pub fn sync(&self) -> Result<(), WalError> {
        let guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        guard.sync_all()?;
        Ok(())
    }

    /// Path of the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured maximum record size.
    pub fn max_record_size(&self) -> u32 {
        self.max_record_size
    }

    /// Current on-disk file size in bytes.
    pub fn file_size(&self) -> Result<u64, WalError> {
        let guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        Ok(guard.metadata()?.len())
    }
}

impl<T: WalData> Drop for Wal<T> {
    fn drop(&mut self) {
        match self.inner_file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop");
                }
            }
            Err(poisoned) => {
                let file = poisoned.into_inner();
                if let Err(e) = file.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop (poisoned lock)");
                } else {
                    warn!(path = %self.path.display(), "WAL recovered and synced after poisoned lock");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Streaming WAL replay iterator.
///
/// Reads records sequentially and yields decoded `T` values without
/// loading the whole log into memory. Holds an `Arc` to the file handle,
/// so it may outlive the [`Wal`] that created it.
pub struct WalIter<T: WalData> {
    /// Shared file handle protected by a mutex.
    file: Arc<Mutex<File>>,

    /// Current byte offset within the WAL file.
    offset: u64,

    /// Maximum allowed record size.
    max_record_size: usize,

    /// Marker field associating this iterator with the record type `T`.
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalData> WalIter<T> {
    /// Byte offset just past the last successfully read record.
    ///
    /// When iteration stops at a torn tail, this is the length of the
    /// valid prefix.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<T: WalData> std::fmt::Debug for WalIter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIter")
            .field("offset", &self.offset)
            .field("max_record_size", &self.max_record_size)
            .finish_non_exhaustive()
    }
}

impl<T: WalData> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Lock only for the read of one record to reduce contention.
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return Some(Err(WalError::Internal("Mutex poisoned".into()))),
        };

        // Seek to our logical offset for deterministic reads.
        if let Err(e) = guard.seek(SeekFrom::Start(self.offset)) {
            return Some(Err(WalError::Io(e)));
        }

        // Read length prefix (4 bytes).
        let mut len_bytes = [0u8; U32_SIZE];
        match guard.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                trace!(offset = self.offset, "WAL replay reached end of file");
                return None;
            }
            Err(e) => return Some(Err(WalError::Io(e))),
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > self.max_record_size {
            return Some(Err(WalError::RecordTooLarge(record_len)));
        }

        trace!(offset = self.offset, len = record_len, "WAL reading record");

        // Read record bytes.
        let mut record_bytes = vec![0u8; record_len];
        if let Err(e) = guard.read_exact(&mut record_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!(
                    offset = self.offset,
                    len = record_len,
                    "WAL truncated record (partial payload)"
                );
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }

        // Read stored checksum.
        let mut checksum_bytes = [0u8; U32_SIZE];
        if let Err(e) = guard.read_exact(&mut checksum_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!(
                    offset = self.offset,
                    len = record_len,
                    "WAL truncated record (partial checksum)"
                );
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        // Verify checksum over [len || record_bytes].
        if let Err(e) = verify_crc(&[&len_bytes, &record_bytes], stored_checksum) {
            warn!(
                offset = self.offset,
                len = record_len,
                "WAL record checksum mismatch"
            );
            return Some(Err(e));
        }

        // Advance the offset only past verified records, so `offset()`
        // always marks the valid prefix.
        if let Ok(pos) = guard.stream_position() {
            self.offset = pos;
        }

        // Decode the record payload.
        match encoding::decode_from_slice::<T>(&record_bytes) {
            Ok((record, _)) => Some(Ok(record)),
            Err(e) => Some(Err(WalError::Encoding(e))),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// CRC helpers
// ------------------------------------------------------------------------------------------------

/// Computes a CRC32 checksum over one or more byte slices.
fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Verifies that the CRC32 over the given byte slices matches `expected`.
fn verify_crc(parts: &[&[u8]], expected: u32) -> Result<(), WalError> {
    let computed = compute_crc(parts);
    if computed != expected {
        return Err(WalError::ChecksumMismatch);
    }
    Ok(())
}
