//! Background compaction.
//!
//! Deletes in the engine are logical — a tombstone flag on the row and
//! its index node. Space reclamation is the exclusive responsibility of
//! this module: a compaction pass rewrites the store without tombstoned
//! rows (assigning **fresh ordinals**), rebuilds the metadata index and
//! the active vector index from the surviving rows, persists a snapshot,
//! and truncates the WAL.
//!
//! ## Trigger policy
//!
//! A pass runs when either threshold is exceeded:
//!
//! - `deleted_ratio = tombstones / count` ≥ the configured ratio, or
//! - the WAL byte size ≥ the configured byte threshold.
//!
//! ## Worker
//!
//! The [`Compactor`] is a dedicated OS thread parked on a
//! `Mutex + Condvar` pair. It wakes on its interval timeout or when
//! [`Compactor::signal`] nudges it, runs the tick callback (which
//! checks the thresholds under the database lock), and parks again.
//! [`Compactor::stop`] sets the shutdown flag, notifies, and joins.
//!
//! An external `Database::compact()` call runs the same pass
//! synchronously without involving the worker.


use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metadata::MetadataIndex;
use crate::store::{RowId, StoreError, VectorStore};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while rewriting the store.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Error surfaced from the store rewrite.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Trigger policy
// ------------------------------------------------------------------------------------------------

/// Why a compaction pass fired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompactionTrigger {
    /// `tombstones / count` exceeded the ratio threshold.
    DeletedRatio(f64),
    /// The WAL grew past the byte threshold.
    WalBytes(u64),
}

/// Decide whether a pass should run.
///
/// `deleted_ratio_threshold` is in `0..=1`; a `wal_threshold` of 0
/// disables the WAL-size trigger (an absent WAL reports 0 bytes).
pub fn should_compact(
    count: u64,
    tombstones: u64,
    wal_bytes: u64,
    deleted_ratio_threshold: f64,
    wal_threshold: u64,
) -> Option<CompactionTrigger> {
    if count > 0 {
        let ratio = tombstones as f64 / count as f64;
        if ratio >= deleted_ratio_threshold && tombstones > 0 {
            return Some(CompactionTrigger::DeletedRatio(ratio));
        }
    }
    if wal_threshold > 0 && wal_bytes >= wal_threshold {
        return Some(CompactionTrigger::WalBytes(wal_bytes));
    }
    None
}

// ------------------------------------------------------------------------------------------------
// Store rewrite
// ------------------------------------------------------------------------------------------------

/// Result of a store rewrite: the replacement store, a rebuilt metadata
/// index, and the old→new ordinal mapping for surviving rows.
pub struct RewriteOutcome {
    /// Replacement store holding only the previously-live rows.
    pub store: VectorStore,
    /// Metadata index re-registered under the fresh ordinals.
    pub metadata: MetadataIndex,
    /// `(old_ordinal, new_ordinal)` for every surviving row, in old
    /// ordinal order.
    pub remap: Vec<(RowId, RowId)>,
}

/// Rewrite `store` excluding tombstones.
///
/// Surviving rows keep their data and metadata but receive fresh,
/// densely packed ordinals in their original order. The caller must
/// rebuild the vector index from the returned store and truncate the
/// WAL once the new state is durable.
pub fn rewrite_store(store: &VectorStore) -> Result<RewriteOutcome, CompactionError> {
    let mut fresh = VectorStore::new(store.dimension())?;
    let mut metadata = MetadataIndex::new();
    let mut remap = Vec::with_capacity(store.live_count() as usize);

    for view in store.iter_live() {
        let new_ordinal = fresh.add(view.vector, view.metadata.to_vec())?;
        metadata.add_row(new_ordinal, view.metadata);
        remap.push((view.ordinal, new_ordinal));
    }

    debug_assert_eq!(fresh.count(), fresh.live_count());
    debug!(
        before = store.count(),
        after = fresh.count(),
        reclaimed = store.deleted_count(),
        "store rewritten"
    );
    Ok(RewriteOutcome {
        store: fresh,
        metadata,
        remap,
    })
}

// ------------------------------------------------------------------------------------------------
// Background worker
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct WorkerState {
    /// Set by `stop()`; the thread exits at the next wake-up.
    shutdown: bool,
    /// Set by `signal()`; forces an immediate tick.
    kicked: bool,
}

/// Dedicated compaction thread parked on a condition variable.
pub struct Compactor {
    signal: Arc<(Mutex<WorkerState>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Compactor {
    /// Spawn the worker. Every `interval` (or sooner when signalled)
    /// it invokes `tick`, which is expected to check the thresholds and
    /// run a pass when one is exceeded.
    pub fn spawn<F>(interval: Duration, tick: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let signal = Arc::new((Mutex::new(WorkerState::default()), Condvar::new()));
        let thread_signal = Arc::clone(&signal);

        let handle = std::thread::Builder::new()
            .name("proximadb-compactor".into())
            .spawn(move || {
                info!(interval_sec = interval.as_secs(), "compactor started");
                let (lock, cvar) = &*thread_signal;
                loop {
                    {
                        let state = match lock.lock() {
                            Ok(s) => s,
                            Err(_) => {
                                error!("compactor state mutex poisoned; worker exiting");
                                return;
                            }
                        };
                        let (mut state, _timeout) = match cvar
                            .wait_timeout_while(state, interval, |s| !s.shutdown && !s.kicked)
                        {
                            Ok(r) => r,
                            Err(_) => {
                                error!("compactor condvar poisoned; worker exiting");
                                return;
                            }
                        };
                        if state.shutdown {
                            info!("compactor shutting down");
                            return;
                        }
                        state.kicked = false;
                    }
                    tick();
                }
            });

        match handle {
            Ok(handle) => Self {
                signal,
                handle: Some(handle),
            },
            Err(e) => {
                // A database without its worker still compacts via the
                // synchronous path.
                warn!(error = %e, "failed to spawn compactor thread");
                Self {
                    signal,
                    handle: None,
                }
            }
        }
    }

    /// Wake the worker for an immediate tick.
    pub fn signal(&self) {
        let (lock, cvar) = &*self.signal;
        if let Ok(mut state) = lock.lock() {
            state.kicked = true;
            cvar.notify_all();
        }
    }

    /// Signal shutdown and join the worker.
    pub fn stop(&mut self) {
        let (lock, cvar) = &*self.signal;
        if let Ok(mut state) = lock.lock() {
            state.shutdown = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("compactor thread panicked");
            }
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.stop();
    }
}
