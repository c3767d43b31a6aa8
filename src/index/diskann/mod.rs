//! DiskANN / Vamana index — SSD-resident vectors, PQ navigation.
//!
//! A single-level directed graph in which each node owns at most
//! `max_degree` out-neighbors. Full vectors live in a sector-aligned
//! slot file on disk; the RAM footprint per row is one `m`-byte PQ code
//! plus the adjacency list.
//!
//! ## Disk layout
//!
//! Slot `i` begins at byte `i · slot_size` of the backing file, where
//! `slot_size = ceil(dimension · 4 / sector_size) · sector_size`. Reads
//! go through an LRU [`cache::PageCache`]: fetching any vector fills its
//! whole page, so graph-local reads amortize.
//!
//! ## Search
//!
//! Every search starts at the **medoid** (the row closest to the dataset
//! centroid, fixed at build time). A greedy beam keeps a sorted
//! candidate array capped at `2 · beam_width`, scored with PQ
//! approximate distances when a codebook is trained and exact disk reads
//! otherwise. The surviving candidates are re-ranked with exact
//! distances read from disk before the top k are returned.
//!
//! ## Robust α-pruning
//!
//! Neighbor selection walks candidates in ascending distance order;
//! selecting `c_i` marks redundant any later `c_j` that is closer to
//! `c_i` than `distance(c_j, v) / α`. Inter-candidate distances use PQ
//! codes whenever both sides carry one, and exact disk reads otherwise —
//! one rule, applied consistently.
//!
//! Deletes only tombstone: stale in-edges remain in the graph and are
//! filtered at emission, which keeps delete O(1) at the cost of a little
//! wasted traversal until compaction rebuilds the index.

#[cfg(test)]
mod tests;

pub mod cache;
pub mod pq;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, trace};

use crate::distance::{Metric, l2_squared};
use crate::encoding::{self, Decode, Encode};
use crate::index::{
    IndexError, IndexType, LoadedRow, Neighbor, SearchOptions, VectorIndex, check_k,
    sort_neighbors,
};
use crate::metadata::{from_encoded_pairs, to_encoded_pairs, EncodedPair};
use crate::store::{RowId, VectorStore};

use cache::PageCache;
use pq::PqCodebook;

/// Magic bytes of a DiskANN save block.
pub const DISKANN_MAGIC: [u8; 4] = *b"PXDA";

/// Save-block format version. Version 2 embeds per-row metadata chains.
pub const DISKANN_VERSION: u32 = 2;

/// Beam exploration stops after visiting `MAX_VISITED_FACTOR ·
/// beam_width` nodes even if the frontier keeps improving.
const MAX_VISITED_FACTOR: usize = 4;

/// Target page size the cache aims for when grouping slots (256 KiB).
const TARGET_PAGE_BYTES: usize = 256 * 1024;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning for a [`DiskAnnIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct DiskAnnConfig {
    /// Maximum out-degree per node.
    pub max_degree: usize,
    /// Robust-pruning diversity parameter (≥ 1.0).
    pub alpha: f32,
    /// Beam width during build and insert.
    pub build_beam_width: usize,
    /// Beam width during search.
    pub search_beam_width: usize,
    /// Sub-quantizer count; 0 picks one automatically from the dimension.
    pub pq_dim: usize,
    /// Backing slot file for full vectors.
    pub data_path: PathBuf,
    /// Page-cache budget in MiB.
    pub cache_size_mb: usize,
    /// Sector size used for slot alignment.
    pub sector_size: usize,
}

impl Default for DiskAnnConfig {
    fn default() -> Self {
        Self {
            max_degree: 32,
            alpha: 1.2,
            build_beam_width: 64,
            search_beam_width: 32,
            pq_dim: 0,
            data_path: PathBuf::from("diskann.dat"),
            cache_size_mb: 64,
            sector_size: 4096,
        }
    }
}

impl DiskAnnConfig {
    /// Validate tuning values.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.max_degree == 0 {
            return Err(IndexError::InvalidArgument("max_degree must be > 0".into()));
        }
        if self.alpha < 1.0 || !self.alpha.is_finite() {
            return Err(IndexError::InvalidArgument(format!(
                "alpha must be finite and >= 1.0, got {}",
                self.alpha
            )));
        }
        if self.build_beam_width == 0 || self.search_beam_width == 0 {
            return Err(IndexError::InvalidArgument(
                "beam widths must be > 0".into(),
            ));
        }
        if self.sector_size == 0 {
            return Err(IndexError::InvalidArgument(
                "sector_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Node
// ------------------------------------------------------------------------------------------------

/// One graph node, RAM-resident. The full vector lives on disk.
#[derive(Debug, Clone, Default)]
struct DiskNode {
    /// Out-neighbors, capped at `max_degree`.
    neighbors: Vec<RowId>,
    /// PQ code, present once a codebook has been trained.
    pq_code: Option<Vec<u8>>,
    /// Tombstone flag.
    deleted: bool,
}

/// One entry of the beam's sorted candidate array.
#[derive(Debug, Clone, Copy)]
struct BeamEntry {
    distance: f32,
    ordinal: RowId,
    explored: bool,
}

// ------------------------------------------------------------------------------------------------
// Index
// ------------------------------------------------------------------------------------------------

/// Vamana graph with on-disk vectors, PQ navigator, and LRU page cache.
pub struct DiskAnnIndex {
    config: DiskAnnConfig,
    dimension: usize,
    /// Bytes per sector-aligned vector slot.
    slot_size: usize,
    /// Slots grouped per cache page.
    vectors_per_page: usize,
    /// Arena keyed by row ordinal.
    nodes: Vec<DiskNode>,
    /// Entry point: the row closest to the dataset centroid.
    medoid: Option<RowId>,
    /// Trained navigator, if `build` has run.
    pq: Option<PqCodebook>,
    /// Backing slot file.
    file: File,
    /// Page cache; its own mutex keeps searches shareable under the
    /// database read guard.
    cache: Mutex<PageCache>,
}

impl std::fmt::Debug for DiskAnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskAnnIndex")
            .field("dimension", &self.dimension)
            .field("nodes", &self.nodes.len())
            .field("medoid", &self.medoid)
            .field("trained", &self.pq.is_some())
            .finish_non_exhaustive()
    }
}

impl DiskAnnIndex {
    /// Create an empty index backed by `config.data_path`.
    pub fn new(dimension: usize, config: DiskAnnConfig) -> Result<Self, IndexError> {
        config.validate()?;
        if dimension == 0 {
            return Err(IndexError::InvalidArgument(
                "dimension must be non-zero".into(),
            ));
        }

        let slot_size = (dimension * 4).div_ceil(config.sector_size) * config.sector_size;
        let vectors_per_page = (TARGET_PAGE_BYTES / slot_size).max(1);
        let page_bytes = vectors_per_page * slot_size;
        let max_pages = (config.cache_size_mb * 1024 * 1024 / page_bytes).max(1);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&config.data_path)?;

        info!(
            path = %config.data_path.display(),
            slot_size,
            vectors_per_page,
            max_pages,
            "DiskANN slot file opened"
        );

        Ok(Self {
            config,
            dimension,
            slot_size,
            vectors_per_page,
            nodes: Vec::new(),
            medoid: None,
            pq: None,
            file,
            cache: Mutex::new(PageCache::new(page_bytes, max_pages)),
        })
    }

    /// The tuning this index runs with.
    pub fn config(&self) -> &DiskAnnConfig {
        &self.config
    }

    /// Bytes per sector-aligned slot.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Current medoid, if any row is indexed.
    pub fn medoid(&self) -> Option<RowId> {
        self.medoid
    }

    /// Whether a PQ codebook has been trained.
    pub fn is_trained(&self) -> bool {
        self.pq.is_some()
    }

    /// Total graph out-edges (diagnostics and tests).
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.neighbors.len()).sum()
    }

    // --------------------------------------------------------------------------------------------
    // Slot I/O
    // --------------------------------------------------------------------------------------------

    /// Write one row into its sector-aligned slot and invalidate the
    /// covering cache page.
    fn write_slot(&self, ordinal: RowId, row: &[f32]) -> Result<(), IndexError> {
        let mut slot = vec![0u8; self.slot_size];
        for (i, &v) in row.iter().enumerate() {
            slot[i * 4..i * 4 + 4].copy_from_slice(&v.to_bits().to_le_bytes());
        }
        self.file.write_all_at(&slot, ordinal * self.slot_size as u64)?;

        let page_no = ordinal / self.vectors_per_page as u64;
        self.cache
            .lock()
            .map_err(|_| IndexError::Internal("page cache mutex poisoned".into()))?
            .invalidate(page_no);
        Ok(())
    }

    /// Read one row's exact vector through the page cache.
    fn read_vector(&self, ordinal: RowId) -> Result<Vec<f32>, IndexError> {
        let page_no = ordinal / self.vectors_per_page as u64;
        let page_offset = page_no * (self.vectors_per_page * self.slot_size) as u64;
        let slot_in_page = (ordinal % self.vectors_per_page as u64) as usize * self.slot_size;

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| IndexError::Internal("page cache mutex poisoned".into()))?;

        let file = &self.file;
        let page = cache.get_or_load(page_no, |buf| {
            // The file may end mid-page; the unread tail stays zeroed.
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read_at(&mut buf[filled..], page_offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(())
        })?;

        let raw = &page[slot_in_page..slot_in_page + self.dimension * 4];
        let mut vector = Vec::with_capacity(self.dimension);
        for chunk in raw.chunks_exact(4) {
            vector.push(f32::from_bits(u32::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3],
            ])));
        }
        Ok(vector)
    }

    // --------------------------------------------------------------------------------------------
    // Distances
    // --------------------------------------------------------------------------------------------

    /// Approximate squared distance from the query to `ordinal`: PQ when
    /// available, exact disk read otherwise.
    fn navigator_distance(
        &self,
        table: Option<&[f32]>,
        query: &[f32],
        ordinal: RowId,
    ) -> Result<f32, IndexError> {
        if let (Some(pq), Some(table)) = (&self.pq, table) {
            if let Some(code) = &self.nodes[ordinal as usize].pq_code {
                return Ok(pq.distance_with_table(table, code));
            }
        }
        Ok(l2_squared(query, &self.read_vector(ordinal)?))
    }

    /// Squared distance between two stored rows, PQ-first.
    fn pair_distance(&self, a: RowId, b: RowId) -> Result<f32, IndexError> {
        if let Some(pq) = &self.pq {
            if let (Some(ca), Some(cb)) = (
                &self.nodes[a as usize].pq_code,
                &self.nodes[b as usize].pq_code,
            ) {
                return Ok(pq.code_distance(ca, cb));
            }
        }
        Ok(l2_squared(&self.read_vector(a)?, &self.read_vector(b)?))
    }

    // --------------------------------------------------------------------------------------------
    // Beam search
    // --------------------------------------------------------------------------------------------

    /// Greedy beam search from the medoid.
    ///
    /// Maintains a sorted candidate array capped at `2 · beam_width`;
    /// pops the first unexplored entry, expands its unseen neighbors,
    /// and terminates when the exploration pointer reaches the end or
    /// `MAX_VISITED_FACTOR · beam_width` nodes have been explored.
    fn beam_search(&self, query: &[f32], beam_width: usize) -> Result<Vec<BeamEntry>, IndexError> {
        let Some(medoid) = self.medoid else {
            return Ok(Vec::new());
        };

        let table = self.pq.as_ref().map(|pq| pq.distance_table(query));
        let table = table.as_deref();
        let cap = 2 * beam_width;
        let max_visited = MAX_VISITED_FACTOR * beam_width;

        let mut seen = vec![false; self.nodes.len()];
        let mut beam: Vec<BeamEntry> = Vec::with_capacity(cap + 1);

        seen[medoid as usize] = true;
        beam.push(BeamEntry {
            distance: self.navigator_distance(table, query, medoid)?,
            ordinal: medoid,
            explored: false,
        });

        let mut visited = 0usize;
        loop {
            let Some(next) = beam.iter().position(|e| !e.explored) else {
                break;
            };
            beam[next].explored = true;
            visited += 1;
            if visited >= max_visited {
                break;
            }

            let current = beam[next].ordinal;
            // Clone the adjacency: expansion below re-borrows self.
            let neighbors = self.nodes[current as usize].neighbors.clone();
            for n in neighbors {
                let idx = n as usize;
                // Stale edges can point past the arena after a partial
                // load; skip rather than fault.
                if idx >= self.nodes.len() || seen[idx] {
                    continue;
                }
                seen[idx] = true;

                let d = self.navigator_distance(table, query, n)?;
                let pos = beam
                    .binary_search_by(|e| {
                        e.distance
                            .partial_cmp(&d)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or_else(|p| p);
                beam.insert(
                    pos,
                    BeamEntry {
                        distance: d,
                        ordinal: n,
                        explored: false,
                    },
                );
                if beam.len() > cap {
                    beam.pop();
                }
            }
        }

        trace!(visited, beam = beam.len(), "beam search finished");
        Ok(beam)
    }

    /// Robust α-pruning over candidates sorted by ascending distance to
    /// `target`. Returns at most `max_degree` diverse neighbors.
    fn robust_prune(
        &self,
        target: RowId,
        mut candidates: Vec<(f32, RowId)>,
    ) -> Result<Vec<RowId>, IndexError> {
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let alpha = self.config.alpha;
        let mut selected: Vec<RowId> = Vec::with_capacity(self.config.max_degree);
        let mut redundant = vec![false; candidates.len()];

        for i in 0..candidates.len() {
            if selected.len() >= self.config.max_degree {
                break;
            }
            if redundant[i] {
                continue;
            }
            let ord_i = candidates[i].1;
            // The same ordinal may appear twice when the beam's PQ score
            // and the neighbor union's exact score both survived the sort.
            if ord_i == target || selected.contains(&ord_i) || self.nodes[ord_i as usize].deleted {
                continue;
            }
            selected.push(ord_i);

            // Distances are squared; compare in true-distance space so α
            // keeps its Vamana meaning.
            for (j, cand) in candidates.iter().enumerate().skip(i + 1) {
                if redundant[j] {
                    continue;
                }
                let to_selected = self.pair_distance(cand.1, ord_i)?.sqrt();
                let to_target = cand.0.sqrt();
                if to_selected <= to_target / alpha {
                    redundant[j] = true;
                }
            }
        }
        Ok(selected)
    }

    /// Install `from → to` unless the list is full or already has it.
    /// Back-edges are dropped at capacity; the next rebuild restores
    /// symmetry.
    fn add_back_edge(&mut self, from: RowId, to: RowId) {
        let list = &mut self.nodes[from as usize].neighbors;
        if list.len() < self.config.max_degree && !list.contains(&to) {
            list.push(to);
        }
    }

    /// First non-deleted node, used for medoid migration.
    fn first_live(&self) -> Option<RowId> {
        self.nodes
            .iter()
            .position(|n| !n.deleted)
            .map(|i| i as RowId)
    }

    /// Wire one row into the graph: beam search, α-prune, back-edges.
    fn link_node(&mut self, ordinal: RowId, row: &[f32]) -> Result<(), IndexError> {
        let beam = self.beam_search(row, self.config.build_beam_width)?;
        let mut candidates: Vec<(f32, RowId)> = beam
            .into_iter()
            .map(|e| (e.distance, e.ordinal))
            .collect();
        for &n in &self.nodes[ordinal as usize].neighbors {
            let d = l2_squared(row, &self.read_vector(n)?);
            candidates.push((d, n));
        }

        let selected = self.robust_prune(ordinal, candidates)?;
        self.nodes[ordinal as usize].neighbors = selected.clone();
        for n in selected {
            self.add_back_edge(n, ordinal);
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// VectorIndex implementation
// ------------------------------------------------------------------------------------------------

impl VectorIndex for DiskAnnIndex {
    fn kind(&self) -> IndexType {
        IndexType::DiskAnn
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn build(&mut self, store: &VectorStore) -> Result<(), IndexError> {
        let count = store.count() as usize;
        self.nodes = vec![DiskNode::default(); count];
        self.medoid = None;
        self.pq = None;
        self.cache
            .lock()
            .map_err(|_| IndexError::Internal("page cache mutex poisoned".into()))?
            .clear();

        // 1. Stream every slot to disk (tombstoned rows keep their slot
        //    so ordinals stay aligned with byte offsets).
        for ordinal in 0..count as RowId {
            let row = store
                .vector_raw(ordinal)
                .ok_or_else(|| IndexError::Internal(format!("missing row {ordinal}")))?;
            self.write_slot(ordinal, row)?;
            self.nodes[ordinal as usize].deleted = store.is_deleted(ordinal)?;
        }

        let live: Vec<RowId> = (0..count as RowId)
            .filter(|&o| !self.nodes[o as usize].deleted)
            .collect();
        if live.is_empty() {
            debug!("DiskANN build over empty store");
            return Ok(());
        }

        // 2. Medoid: the live row closest to the centroid.
        let mut centroid = vec![0.0f64; store.dimension()];
        for &o in &live {
            for (c, &v) in centroid.iter_mut().zip(store.vector_raw(o).unwrap_or(&[])) {
                *c += f64::from(v);
            }
        }
        let centroid: Vec<f32> = centroid
            .iter()
            .map(|&c| (c / live.len() as f64) as f32)
            .collect();
        let mut best = (f32::INFINITY, live[0]);
        for &o in &live {
            let d = l2_squared(&centroid, store.vector_raw(o).unwrap_or(&[]));
            if d < best.0 {
                best = (d, o);
            }
        }
        self.medoid = Some(best.1);

        // 3. Train the PQ navigator and encode every row.
        let m = if self.config.pq_dim == 0 {
            PqCodebook::auto_m(store.dimension())
        } else {
            self.config.pq_dim
        };
        let rows: Vec<&[f32]> = live
            .iter()
            .filter_map(|&o| store.vector_raw(o))
            .collect();
        let pq = PqCodebook::train(&rows, store.dimension(), m)?;
        for ordinal in 0..count as RowId {
            if let Some(row) = store.vector_raw(ordinal) {
                self.nodes[ordinal as usize].pq_code = Some(pq.encode(row));
            }
        }
        self.pq = Some(pq);

        // 4. Sequential bootstrap adjacency over the live rows.
        for (i, &o) in live.iter().enumerate() {
            let mut neighbors = Vec::with_capacity(self.config.max_degree.min(live.len() - 1));
            for step in 1..=self.config.max_degree.min(live.len() - 1) {
                neighbors.push(live[(i + step) % live.len()]);
            }
            self.nodes[o as usize].neighbors = neighbors;
        }

        // 5. Two Vamana refinement passes.
        for pass in 0..2 {
            for &o in &live {
                let row = store
                    .vector_raw(o)
                    .ok_or_else(|| IndexError::Internal(format!("missing row {o}")))?
                    .to_vec();
                self.link_node(o, &row)?;
            }
            debug!(pass, edges = self.edge_count(), "Vamana pass complete");
        }

        info!(
            count,
            live = live.len(),
            medoid = ?self.medoid,
            edges = self.edge_count(),
            "DiskANN build complete"
        );
        Ok(())
    }

    fn insert(&mut self, store: &VectorStore, ordinal: RowId) -> Result<(), IndexError> {
        if (ordinal as usize) != self.nodes.len() {
            return Err(IndexError::Internal(format!(
                "non-sequential DiskANN insert: ordinal {ordinal}, arena {}",
                self.nodes.len()
            )));
        }
        let row = store
            .vector_raw(ordinal)
            .ok_or_else(|| IndexError::Internal(format!("missing row {ordinal}")))?
            .to_vec();

        self.write_slot(ordinal, &row)?;
        let pq_code = self.pq.as_ref().map(|pq| pq.encode(&row));
        self.nodes.push(DiskNode {
            neighbors: Vec::new(),
            pq_code,
            deleted: false,
        });

        if self.medoid.is_none() {
            self.medoid = Some(ordinal);
            return Ok(());
        }

        self.link_node(ordinal, &row)
    }

    fn remove(&mut self, _store: &VectorStore, ordinal: RowId) -> Result<(), IndexError> {
        let idx = ordinal as usize;
        if idx >= self.nodes.len() {
            return Err(IndexError::Internal(format!(
                "remove of unindexed ordinal {ordinal}"
            )));
        }
        self.nodes[idx].deleted = true;

        // Stale in-edges stay; emission filters them. Only the entry
        // point must migrate.
        if self.medoid == Some(ordinal) {
            self.medoid = self.first_live();
        }
        Ok(())
    }

    fn update(&mut self, store: &VectorStore, ordinal: RowId) -> Result<(), IndexError> {
        let idx = ordinal as usize;
        if idx >= self.nodes.len() {
            return Err(IndexError::Internal(format!(
                "update of unindexed ordinal {ordinal}"
            )));
        }
        let row = store
            .vector_raw(ordinal)
            .ok_or_else(|| IndexError::Internal(format!("missing row {ordinal}")))?
            .to_vec();

        self.write_slot(ordinal, &row)?;
        self.nodes[idx].pq_code = self.pq.as_ref().map(|pq| pq.encode(&row));
        self.nodes[idx].neighbors.clear();
        self.link_node(ordinal, &row)
    }

    fn search(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Metric,
        opts: &SearchOptions,
    ) -> Result<Vec<Neighbor>, IndexError> {
        check_k(k)?;
        let beam_width = opts
            .ef_override
            .unwrap_or(self.config.search_beam_width)
            .max(k);

        let beam = self.beam_search(query, beam_width)?;

        // Exact re-rank from disk; tombstoned rows drop out here.
        let mut results = Vec::with_capacity(beam.len());
        for entry in beam {
            let idx = entry.ordinal as usize;
            if self.nodes[idx].deleted || store.is_deleted(entry.ordinal).unwrap_or(true) {
                continue;
            }
            let exact = self.read_vector(entry.ordinal)?;
            results.push(Neighbor {
                ordinal: entry.ordinal,
                distance: metric.distance(query, &exact),
            });
        }
        sort_neighbors(&mut results);
        results.truncate(k);
        Ok(results)
    }

    fn range_search(
        &self,
        store: &VectorStore,
        query: &[f32],
        radius: f32,
        metric: Metric,
        max_results: Option<usize>,
    ) -> Result<Vec<Neighbor>, IndexError> {
        if radius < 0.0 || !radius.is_finite() {
            return Err(IndexError::InvalidArgument(format!(
                "radius must be finite and >= 0, got {radius}"
            )));
        }
        let beam_width = max_results
            .unwrap_or(2 * self.config.search_beam_width)
            .max(self.config.search_beam_width);

        let beam = self.beam_search(query, beam_width)?;
        let mut results = Vec::new();
        for entry in beam {
            let idx = entry.ordinal as usize;
            if self.nodes[idx].deleted || store.is_deleted(entry.ordinal).unwrap_or(true) {
                continue;
            }
            let exact = self.read_vector(entry.ordinal)?;
            let d = metric.distance(query, &exact);
            if d <= radius {
                results.push(Neighbor {
                    ordinal: entry.ordinal,
                    distance: d,
                });
            }
        }
        sort_neighbors(&mut results);
        if let Some(max) = max_results {
            results.truncate(max);
        }
        Ok(results)
    }

    fn save_to(&self, store: &VectorStore, buf: &mut Vec<u8>) -> Result<(), IndexError> {
        DISKANN_MAGIC.encode_to(buf)?;
        DISKANN_VERSION.encode_to(buf)?;
        (self.dimension as u32).encode_to(buf)?;
        (self.nodes.len() as u64).encode_to(buf)?;

        (self.config.max_degree as u32).encode_to(buf)?;
        self.config.alpha.encode_to(buf)?;
        (self.config.build_beam_width as u32).encode_to(buf)?;
        (self.config.search_beam_width as u32).encode_to(buf)?;
        (self.config.pq_dim as u32).encode_to(buf)?;
        (self.config.cache_size_mb as u32).encode_to(buf)?;
        (self.config.sector_size as u32).encode_to(buf)?;

        self.medoid.encode_to(buf)?;
        self.pq.encode_to(buf)?;

        for (i, node) in self.nodes.iter().enumerate() {
            node.deleted.encode_to(buf)?;
            encoding::encode_vec(&node.neighbors, buf)?;
            node.pq_code.encode_to(buf)?;
            let metadata = match store.metadata(i as RowId) {
                Ok(pairs) => to_encoded_pairs(pairs),
                Err(_) => Vec::new(),
            };
            encoding::encode_vec(&metadata, buf)?;
        }

        // Trailing reference to the slot file carrying the vectors.
        self.config.data_path.clone().encode_to(buf)?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Load
// ------------------------------------------------------------------------------------------------

impl DiskAnnIndex {
    /// Reconstruct an index from a save block.
    ///
    /// Returns the index, the rows needed to rebuild the store (vectors
    /// read back from the slot file), and the bytes consumed.
    pub fn load(buf: &[u8]) -> Result<(Self, Vec<LoadedRow>, usize), IndexError> {
        let (magic, mut offset) = <[u8; 4]>::decode_from(buf)?;
        if magic != DISKANN_MAGIC {
            return Err(IndexError::Format("bad DiskANN magic".into()));
        }
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        if version != DISKANN_VERSION {
            return Err(IndexError::Format(format!(
                "unsupported DiskANN version {version}"
            )));
        }

        let (dimension, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;

        let (max_degree, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (alpha, n) = f32::decode_from(&buf[offset..])?;
        offset += n;
        let (build_beam_width, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (search_beam_width, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (pq_dim, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (cache_size_mb, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (sector_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;

        let (medoid, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        let (pq, n) = Option::<PqCodebook>::decode_from(&buf[offset..])?;
        offset += n;

        let mut nodes = Vec::with_capacity(count as usize);
        let mut metadata_chains = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (deleted, n) = bool::decode_from(&buf[offset..])?;
            offset += n;
            let (neighbors, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
            offset += n;
            let (pq_code, n) = Option::<Vec<u8>>::decode_from(&buf[offset..])?;
            offset += n;
            let (metadata, n) = encoding::decode_vec::<EncodedPair>(&buf[offset..])?;
            offset += n;

            nodes.push(DiskNode {
                neighbors,
                pq_code,
                deleted,
            });
            metadata_chains.push(metadata);
        }

        let (data_path, n) = PathBuf::decode_from(&buf[offset..])?;
        offset += n;

        let config = DiskAnnConfig {
            max_degree: max_degree as usize,
            alpha,
            build_beam_width: build_beam_width as usize,
            search_beam_width: search_beam_width as usize,
            pq_dim: pq_dim as usize,
            data_path,
            cache_size_mb: cache_size_mb as usize,
            sector_size: sector_size as usize,
        };

        let mut index = Self::new(dimension as usize, config)?;
        index.nodes = nodes;
        index.medoid = medoid;
        index.pq = pq;

        // Rebuild the store rows by reading every slot back.
        let mut rows = Vec::with_capacity(count as usize);
        for (ordinal, chain) in metadata_chains.into_iter().enumerate() {
            let vector = index.read_vector(ordinal as RowId)?;
            rows.push(LoadedRow {
                vector,
                metadata: from_encoded_pairs(chain),
                deleted: index.nodes[ordinal].deleted,
            });
        }

        info!(
            count,
            medoid = ?index.medoid,
            path = %index.config.data_path.display(),
            "DiskANN index loaded"
        );
        Ok((index, rows, offset))
    }

    /// Open a save block from a file path (used by tests and tools).
    pub fn load_from_file(path: &Path) -> Result<(Self, Vec<LoadedRow>), IndexError> {
        let buf = std::fs::read(path)?;
        let (index, rows, _) = Self::load(&buf)?;
        Ok((index, rows))
    }
}
