//! HNSW index — hierarchical navigable small-world graph.
//!
//! Nodes live in an arena keyed by row ordinal; each node carries one
//! neighbor list per level `0..=node.level`, bounded by `M` (level 0
//! uses `2·M`, which is where recall is won). An entry point at the
//! current top level bootstraps every search and insertion: greedy
//! descent through the upper levels, then a bounded beam (`ef`) at the
//! target level.
//!
//! ## Level selection
//!
//! A new node's level is `floor(−ln(U) / ln 2)` for `U` uniform on
//! (0, 1], clamped to `max_level`. The generator is seeded, so a given
//! insertion sequence always produces the same graph.
//!
//! ## Deletes
//!
//! Deletion tombstones the node and scrubs it out of every other
//! neighbor list. Traversal may still pass *through* tombstoned nodes
//! (they keep their out-edges as bridges), but results never emit them.
//! The entry point migrates to the first live node when its own row
//! dies. Graph quality degrades gracefully; compaction rebuilds.
//!
//! ## Back-edge overflow
//!
//! When a bidirectional connection would push a neighbor's list past its
//! bound, the victim's list is **re-pruned with the same diversity
//! heuristic used at insert** rather than silently dropping the new
//! edge. This keeps degrees bounded and stays deterministic for a fixed
//! input sequence.
//!
//! ## Binary quantization (optional)
//!
//! Each node may carry a sign-bit fingerprint. Traversal then orders
//! candidates by Hamming distance, and the top `quant_rerank` are
//! re-scored exactly before the top k emerge. Disabling the knob yields
//! identical ranking semantics, just slower coarse ordering.

#[cfg(test)]
mod tests;

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::distance::{Metric, binary_code, hamming_distance};
use crate::encoding::{self, Decode, Encode};
use crate::index::{
    IndexError, IndexType, LoadedRow, Neighbor, SearchOptions, VectorIndex, check_k,
    sort_neighbors,
};
use crate::metadata::{EncodedPair, from_encoded_pairs, to_encoded_pairs};
use crate::store::{RowId, VectorStore};

/// Magic bytes of an HNSW save block.
pub const HNSW_MAGIC: [u8; 4] = *b"PXHN";

/// Save-block format version. Version 2 embeds per-row metadata chains.
pub const HNSW_VERSION: u32 = 2;

/// Seed for the level generator — fixed so a given insertion sequence
/// is reproducible across runs and reloads.
const LEVEL_RNG_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// `1 / ln 2`, the level-selection normalizer.
const LEVEL_NORM: f64 = std::f64::consts::LOG2_E;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning for an [`HnswIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HnswConfig {
    /// Neighbor bound per level (level 0 uses `2·m`).
    pub m: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Default beam width during search.
    pub ef_search: usize,
    /// Hard cap on node levels.
    pub max_level: usize,
    /// Store sign-bit fingerprints and traverse by Hamming distance.
    pub use_binary_quant: bool,
    /// How many Hamming-ordered candidates get exact re-scoring.
    pub quant_rerank: usize,
    /// Widen the beam for filtered queries.
    pub use_acorn: bool,
    /// ACORN expansion hops (1 or 2).
    pub acorn_hops: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            max_level: 16,
            use_binary_quant: false,
            quant_rerank: 64,
            use_acorn: false,
            acorn_hops: 1,
        }
    }
}

impl HnswConfig {
    /// Validate tuning values.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.m == 0 || self.ef_construction == 0 || self.ef_search == 0 {
            return Err(IndexError::InvalidArgument(
                "m, ef_construction, and ef_search must be > 0".into(),
            ));
        }
        if self.max_level == 0 {
            return Err(IndexError::InvalidArgument("max_level must be > 0".into()));
        }
        if !(1..=2).contains(&self.acorn_hops) {
            return Err(IndexError::InvalidArgument(format!(
                "acorn_hops must be 1 or 2, got {}",
                self.acorn_hops
            )));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Node and candidate types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct HnswNode {
    /// Top level of this node.
    level: usize,
    /// Neighbor lists for levels `0..=level`.
    neighbors: Vec<Vec<RowId>>,
    /// Tombstone flag.
    deleted: bool,
    /// Sign-bit fingerprint when binary quantization is on.
    binary: Option<Vec<u8>>,
}

/// Beam candidate. `Ord` is reversed on distance so `BinaryHeap` pops
/// the **closest** first.
#[derive(Debug, Copy, Clone, PartialEq)]
struct Candidate {
    ordinal: RowId,
    distance: f32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| other.ordinal.cmp(&self.ordinal))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// How the beam scores a node against the query: exact metric distance,
/// or Hamming over sign-bit fingerprints.
enum QueryScorer<'a> {
    Exact {
        metric: Metric,
        query: &'a [f32],
    },
    Binary {
        code: Vec<u8>,
    },
}

// ------------------------------------------------------------------------------------------------
// Index
// ------------------------------------------------------------------------------------------------

/// Hierarchical small-world graph over store ordinals.
#[derive(Debug)]
pub struct HnswIndex {
    config: HnswConfig,
    /// Metric the graph edges were built under.
    metric: Metric,
    /// Arena keyed by row ordinal.
    nodes: Vec<HnswNode>,
    /// Entry node at the current top level.
    entry_point: Option<RowId>,
    /// Level of the entry point.
    top_level: usize,
    /// Seeded level generator.
    rng: StdRng,
}

impl HnswIndex {
    /// Create an empty index.
    pub fn new(metric: Metric, config: HnswConfig) -> Result<Self, IndexError> {
        config.validate()?;
        Ok(Self {
            config,
            metric,
            nodes: Vec::new(),
            entry_point: None,
            top_level: 0,
            rng: StdRng::seed_from_u64(LEVEL_RNG_SEED),
        })
    }

    /// The tuning this index runs with.
    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Current entry point.
    pub fn entry_point(&self) -> Option<RowId> {
        self.entry_point
    }

    /// Total graph edges across all levels (diagnostics and tests).
    pub fn edge_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.neighbors.iter().map(Vec::len).sum::<usize>())
            .sum()
    }

    /// Neighbor-list length per level for one node (diagnostics).
    pub fn neighbor_counts(&self, ordinal: RowId) -> Option<Vec<usize>> {
        self.nodes
            .get(ordinal as usize)
            .map(|n| n.neighbors.iter().map(Vec::len).collect())
    }

    /// Draw a level: `floor(−ln(U) / ln 2)`, clamped.
    fn random_level(&mut self) -> usize {
        let u: f64 = 1.0 - self.rng.random::<f64>(); // (0, 1]
        let level = (-u.ln() * LEVEL_NORM).floor() as usize;
        level.min(self.config.max_level)
    }

    /// Neighbor bound for a level.
    #[inline]
    fn m_for(&self, level: usize) -> usize {
        if level == 0 {
            self.config.m * 2
        } else {
            self.config.m
        }
    }

    /// Score one node against the query.
    #[inline]
    fn score(&self, store: &VectorStore, scorer: &QueryScorer<'_>, ordinal: RowId) -> f32 {
        match scorer {
            QueryScorer::Exact { metric, query } => match store.vector_raw(ordinal) {
                Some(row) => metric.distance(query, row),
                None => f32::INFINITY,
            },
            QueryScorer::Binary { code } => {
                let node = &self.nodes[ordinal as usize];
                match &node.binary {
                    Some(fp) => hamming_distance(code, fp) as f32,
                    None => match store.vector_raw(ordinal) {
                        Some(row) => hamming_distance(code, &binary_code(row)) as f32,
                        None => f32::INFINITY,
                    },
                }
            }
        }
    }

    /// Greedy descent: at each level from `from` down to `to`
    /// (exclusive), move to the neighbor closest to the query until no
    /// improvement.
    fn greedy_descend(
        &self,
        store: &VectorStore,
        scorer: &QueryScorer<'_>,
        mut current: RowId,
        from: usize,
        to: usize,
    ) -> RowId {
        let mut current_dist = self.score(store, scorer, current);
        for level in (to..=from).rev() {
            let mut improved = true;
            while improved {
                improved = false;
                let node = &self.nodes[current as usize];
                if node.neighbors.len() <= level {
                    break;
                }
                for &n in &node.neighbors[level] {
                    let d = self.score(store, scorer, n);
                    if d < current_dist {
                        current_dist = d;
                        current = n;
                        improved = true;
                    }
                }
            }
        }
        current
    }

    /// Bounded beam at one level. Traversal passes through tombstoned
    /// nodes; the returned candidates (ascending by distance) contain
    /// only live ones.
    fn search_layer(
        &self,
        store: &VectorStore,
        scorer: &QueryScorer<'_>,
        entry: RowId,
        level: usize,
        ef: usize,
    ) -> Vec<Candidate> {
        let mut visited = vec![false; self.nodes.len()];
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef + 1);
        let mut results: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(ef + 1);

        let first = Candidate {
            ordinal: entry,
            distance: self.score(store, scorer, entry),
        };
        visited[entry as usize] = true;
        candidates.push(first);
        if !self.nodes[entry as usize].deleted {
            results.push(Reverse(first));
        }

        while let Some(cand) = candidates.pop() {
            if let Some(Reverse(worst)) = results.peek() {
                if results.len() >= ef && cand.distance > worst.distance {
                    break;
                }
            }

            let node = &self.nodes[cand.ordinal as usize];
            if node.neighbors.len() <= level {
                continue;
            }
            for &n in &node.neighbors[level] {
                let idx = n as usize;
                if idx >= self.nodes.len() || visited[idx] {
                    continue;
                }
                visited[idx] = true;

                let d = self.score(store, scorer, n);
                let admit = match results.peek() {
                    Some(Reverse(worst)) => results.len() < ef || d < worst.distance,
                    None => true,
                };
                if !admit {
                    continue;
                }

                let c = Candidate {
                    ordinal: n,
                    distance: d,
                };
                candidates.push(c);
                if !self.nodes[idx].deleted {
                    results.push(Reverse(c));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = results.into_iter().map(|Reverse(c)| c).collect();
        out.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        out
    }

    /// Diversity heuristic: walk candidates closest-first, keeping one
    /// when no already-kept neighbor is closer to it than it is to the
    /// target. Caps at `m`.
    fn select_neighbors(
        &self,
        store: &VectorStore,
        candidates: &[Candidate],
        m: usize,
    ) -> Vec<RowId> {
        let mut selected: Vec<RowId> = Vec::with_capacity(m);
        for cand in candidates {
            if selected.len() >= m {
                break;
            }
            let Some(cand_row) = store.vector_raw(cand.ordinal) else {
                continue;
            };
            let mut diverse = true;
            for &kept in &selected {
                if let Some(kept_row) = store.vector_raw(kept) {
                    if self.metric.distance(cand_row, kept_row) < cand.distance {
                        diverse = false;
                        break;
                    }
                }
            }
            if diverse {
                selected.push(cand.ordinal);
            }
        }
        selected
    }

    /// Re-prune a node's neighbor list at one level down to the bound,
    /// using the same diversity heuristic as insertion.
    fn reprune(&mut self, store: &VectorStore, ordinal: RowId, level: usize) {
        let m = self.m_for(level);
        let Some(row) = store.vector_raw(ordinal) else {
            return;
        };
        let current = self.nodes[ordinal as usize].neighbors[level].clone();
        let mut candidates: Vec<Candidate> = current
            .iter()
            .filter_map(|&n| {
                store.vector_raw(n).map(|nrow| Candidate {
                    ordinal: n,
                    distance: self.metric.distance(row, nrow),
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(CmpOrdering::Equal)
        });
        let kept = self.select_neighbors(store, &candidates, m);
        self.nodes[ordinal as usize].neighbors[level] = kept;
    }

    /// Scrub `ordinal` from every other node's neighbor lists.
    fn scrub_edges_to(&mut self, ordinal: RowId) {
        for node in &mut self.nodes {
            for list in &mut node.neighbors {
                list.retain(|&n| n != ordinal);
            }
        }
    }

    /// Wire a freshly placed node into the graph (its arena slot must
    /// already exist with its level and empty lists).
    fn wire_node(&mut self, store: &VectorStore, ordinal: RowId) -> Result<(), IndexError> {
        let level = self.nodes[ordinal as usize].level;
        let Some(entry) = self.entry_point else {
            self.entry_point = Some(ordinal);
            self.top_level = level;
            return Ok(());
        };

        let row = store
            .vector_raw(ordinal)
            .ok_or_else(|| IndexError::Internal(format!("missing row {ordinal}")))?
            .to_vec();
        let scorer = QueryScorer::Exact {
            metric: self.metric,
            query: &row,
        };

        // Phase 1: zoom in through the levels above the new node.
        let mut current = entry;
        if self.top_level > level {
            current = self.greedy_descend(store, &scorer, entry, self.top_level, level + 1);
        }

        // Phase 2: connect on each level from min(level, top) down to 0.
        for lc in (0..=level.min(self.top_level)).rev() {
            let mut candidates =
                self.search_layer(store, &scorer, current, lc, self.config.ef_construction);
            // A node rewired with itself as the entry must not self-link.
            candidates.retain(|c| c.ordinal != ordinal);
            let m = self.m_for(lc);
            let selected = self.select_neighbors(store, &candidates, m);

            self.nodes[ordinal as usize].neighbors[lc] = selected.clone();
            for &s in &selected {
                let list = &mut self.nodes[s as usize].neighbors[lc];
                if !list.contains(&ordinal) {
                    list.push(ordinal);
                }
                if self.nodes[s as usize].neighbors[lc].len() > m {
                    self.reprune(store, s, lc);
                }
            }

            if let Some(best) = selected.first().or(candidates.first().map(|c| &c.ordinal)) {
                current = *best;
            }
        }

        if level > self.top_level {
            self.top_level = level;
            self.entry_point = Some(ordinal);
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// VectorIndex implementation
// ------------------------------------------------------------------------------------------------

impl VectorIndex for HnswIndex {
    fn kind(&self) -> IndexType {
        IndexType::Hnsw
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn build(&mut self, store: &VectorStore) -> Result<(), IndexError> {
        self.nodes.clear();
        self.entry_point = None;
        self.top_level = 0;

        let count = store.count();
        for ordinal in 0..count {
            if store.is_deleted(ordinal)? {
                // Placeholder keeping the arena aligned with ordinals.
                self.nodes.push(HnswNode {
                    level: 0,
                    neighbors: vec![Vec::new()],
                    deleted: true,
                    binary: None,
                });
            } else {
                self.insert(store, ordinal)?;
            }
        }
        info!(count, edges = self.edge_count(), "HNSW build complete");
        Ok(())
    }

    fn insert(&mut self, store: &VectorStore, ordinal: RowId) -> Result<(), IndexError> {
        if (ordinal as usize) != self.nodes.len() {
            return Err(IndexError::Internal(format!(
                "non-sequential HNSW insert: ordinal {ordinal}, arena {}",
                self.nodes.len()
            )));
        }
        let row = store
            .vector_raw(ordinal)
            .ok_or_else(|| IndexError::Internal(format!("missing row {ordinal}")))?;

        let level = self.random_level();
        let binary = self.config.use_binary_quant.then(|| binary_code(row));
        self.nodes.push(HnswNode {
            level,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
            binary,
        });

        self.wire_node(store, ordinal)
    }

    fn remove(&mut self, _store: &VectorStore, ordinal: RowId) -> Result<(), IndexError> {
        let idx = ordinal as usize;
        if idx >= self.nodes.len() {
            return Err(IndexError::Internal(format!(
                "remove of unindexed ordinal {ordinal}"
            )));
        }
        self.nodes[idx].deleted = true;
        self.scrub_edges_to(ordinal);

        if self.entry_point == Some(ordinal) {
            // Migrate to the first live node.
            let next = self
                .nodes
                .iter()
                .position(|n| !n.deleted)
                .map(|i| i as RowId);
            self.entry_point = next;
            self.top_level = next.map_or(0, |n| self.nodes[n as usize].level);
            debug!(victim = ordinal, new_entry = ?next, "entry point migrated");
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
            .ok_or_else(|| IndexError::Internal(format!("missing row {ordinal}")))?;

        // Rewire at the same level with the new coordinates.
        self.scrub_edges_to(ordinal);
        let level = self.nodes[idx].level;
        self.nodes[idx].neighbors = vec![Vec::new(); level + 1];
        self.nodes[idx].binary = self.config.use_binary_quant.then(|| binary_code(row));

        // The victim may have been the entry point; wiring handles the
        // empty-graph case, so only a vanished entry needs repair.
        if self.entry_point == Some(ordinal) && self.nodes.len() > 1 {
            if let Some(other) = self
                .nodes
                .iter()
                .enumerate()
                .position(|(i, n)| !n.deleted && i != idx)
            {
                self.entry_point = Some(other as RowId);
                self.top_level = self.nodes[other].level;
            }
        }
        self.wire_node(store, ordinal)
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
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };

        let mut ef = opts.ef_override.unwrap_or(self.config.ef_search).max(k);
        if opts.filtered && self.config.use_acorn {
            // Compensate post-filter loss: ef · (hops + 1), capped at 3×.
            ef *= (self.config.acorn_hops + 1).min(3);
        }

        let scorer = if self.config.use_binary_quant {
            QueryScorer::Binary {
                code: binary_code(query),
            }
        } else {
            QueryScorer::Exact { metric, query }
        };

        let start = self.greedy_descend(store, &scorer, entry, self.top_level, 1);
        let candidates = self.search_layer(store, &scorer, start, 0, ef);

        let mut results: Vec<Neighbor> = if self.config.use_binary_quant {
            // Exact re-scoring of the Hamming-ordered head.
            let rerank = self.config.quant_rerank.max(k);
            candidates
                .iter()
                .take(rerank)
                .filter_map(|c| {
                    store.vector_raw(c.ordinal).map(|row| Neighbor {
                        ordinal: c.ordinal,
                        distance: metric.distance(query, row),
                    })
                })
                .collect()
        } else {
            candidates
                .iter()
                .map(|c| Neighbor {
                    ordinal: c.ordinal,
                    distance: c.distance,
                })
                .collect()
        };

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
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };

        // Range search always scores exactly — the radius lives in
        // metric space, not Hamming space.
        let scorer = QueryScorer::Exact { metric, query };
        let start = self.greedy_descend(store, &scorer, entry, self.top_level, 1);

        // Seed the frontier with a k-NN beam to get inside the radius,
        // then keep expanding while any unexplored candidate is still
        // within it. The min-heap makes the stop exact: once the closest
        // frontier entry exceeds the radius, everything behind it does.
        let seed = self.search_layer(store, &scorer, start, 0, self.config.ef_search);

        let mut visited = vec![false; self.nodes.len()];
        let mut frontier: BinaryHeap<Candidate> = BinaryHeap::new();
        visited[start as usize] = true;
        frontier.push(Candidate {
            ordinal: start,
            distance: self.score(store, &scorer, start),
        });
        for c in seed {
            if !visited[c.ordinal as usize] {
                visited[c.ordinal as usize] = true;
                frontier.push(c);
            }
        }

        let mut results: Vec<Neighbor> = Vec::new();
        while let Some(cand) = frontier.pop() {
            if cand.distance > radius {
                break;
            }
            if !self.nodes[cand.ordinal as usize].deleted {
                results.push(Neighbor {
                    ordinal: cand.ordinal,
                    distance: cand.distance,
                });
            }
            let node = &self.nodes[cand.ordinal as usize];
            if node.neighbors.is_empty() {
                continue;
            }
            for &n in &node.neighbors[0] {
                let idx = n as usize;
                if idx >= self.nodes.len() || visited[idx] {
                    continue;
                }
                visited[idx] = true;
                frontier.push(Candidate {
                    ordinal: n,
                    distance: self.score(store, &scorer, n),
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
        HNSW_MAGIC.encode_to(buf)?;
        HNSW_VERSION.encode_to(buf)?;
        (store.dimension() as u32).encode_to(buf)?;
        (self.nodes.len() as u64).encode_to(buf)?;

        (self.config.m as u32).encode_to(buf)?;
        (self.config.ef_construction as u32).encode_to(buf)?;
        (self.config.ef_search as u32).encode_to(buf)?;
        (self.config.max_level as u32).encode_to(buf)?;
        self.config.use_binary_quant.encode_to(buf)?;
        (self.config.quant_rerank as u32).encode_to(buf)?;
        self.config.use_acorn.encode_to(buf)?;
        (self.config.acorn_hops as u32).encode_to(buf)?;

        self.metric.as_tag().encode_to(buf)?;
        self.entry_point.encode_to(buf)?;
        (self.top_level as u32).encode_to(buf)?;

        // Pass 1: per-node metadata — level, tombstone, full vector,
        // metadata chain, optional fingerprint.
        for (i, node) in self.nodes.iter().enumerate() {
            (node.level as u32).encode_to(buf)?;
            node.deleted.encode_to(buf)?;
            let vector = store
                .vector_raw(i as RowId)
                .ok_or_else(|| IndexError::Internal(format!("missing row {i}")))?;
            vector.encode_to(buf)?;
            let metadata = match store.metadata(i as RowId) {
                Ok(pairs) => to_encoded_pairs(pairs),
                Err(_) => Vec::new(),
            };
            encoding::encode_vec(&metadata, buf)?;
            node.binary.encode_to(buf)?;
        }

        // Pass 2: adjacency, one list per level, in enumeration order.
        for node in &self.nodes {
            for list in &node.neighbors {
                encoding::encode_vec(list, buf)?;
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Load
// ------------------------------------------------------------------------------------------------

impl HnswIndex {
    /// Reconstruct an index from a save block.
    ///
    /// Returns the index, the rows needed to rebuild the store, and the
    /// bytes consumed. Nodes are reconstructed first, then adjacency is
    /// wired by enumeration order — symmetric with [`save_to`].
    ///
    /// [`save_to`]: VectorIndex::save_to
    pub fn load(buf: &[u8]) -> Result<(Self, Vec<LoadedRow>, usize), IndexError> {
        let (magic, mut offset) = <[u8; 4]>::decode_from(buf)?;
        if magic != HNSW_MAGIC {
            return Err(IndexError::Format("bad HNSW magic".into()));
        }
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        if version != HNSW_VERSION {
            return Err(IndexError::Format(format!(
                "unsupported HNSW version {version}"
            )));
        }

        let (_dimension, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;

        let (m, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (ef_construction, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (ef_search, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (max_level, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (use_binary_quant, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let (quant_rerank, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (use_acorn, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let (acorn_hops, n) = u32::decode_from(&buf[offset..])?;
        offset += n;

        let (metric_tag, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let metric = Metric::from_tag(metric_tag)
            .ok_or_else(|| IndexError::Format(format!("unknown metric tag {metric_tag}")))?;
        let (entry_point, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        let (top_level, n) = u32::decode_from(&buf[offset..])?;
        offset += n;

        let config = HnswConfig {
            m: m as usize,
            ef_construction: ef_construction as usize,
            ef_search: ef_search as usize,
            max_level: max_level as usize,
            use_binary_quant,
            quant_rerank: quant_rerank as usize,
            use_acorn,
            acorn_hops: acorn_hops as usize,
        };

        // Pass 1: nodes and rows.
        let mut nodes = Vec::with_capacity(count as usize);
        let mut rows = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (level, n) = u32::decode_from(&buf[offset..])?;
            offset += n;
            let (deleted, n) = bool::decode_from(&buf[offset..])?;
            offset += n;
            let (vector, n) = Vec::<f32>::decode_from(&buf[offset..])?;
            offset += n;
            let (metadata, n) = encoding::decode_vec::<EncodedPair>(&buf[offset..])?;
            offset += n;
            let (binary, n) = Option::<Vec<u8>>::decode_from(&buf[offset..])?;
            offset += n;

            nodes.push(HnswNode {
                level: level as usize,
                neighbors: vec![Vec::new(); level as usize + 1],
                deleted,
                binary,
            });
            rows.push(LoadedRow {
                vector,
                metadata: from_encoded_pairs(metadata),
                deleted,
            });
        }

        // Pass 2: adjacency, wired by the same enumeration order.
        for node in &mut nodes {
            for list in &mut node.neighbors {
                let (neighbors, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
                offset += n;
                *list = neighbors;
            }
        }

        let mut index = Self::new(metric, config)?;
        index.nodes = nodes;
        index.entry_point = entry_point;
        index.top_level = top_level as usize;

        info!(count, entry = ?index.entry_point, "HNSW index loaded");
        Ok((index, rows, offset))
    }
}
