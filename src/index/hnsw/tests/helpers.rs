use crate::distance::Metric;
use crate::index::VectorIndex;
use crate::index::hnsw::{HnswConfig, HnswIndex};
use crate::metadata::{MetaPair, MetaValue};
use crate::store::VectorStore;

/// Deterministic pseudo-random row derived from the index, dimension-`dim`.
pub fn synthetic_row(i: usize, dim: usize) -> Vec<f32> {
    (0..dim)
        .map(|d| ((i * 31 + d * 7) % 997) as f32 / 997.0 - 0.5)
        .collect()
}

/// Store + index populated with `n` synthetic rows.
pub fn populated(n: usize, dim: usize, config: HnswConfig) -> (VectorStore, HnswIndex) {
    let mut store = VectorStore::new(dim).unwrap();
    let mut index = HnswIndex::new(Metric::L2, config).unwrap();
    for i in 0..n {
        let ordinal = store.add(&synthetic_row(i, dim), Vec::new()).unwrap();
        index.insert(&store, ordinal).unwrap();
    }
    (store, index)
}

pub fn tag(key: &str, value: &str) -> Vec<MetaPair> {
    vec![(key.to_string(), MetaValue::Str(value.to_string()))]
}
