use tempfile::TempDir;

use crate::index::VectorIndex;
use crate::index::diskann::{DiskAnnConfig, DiskAnnIndex};
use crate::store::VectorStore;

/// The synthetic family used across DiskANN tests:
/// `v_i[d] = sin(i + 0.5 · d)`.
pub fn wave_row(i: usize, dim: usize) -> Vec<f32> {
    (0..dim)
        .map(|d| ((i as f32) + 0.5 * d as f32).sin())
        .collect()
}

/// Config whose slot file lives inside `tmp`.
pub fn config_in(tmp: &TempDir) -> DiskAnnConfig {
    DiskAnnConfig {
        data_path: tmp.path().join("diskann.dat"),
        cache_size_mb: 4,
        ..DiskAnnConfig::default()
    }
}

/// Store of `n` wave rows plus a built index over them.
pub fn built(tmp: &TempDir, n: usize, dim: usize) -> (VectorStore, DiskAnnIndex) {
    let mut store = VectorStore::new(dim).unwrap();
    for i in 0..n {
        store.add(&wave_row(i, dim), Vec::new()).unwrap();
    }
    let mut index = DiskAnnIndex::new(dim, config_in(tmp)).unwrap();
    index.build(&store).unwrap();
    (store, index)
}
