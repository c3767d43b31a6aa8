//! Product quantization for the DiskANN in-memory navigator.
//!
//! A [`PqCodebook`] splits the `dimension`-long row into `m` contiguous
//! subvectors of `dsub = dimension / m` components each. Every subspace
//! carries up to [`MAX_CENTROIDS`] centroids trained with Lloyd's
//! algorithm; a row is then stored as one byte per subspace — the index
//! of its nearest centroid.
//!
//! Approximate distance between a query and a code is the sum over
//! subspaces of the **squared** L2 distance between the query subvector
//! and the code's centroid. Squared distances keep the beam ordering
//! identical to true L2 while skipping the `sqrt` per candidate.
//!
//! Training is deterministic: initial centroids are linearly spaced over
//! the training rows, and ties in assignment break toward the lower
//! centroid index.

use crate::distance::l2_squared;
use crate::encoding::{Decode, Encode, EncodingError};
use crate::index::IndexError;

/// Upper bound on centroids per subspace — codes are one byte.
pub const MAX_CENTROIDS: usize = 256;

/// Lloyd's iterations used at build time.
const TRAIN_ITERATIONS: usize = 10;

/// A trained product-quantization codebook.
#[derive(Debug, Clone, PartialEq)]
pub struct PqCodebook {
    /// Number of sub-quantizers.
    m: usize,
    /// Components per subspace; `m · dsub = dimension`.
    dsub: usize,
    /// Centroids per subspace (≤ 256; smaller when training data is).
    ksub: usize,
    /// `m · ksub · dsub` floats, subspace-major.
    centroids: Vec<f32>,
}

impl PqCodebook {
    /// Pick a sub-quantizer count for `dimension` when the caller asked
    /// for auto (`pq_dim = 0`): the largest of the preferred widths that
    /// divides the dimension evenly.
    pub fn auto_m(dimension: usize) -> usize {
        for m in [16usize, 8, 4, 2] {
            if m <= dimension && dimension % m == 0 {
                return m;
            }
        }
        1
    }

    /// Train a codebook over `rows` with Lloyd's algorithm.
    ///
    /// `m` must divide `dimension` evenly; `rows` must be non-empty and
    /// every row `dimension` long.
    pub fn train(rows: &[&[f32]], dimension: usize, m: usize) -> Result<Self, IndexError> {
        if rows.is_empty() {
            return Err(IndexError::InvalidArgument(
                "cannot train PQ on zero rows".into(),
            ));
        }
        if m == 0 || dimension % m != 0 {
            return Err(IndexError::InvalidArgument(format!(
                "pq sub-quantizer count {m} does not divide dimension {dimension}"
            )));
        }

        let dsub = dimension / m;
        let ksub = MAX_CENTROIDS.min(rows.len());
        let mut centroids = vec![0.0f32; m * ksub * dsub];

        for sub in 0..m {
            let sub_offset = sub * dsub;

            // Linearly spaced initialization over the training rows.
            for j in 0..ksub {
                let row = rows[j * rows.len() / ksub];
                let dst = Self::centroid_range(sub, j, dsub, ksub);
                centroids[dst].copy_from_slice(&row[sub_offset..sub_offset + dsub]);
            }

            let mut assignments = vec![0usize; rows.len()];
            for _ in 0..TRAIN_ITERATIONS {
                // Assignment step.
                for (ri, row) in rows.iter().enumerate() {
                    let subvec = &row[sub_offset..sub_offset + dsub];
                    let mut best = 0usize;
                    let mut best_dist = f32::INFINITY;
                    for j in 0..ksub {
                        let c = &centroids[Self::centroid_range(sub, j, dsub, ksub)];
                        let d = l2_squared(subvec, c);
                        if d < best_dist {
                            best_dist = d;
                            best = j;
                        }
                    }
                    assignments[ri] = best;
                }

                // Update step. Empty clusters keep their old centroid.
                let mut sums = vec![0.0f64; ksub * dsub];
                let mut counts = vec![0usize; ksub];
                for (ri, row) in rows.iter().enumerate() {
                    let j = assignments[ri];
                    counts[j] += 1;
                    let subvec = &row[sub_offset..sub_offset + dsub];
                    for (d, &v) in subvec.iter().enumerate() {
                        sums[j * dsub + d] += f64::from(v);
                    }
                }
                for j in 0..ksub {
                    if counts[j] == 0 {
                        continue;
                    }
                    let range = Self::centroid_range(sub, j, dsub, ksub);
                    for (d, slot) in centroids[range].iter_mut().enumerate() {
                        *slot = (sums[j * dsub + d] / counts[j] as f64) as f32;
                    }
                }
            }
        }

        Ok(Self {
            m,
            dsub,
            ksub,
            centroids,
        })
    }

    #[inline]
    fn centroid_range(sub: usize, j: usize, dsub: usize, ksub: usize) -> std::ops::Range<usize> {
        let start = (sub * ksub + j) * dsub;
        start..start + dsub
    }

    #[inline]
    fn centroid(&self, sub: usize, j: usize) -> &[f32] {
        &self.centroids[Self::centroid_range(sub, j, self.dsub, self.ksub)]
    }

    /// Number of sub-quantizers (= code length in bytes).
    pub fn code_len(&self) -> usize {
        self.m
    }

    /// Dimension this codebook was trained for.
    pub fn dimension(&self) -> usize {
        self.m * self.dsub
    }

    /// Centroids per subspace.
    pub fn ksub(&self) -> usize {
        self.ksub
    }

    /// Encode one row into its `m`-byte code.
    pub fn encode(&self, row: &[f32]) -> Vec<u8> {
        debug_assert_eq!(row.len(), self.dimension());
        let mut code = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let subvec = &row[sub * self.dsub..(sub + 1) * self.dsub];
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for j in 0..self.ksub {
                let d = l2_squared(subvec, self.centroid(sub, j));
                if d < best_dist {
                    best_dist = d;
                    best = j;
                }
            }
            code.push(best as u8);
        }
        code
    }

    /// Precompute the `m · ksub` table of squared distances between the
    /// query's subvectors and every centroid. One table amortizes over
    /// every candidate scored during a beam search.
    pub fn distance_table(&self, query: &[f32]) -> Vec<f32> {
        debug_assert_eq!(query.len(), self.dimension());
        let mut table = Vec::with_capacity(self.m * self.ksub);
        for sub in 0..self.m {
            let subvec = &query[sub * self.dsub..(sub + 1) * self.dsub];
            for j in 0..self.ksub {
                table.push(l2_squared(subvec, self.centroid(sub, j)));
            }
        }
        table
    }

    /// Approximate squared distance of `code` against a precomputed
    /// [`PqCodebook::distance_table`].
    #[inline]
    pub fn distance_with_table(&self, table: &[f32], code: &[u8]) -> f32 {
        debug_assert_eq!(code.len(), self.m);
        let mut sum = 0.0f32;
        for (sub, &c) in code.iter().enumerate() {
            sum += table[sub * self.ksub + c as usize];
        }
        sum
    }

    /// Approximate squared distance between two codes — the sum of
    /// centroid-to-centroid distances per subspace. Used for
    /// inter-neighbor distances during robust pruning.
    pub fn code_distance(&self, a: &[u8], b: &[u8]) -> f32 {
        debug_assert_eq!(a.len(), self.m);
        debug_assert_eq!(b.len(), self.m);
        let mut sum = 0.0f32;
        for sub in 0..self.m {
            sum += l2_squared(
                self.centroid(sub, a[sub] as usize),
                self.centroid(sub, b[sub] as usize),
            );
        }
        sum
    }
}

impl Encode for PqCodebook {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.m as u32).encode_to(buf)?;
        (self.dsub as u32).encode_to(buf)?;
        (self.ksub as u32).encode_to(buf)?;
        self.centroids.encode_to(buf)
    }
}

impl Decode for PqCodebook {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (m, mut offset) = u32::decode_from(buf)?;
        let (dsub, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (ksub, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (centroids, n) = Vec::<f32>::decode_from(&buf[offset..])?;
        offset += n;

        let (m, dsub, ksub) = (m as usize, dsub as usize, ksub as usize);
        if ksub == 0 || ksub > MAX_CENTROIDS || centroids.len() != m * ksub * dsub {
            return Err(EncodingError::Custom(format!(
                "inconsistent PQ codebook: m={m} dsub={dsub} ksub={ksub} centroids={}",
                centroids.len()
            )));
        }

        Ok((
            Self {
                m,
                dsub,
                ksub,
                centroids,
            },
            offset,
        ))
    }
}
