//! Product Quantization (PQ) for fast approximate distance computation.
//!
//! Splits vectors into M subspaces and learns up to 256 centroids per
//! subspace via k-means. Each vector is encoded as M bytes (one centroid id
//! per subspace). Query distances use a precomputed lookup table: M table
//! lookups + M additions instead of D multiply-adds.

use crate::config;
use crate::distance::{self, DistanceMetric};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// PQ codebook: M subspaces × K centroids × sub_dim floats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqCodebook {
    pub num_subspaces: usize,
    /// Centroids per subspace: 256, or fewer when trained on fewer points.
    pub num_centroids: usize,
    pub sub_dim: usize,
    /// Flat centroid array: centroids[m * K * sub_dim + k * sub_dim .. + sub_dim]
    pub centroids: Vec<f32>,
    /// Squared norm of every centroid, laid out like the distance table.
    pub centroid_norms: Vec<f32>,
}

/// Precomputed per-query table: [M][K] partial values.
///
/// For L2 the partials are squared distances; for dot and cosine they are
/// dot products (cosine also needs the query norm and the centroid norms).
#[derive(Debug, Clone)]
pub struct PqDistanceTable {
    pub table: Vec<f32>,
    pub num_subspaces: usize,
    pub num_centroids: usize,
    pub query_norm_sq: f32,
    pub metric: DistanceMetric,
}

impl PqCodebook {
    /// Train a PQ codebook on a contiguous arena of `dim`-wide vectors.
    ///
    /// Callers guarantee `dim % m == 0` and a non-empty arena.
    pub fn train(vectors: &[f32], dim: usize, m: usize, seed: u64) -> Self {
        debug_assert!(m > 0 && dim % m == 0);
        let sub_dim = dim / m;
        let n = vectors.len() / dim;
        let k = config::PQ_NUM_CENTROIDS.min(n.max(1));

        let subspaces: Vec<Vec<f32>> = (0..m)
            .into_par_iter()
            .map(|sub| {
                let mut sub_vectors = vec![0.0f32; n * sub_dim];
                for i in 0..n {
                    let src_start = i * dim + sub * sub_dim;
                    sub_vectors[i * sub_dim..(i + 1) * sub_dim]
                        .copy_from_slice(&vectors[src_start..src_start + sub_dim]);
                }
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(sub as u64));
                kmeans(&sub_vectors, sub_dim, k, &mut rng)
            })
            .collect();

        let centroids: Vec<f32> = subspaces.into_iter().flatten().collect();
        let centroid_norms = centroids
            .chunks_exact(sub_dim)
            .map(distance::norm_squared)
            .collect();

        Self {
            num_subspaces: m,
            num_centroids: k,
            sub_dim,
            centroids,
            centroid_norms,
        }
    }

    #[inline]
    fn centroid(&self, subspace: usize, ci: usize) -> &[f32] {
        let start = (subspace * self.num_centroids + ci) * self.sub_dim;
        &self.centroids[start..start + self.sub_dim]
    }

    /// Encode a single vector into M PQ codes.
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        (0..self.num_subspaces)
            .map(|sub| {
                let sub_vec = &vector[sub * self.sub_dim..(sub + 1) * self.sub_dim];
                self.find_nearest_centroid(sub, sub_vec)
            })
            .collect()
    }

    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.num_subspaces * self.sub_dim);
        for (sub, &c) in codes.iter().enumerate() {
            out.extend_from_slice(self.centroid(sub, c as usize));
        }
        out
    }

    /// Build the lookup table for one query.
    pub fn build_distance_table(&self, query: &[f32], metric: DistanceMetric) -> PqDistanceTable {
        let k = self.num_centroids;
        let mut table = vec![0.0f32; self.num_subspaces * k];

        for sub in 0..self.num_subspaces {
            let q_sub = &query[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            for ci in 0..k {
                let centroid = self.centroid(sub, ci);
                table[sub * k + ci] = match metric {
                    DistanceMetric::L2 => distance::l2_squared(q_sub, centroid),
                    DistanceMetric::Dot | DistanceMetric::Cosine => distance::dot(q_sub, centroid),
                };
            }
        }

        PqDistanceTable {
            table,
            num_subspaces: self.num_subspaces,
            num_centroids: k,
            query_norm_sq: distance::norm_squared(query),
            metric,
        }
    }

    /// Symmetric distance between two codes (centroid against centroid).
    pub fn distance_approx(&self, metric: DistanceMetric, a: &[u8], b: &[u8]) -> f32 {
        let (mut dot, mut na, mut nb, mut l2) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        for sub in 0..self.num_subspaces {
            let ca = self.centroid(sub, a[sub] as usize);
            let cb = self.centroid(sub, b[sub] as usize);
            dot += distance::dot(ca, cb);
            na += self.centroid_norms[sub * self.num_centroids + a[sub] as usize];
            nb += self.centroid_norms[sub * self.num_centroids + b[sub] as usize];
            l2 += distance::l2_squared(ca, cb);
        }
        metric.from_sums(dot, na, nb, l2)
    }

    /// Find nearest centroid in a subspace. Returns centroid index (0-255).
    #[inline]
    fn find_nearest_centroid(&self, subspace: usize, sub_vec: &[f32]) -> u8 {
        let mut best_idx = 0u8;
        let mut best_dist = f32::MAX;
        for ci in 0..self.num_centroids {
            let dist = distance::l2_squared(sub_vec, self.centroid(subspace, ci));
            if dist < best_dist {
                best_dist = dist;
                best_idx = ci as u8;
            }
        }
        best_idx
    }
}

impl PqDistanceTable {
    /// Approximate distance for a PQ-encoded vector, in the metric's units.
    #[inline]
    pub fn distance(&self, codebook: &PqCodebook, codes: &[u8]) -> f32 {
        let k = self.num_centroids;
        let mut partial = 0.0f32;
        for (m, &c) in codes.iter().enumerate().take(self.num_subspaces) {
            partial += self.table[m * k + c as usize];
        }
        match self.metric {
            DistanceMetric::L2 => partial.max(0.0).sqrt(),
            DistanceMetric::Dot => -partial,
            DistanceMetric::Cosine => {
                let norm_sq: f32 = codes
                    .iter()
                    .enumerate()
                    .map(|(m, &c)| codebook.centroid_norms[m * k + c as usize])
                    .sum();
                self.metric.from_sums(partial, self.query_norm_sq, norm_sq, 0.0)
            }
        }
    }
}

/// K-means clustering with k-means++ initialization.
/// Returns k × sub_dim centroids as flat Vec<f32>.
fn kmeans(data: &[f32], sub_dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = data.len() / sub_dim;
    if n <= k {
        // Fewer points than centroids: each point is its own centroid
        let mut centroids = vec![0.0f32; k * sub_dim];
        centroids[..n * sub_dim].copy_from_slice(&data[..n * sub_dim]);
        return centroids;
    }

    let mut centroids = vec![0.0f32; k * sub_dim];
    let first = rng.gen_range(0..n);
    centroids[..sub_dim].copy_from_slice(&data[first * sub_dim..(first + 1) * sub_dim]);

    // Distance from each point to its nearest chosen centroid
    let mut min_dists = vec![f32::MAX; n];

    for ci in 1..k {
        let last_centroid = &centroids[(ci - 1) * sub_dim..ci * sub_dim];
        let mut total = 0.0f64;
        for (i, point) in data.chunks_exact(sub_dim).enumerate() {
            let d = distance::l2_squared(point, last_centroid);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }

        let chosen = if total < 1e-30 {
            // All points coincide with existing centroids
            rng.gen_range(0..n)
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids[ci * sub_dim..(ci + 1) * sub_dim]
            .copy_from_slice(&data[chosen * sub_dim..(chosen + 1) * sub_dim]);
    }

    for _ in 0..config::PQ_KMEANS_ITERATIONS {
        let assignments: Vec<usize> = data
            .par_chunks_exact(sub_dim)
            .map(|point| {
                let mut best = 0;
                let mut best_dist = f32::MAX;
                for (ci, centroid) in centroids.chunks_exact(sub_dim).enumerate() {
                    let d = distance::l2_squared(point, centroid);
                    if d < best_dist {
                        best_dist = d;
                        best = ci;
                    }
                }
                best
            })
            .collect();

        let mut counts = vec![0u32; k];
        let mut sums = vec![0.0f32; k * sub_dim];
        for (point, &ci) in data.chunks_exact(sub_dim).zip(&assignments) {
            counts[ci] += 1;
            for (acc, &v) in sums[ci * sub_dim..(ci + 1) * sub_dim].iter_mut().zip(point) {
                *acc += v;
            }
        }
        for ci in 0..k {
            // Empty clusters keep their previous centroid
            if counts[ci] > 0 {
                let inv = 1.0 / counts[ci] as f32;
                for d in 0..sub_dim {
                    centroids[ci * sub_dim + d] = sums[ci * sub_dim + d] * inv;
                }
            }
        }
    }

    centroids
}
