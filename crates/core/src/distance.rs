//! Distance kernel: L2, cosine and dot product over `f32` slices.
//!
//! All functions are pure: inputs are read-only and never renormalized.
//! Every metric returns a distance where **lower is closer**. Loops are
//! written over fixed-width lanes so the compiler can auto-vectorize them;
//! the batched entry points call the same per-pair kernel, so batched and
//! scalar evaluation agree bit for bit.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Accumulator lanes. Eight f32 lanes map onto one AVX register or two NEON registers.
const LANES: usize = 8;

/// Distance metric used for vector similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`. Range \[0, 2\]. Zero-norm operands have distance 1.
    Cosine,
    /// Euclidean distance `‖a - b‖`. Range \[0, ∞).
    L2,
    /// Negative dot product `-a·b`.
    Dot,
}

impl DistanceMetric {
    /// Distance between two vectors of equal length.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::L2 => l2_squared(a, b).sqrt(),
            DistanceMetric::Dot => -dot(a, b),
        }
    }

    /// Distance of `query` to every row of `rows`, evaluated in parallel.
    pub fn distance_batch(&self, query: &[f32], rows: &[&[f32]]) -> Vec<f32> {
        rows.par_iter().map(|row| self.distance(query, row)).collect()
    }

    /// Distance of `query` to every `dim`-wide row of a contiguous arena.
    pub fn distance_arena(&self, query: &[f32], arena: &[f32], dim: usize) -> Vec<f32> {
        arena
            .par_chunks_exact(dim)
            .map(|row| self.distance(query, row))
            .collect()
    }

    /// Similarity score reported to callers: higher is more similar.
    ///
    /// Cosine maps to `1 - d`, L2 to `1 / (1 + d)`, dot product to the raw dot value.
    #[inline]
    pub fn score(&self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::L2 => 1.0 / (1.0 + distance),
            DistanceMetric::Dot => -distance,
        }
    }

    /// Builds a distance from precomputed sums (used by asymmetric codecs).
    #[inline]
    pub(crate) fn from_sums(&self, dot: f32, norm_a_sq: f32, norm_b_sq: f32, l2_sq: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => cosine_from_parts(dot, norm_a_sq, norm_b_sq),
            DistanceMetric::L2 => l2_sq.max(0.0).sqrt(),
            DistanceMetric::Dot => -dot,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
            DistanceMetric::Dot => "dot",
        }
    }
}

/// Dot product.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; LANES];
    let chunks = a.len() / LANES;
    for c in 0..chunks {
        let base = c * LANES;
        for j in 0..LANES {
            acc[j] += a[base + j] * b[base + j];
        }
    }
    let mut sum: f32 = acc.iter().sum();
    for i in chunks * LANES..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Squared Euclidean distance.
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; LANES];
    let chunks = a.len() / LANES;
    for c in 0..chunks {
        let base = c * LANES;
        for j in 0..LANES {
            let d = a[base + j] - b[base + j];
            acc[j] += d * d;
        }
    }
    let mut sum: f32 = acc.iter().sum();
    for i in chunks * LANES..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// Squared L2 norm.
#[inline]
pub fn norm_squared(a: &[f32]) -> f32 {
    dot(a, a)
}

/// Cosine distance computed in a single pass over both inputs.
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut d = [0.0f32; LANES];
    let mut na = [0.0f32; LANES];
    let mut nb = [0.0f32; LANES];
    let chunks = a.len() / LANES;
    for c in 0..chunks {
        let base = c * LANES;
        for j in 0..LANES {
            let x = a[base + j];
            let y = b[base + j];
            d[j] += x * y;
            na[j] += x * x;
            nb[j] += y * y;
        }
    }
    let mut dot_sum: f32 = d.iter().sum();
    let mut na_sum: f32 = na.iter().sum();
    let mut nb_sum: f32 = nb.iter().sum();
    for i in chunks * LANES..a.len() {
        dot_sum += a[i] * b[i];
        na_sum += a[i] * a[i];
        nb_sum += b[i] * b[i];
    }
    cosine_from_parts(dot_sum, na_sum, nb_sum)
}

#[inline]
fn cosine_from_parts(dot: f32, norm_a_sq: f32, norm_b_sq: f32) -> f32 {
    if norm_a_sq <= f32::MIN_POSITIVE || norm_b_sq <= f32::MIN_POSITIVE {
        return 1.0;
    }
    let denom = (norm_a_sq as f64).sqrt() * (norm_b_sq as f64).sqrt();
    let sim = (dot as f64 / denom).clamp(-1.0, 1.0);
    (1.0 - sim) as f32
}
