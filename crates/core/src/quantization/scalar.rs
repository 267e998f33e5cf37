//! Scalar int8 quantization.
//!
//! Each dimension is mapped affinely onto \[0, 255\] using the per-dimension
//! minimum and maximum observed during training. Values outside the trained
//! range are clamped. Distance functions stream over the code and decode on
//! the fly, so no temporary `Vec<f32>` is allocated per evaluation.

use crate::distance::DistanceMetric;
use serde::{Deserialize, Serialize};

/// Inner-loop width: f32 partial sums flushed to f64 every `CHUNK` elements.
const CHUNK: usize = 16;

/// Per-dimension affine codec: `value = min[d] + code[d] * scale[d]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarCodec {
    pub min: Vec<f32>,
    /// `(max - min) / 255`, zero for constant dimensions.
    pub scale: Vec<f32>,
}

impl ScalarCodec {
    /// Learn per-dimension ranges from a contiguous arena of `dim`-wide rows.
    pub fn train(samples: &[f32], dim: usize) -> Self {
        let mut min = vec![f32::MAX; dim];
        let mut max = vec![f32::MIN; dim];
        for row in samples.chunks_exact(dim) {
            for (d, &v) in row.iter().enumerate() {
                if v < min[d] {
                    min[d] = v;
                }
                if v > max[d] {
                    max[d] = v;
                }
            }
        }
        let scale = min
            .iter()
            .zip(&max)
            .map(|(&lo, &hi)| {
                let range = hi - lo;
                if range < f32::EPSILON {
                    0.0
                } else {
                    range / 255.0
                }
            })
            .collect();
        Self { min, scale }
    }

    pub fn dimension(&self) -> usize {
        self.min.len()
    }

    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        vector
            .iter()
            .enumerate()
            .map(|(d, &v)| {
                let s = self.scale[d];
                if s == 0.0 {
                    0
                } else {
                    ((v - self.min[d]) / s).round().clamp(0.0, 255.0) as u8
                }
            })
            .collect()
    }

    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        code.iter()
            .enumerate()
            .map(|(d, &c)| self.value(d, c))
            .collect()
    }

    #[inline]
    fn value(&self, d: usize, c: u8) -> f32 {
        self.min[d] + c as f32 * self.scale[d]
    }

    /// Asymmetric distance: raw f32 query against a stored code.
    pub fn distance_to_query(&self, metric: DistanceMetric, query: &[f32], code: &[u8]) -> f32 {
        debug_assert_eq!(query.len(), code.len());
        let len = code.len();
        let (mut dot, mut nq, mut ns, mut l2) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        let full_chunks = len / CHUNK;
        for c in 0..full_chunks {
            let base = c * CHUNK;
            let (mut cd, mut cq, mut cs, mut cl) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
            for j in 0..CHUNK {
                let q = query[base + j];
                let s = self.value(base + j, code[base + j]);
                cd += q * s;
                cq += q * q;
                cs += s * s;
                let diff = q - s;
                cl += diff * diff;
            }
            dot += cd as f64;
            nq += cq as f64;
            ns += cs as f64;
            l2 += cl as f64;
        }
        for i in full_chunks * CHUNK..len {
            let q = query[i] as f64;
            let s = self.value(i, code[i]) as f64;
            dot += q * s;
            nq += q * q;
            ns += s * s;
            l2 += (q - s) * (q - s);
        }
        metric.from_sums(dot as f32, nq as f32, ns as f32, l2 as f32)
    }

    /// Symmetric distance between two codes.
    pub fn distance_approx(&self, metric: DistanceMetric, a: &[u8], b: &[u8]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        let (mut dot, mut na, mut nb, mut l2) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for d in 0..a.len() {
            let x = self.value(d, a[d]) as f64;
            let y = self.value(d, b[d]) as f64;
            dot += x * y;
            na += x * x;
            nb += y * y;
            l2 += (x - y) * (x - y);
        }
        metric.from_sums(dot as f32, na as f32, nb as f32, l2 as f32)
    }

    /// Largest per-component reconstruction error for in-range values.
    pub fn max_error(&self) -> f32 {
        self.scale.iter().fold(0.0f32, |acc, &s| acc.max(s * 0.5))
    }
}
