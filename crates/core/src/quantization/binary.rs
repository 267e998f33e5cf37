//! Binary (1-bit) quantization.
//!
//! Each dimension becomes one bit: set when the value lies above the
//! per-dimension median learned during training. Decoding maps a bit back to
//! `median ± spread`, where `spread` is the mean absolute deviation of that
//! dimension. Code-to-code distance is the Hamming distance.

use crate::distance::DistanceMetric;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryCodec {
    pub center: Vec<f32>,
    pub spread: Vec<f32>,
}

impl BinaryCodec {
    pub fn train(samples: &[f32], dim: usize) -> Self {
        let n = samples.len() / dim;
        let mut center = vec![0.0f32; dim];
        let mut spread = vec![0.0f32; dim];
        if n == 0 {
            return Self { center, spread };
        }
        let mut column = Vec::with_capacity(n);
        for d in 0..dim {
            column.clear();
            column.extend(samples.chunks_exact(dim).map(|row| row[d]));
            column.sort_unstable_by(f32::total_cmp);
            let median = column[n / 2];
            center[d] = median;
            spread[d] = column.iter().map(|v| (v - median).abs()).sum::<f32>() / n as f32;
        }
        Self { center, spread }
    }

    pub fn dimension(&self) -> usize {
        self.center.len()
    }

    pub fn code_len(&self) -> usize {
        self.center.len().div_ceil(8)
    }

    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut code = vec![0u8; self.code_len()];
        for (d, &v) in vector.iter().enumerate() {
            if v > self.center[d] {
                code[d / 8] |= 1 << (d % 8);
            }
        }
        code
    }

    #[inline]
    fn value(&self, d: usize, code: &[u8]) -> f32 {
        if code[d / 8] & (1 << (d % 8)) != 0 {
            self.center[d] + self.spread[d]
        } else {
            self.center[d] - self.spread[d]
        }
    }

    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        (0..self.dimension()).map(|d| self.value(d, code)).collect()
    }

    /// Hamming distance between two codes.
    #[inline]
    pub fn hamming(a: &[u8], b: &[u8]) -> u32 {
        a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
    }

    /// Asymmetric distance: raw query against the reconstruction of `code`.
    pub fn distance_to_query(&self, metric: DistanceMetric, query: &[f32], code: &[u8]) -> f32 {
        let (mut dot, mut nq, mut ns, mut l2) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        for (d, &q) in query.iter().enumerate() {
            let s = self.value(d, code);
            dot += q * s;
            nq += q * q;
            ns += s * s;
            l2 += (q - s) * (q - s);
        }
        metric.from_sums(dot, nq, ns, l2)
    }
}
