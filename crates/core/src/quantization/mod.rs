//! Vector compression codecs.
//!
//! Three codecs share one contract: `encode`, `decode`, `distance_approx`
//! between two codes and `distance_to_query` from a raw query to a code.
//! Query distances are reported in the units of the index metric, so stored
//! vectors that are still raw and vectors that are already encoded can be
//! ranked together.

pub mod binary;
pub mod calibrate;
pub mod pq;
pub mod scalar;

pub use binary::BinaryCodec;
pub use calibrate::{calibrate, CalibrationReport};
pub use pq::{PqCodebook, PqDistanceTable};
pub use scalar::ScalarCodec;

use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};

/// Which codec to train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantizationKind {
    /// int8 per dimension, ~4× smaller.
    Scalar,
    /// One bit per dimension, ~32× smaller.
    Binary,
    /// `subspaces` one-byte codes; `subspaces` must divide the dimension.
    Product { subspaces: usize },
}

impl QuantizationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizationKind::Scalar => "scalar",
            QuantizationKind::Binary => "binary",
            QuantizationKind::Product { .. } => "product",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Codec {
    Scalar(ScalarCodec),
    Binary(BinaryCodec),
    Product(PqCodebook),
}

/// A trained codec bound to the metric of its index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quantizer {
    metric: DistanceMetric,
    dimension: usize,
    codec: Codec,
}

/// Per-query state for asymmetric distances.
pub enum PreparedQuery<'q> {
    Raw(&'q [f32]),
    Product(&'q [f32], PqDistanceTable),
}

impl<'q> PreparedQuery<'q> {
    pub fn raw(&self) -> &'q [f32] {
        match self {
            PreparedQuery::Raw(q) | PreparedQuery::Product(q, _) => *q,
        }
    }
}

impl Quantizer {
    /// Train a codec on a contiguous arena of `dim`-wide rows.
    pub fn train(
        kind: QuantizationKind,
        metric: DistanceMetric,
        samples: &[f32],
        dim: usize,
        seed: u64,
    ) -> Result<Self> {
        if dim == 0 || samples.len() < dim {
            return Err(IndexError::InvalidConfig(
                "quantization needs at least one stored vector to train on".into(),
            ));
        }
        let codec = match kind {
            QuantizationKind::Scalar => Codec::Scalar(ScalarCodec::train(samples, dim)),
            QuantizationKind::Binary => Codec::Binary(BinaryCodec::train(samples, dim)),
            QuantizationKind::Product { subspaces } => {
                if subspaces == 0 || dim % subspaces != 0 {
                    return Err(IndexError::InvalidConfig(format!(
                        "product quantization needs a subspace count dividing {dim}, got {subspaces}"
                    )));
                }
                Codec::Product(PqCodebook::train(samples, dim, subspaces, seed))
            }
        };
        Ok(Self {
            metric,
            dimension: dim,
            codec,
        })
    }

    pub fn kind(&self) -> QuantizationKind {
        match &self.codec {
            Codec::Scalar(_) => QuantizationKind::Scalar,
            Codec::Binary(_) => QuantizationKind::Binary,
            Codec::Product(cb) => QuantizationKind::Product {
                subspaces: cb.num_subspaces,
            },
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        match &self.codec {
            Codec::Scalar(c) => c.encode(vector),
            Codec::Binary(c) => c.encode(vector),
            Codec::Product(c) => c.encode(vector),
        }
    }

    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        match &self.codec {
            Codec::Scalar(c) => c.decode(code),
            Codec::Binary(c) => c.decode(code),
            Codec::Product(c) => c.decode(code),
        }
    }

    /// Code-to-code surrogate distance. Binary codes use the Hamming distance.
    pub fn distance_approx(&self, a: &[u8], b: &[u8]) -> f32 {
        match &self.codec {
            Codec::Scalar(c) => c.distance_approx(self.metric, a, b),
            Codec::Binary(_) => BinaryCodec::hamming(a, b) as f32,
            Codec::Product(c) => c.distance_approx(self.metric, a, b),
        }
    }

    pub fn prepare<'q>(&self, query: &'q [f32]) -> PreparedQuery<'q> {
        match &self.codec {
            Codec::Product(c) => {
                PreparedQuery::Product(query, c.build_distance_table(query, self.metric))
            }
            _ => PreparedQuery::Raw(query),
        }
    }

    /// Asymmetric distance from a prepared query to a stored code.
    pub fn distance_to_query(&self, query: &PreparedQuery<'_>, code: &[u8]) -> f32 {
        match (&self.codec, query) {
            (Codec::Scalar(c), q) => c.distance_to_query(self.metric, q.raw(), code),
            (Codec::Binary(c), q) => c.distance_to_query(self.metric, q.raw(), code),
            (Codec::Product(c), PreparedQuery::Product(_, table)) => table.distance(c, code),
            (Codec::Product(c), PreparedQuery::Raw(q)) => self.metric.distance(q, &c.decode(code)),
        }
    }

    /// Bytes per encoded vector.
    pub fn code_len(&self) -> usize {
        match &self.codec {
            Codec::Scalar(c) => c.dimension(),
            Codec::Binary(c) => c.code_len(),
            Codec::Product(c) => c.num_subspaces,
        }
    }

    /// Raw f32 bytes divided by code bytes.
    pub fn compression_ratio(&self) -> f32 {
        (self.dimension * std::mem::size_of::<f32>()) as f32 / self.code_len().max(1) as f32
    }

    /// Heap bytes held by the codec parameters.
    pub fn memory_usage(&self) -> usize {
        let floats = match &self.codec {
            Codec::Scalar(c) => c.min.capacity() + c.scale.capacity(),
            Codec::Binary(c) => c.center.capacity() + c.spread.capacity(),
            Codec::Product(c) => c.centroids.capacity() + c.centroid_norms.capacity(),
        };
        floats * std::mem::size_of::<f32>()
    }
}
