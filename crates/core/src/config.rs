//! Configuration for hybridann.
//!
//! Compile-time defaults live here as constants. Runtime configuration is an
//! [`IndexConfig`] value passed to [`VectorIndex::new`](crate::VectorIndex::new)
//! or [`VectorIndex::open`](crate::VectorIndex::open); it is persisted in every
//! segment header so a reopened index keeps its structural parameters.

use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of bidirectional links per HNSW node above layer 0.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 8–64.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default ef parameter during HNSW index construction.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default ef parameter during HNSW search. Always raised to at least `k`.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 64;

/// Maximum number of layers in the HNSW graph.
pub const HNSW_DEFAULT_MAX_LAYERS: usize = 16;

/// Default number of non-improving expansions before layer-0 search stops early.
/// 0 disables early termination.
pub const HNSW_DEFAULT_PATIENCE: usize = 0;

/// Default maximum out-degree of a Vamana node.
pub const VAMANA_DEFAULT_R: usize = 32;

/// Default beam width while building a Vamana graph.
pub const VAMANA_DEFAULT_L_BUILD: usize = 100;

/// Default beam width while searching a Vamana graph.
pub const VAMANA_DEFAULT_L_SEARCH: usize = 64;

/// Robust-prune distance multiplier. Values above 1.0 keep long-range edges.
pub const VAMANA_DEFAULT_ALPHA: f32 = 1.2;

/// Number of live vectors at which the flat buffer is promoted to a graph.
pub const DEFAULT_MIGRATION_THRESHOLD: usize = 5_000;

/// Adds accepted while a scheduled migration runs before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_DURING_MIGRATION: usize = 50_000;

/// Default upper bound on building a graph, in milliseconds. A synchronous
/// migration holds the write lock for its whole run.
pub const DEFAULT_MIGRATION_TIMEOUT_MS: u64 = 120_000;

/// Live segments allowed before a checkpoint merges them into one.
pub const DEFAULT_MAX_SEGMENTS: usize = 4;

/// Maximum allowed vector dimension.
pub const MAX_DIMENSION: usize = 65_536;

/// Maximum number of results (`k`) per search.
pub const MAX_K: usize = 10_000;

/// Maximum length of a vector id in bytes.
pub const MAX_ID_LEN: usize = 1_024;

/// Live vectors below which the flat scan stays single-threaded.
pub const FLAT_PARALLEL_MIN: usize = 4_096;

/// Allowed recall@10 loss, in percentage points, when enabling quantization.
pub const QUANTIZATION_DEFAULT_TOLERANCE_POINTS: f32 = 5.0;

/// Number of queries drawn from the index during quantization calibration.
pub const CALIBRATION_DEFAULT_QUERIES: usize = 64;

/// Below this many live vectors a calibration report is flagged as `insufficient_sample`.
pub const CALIBRATION_MIN_SAMPLE: usize = 256;

/// Upper bound on vectors used to train a codec.
pub const CALIBRATION_MAX_TRAINING: usize = 20_000;

/// The `k` used when measuring recall during calibration.
pub const CALIBRATION_RECALL_K: usize = 10;

/// Shortlist multiplier: quantized search keeps `k * factor` candidates before refinement.
pub const DEFAULT_RERANK_FACTOR: usize = 4;

/// Centroids per product-quantization subspace (one byte per code).
pub const PQ_NUM_CENTROIDS: usize = 256;

/// Number of k-means iterations for product-quantization training.
pub const PQ_KMEANS_ITERATIONS: usize = 12;

/// Default seed for level assignment and codec training.
pub const DEFAULT_SEED: u64 = 0x5eed_a11c_e5ee_d5ed;

/// Which search structure an index uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// Start as a flat buffer and migrate to `target` at the threshold.
    Auto,
    /// Exact scan only. Never migrates.
    Flat,
    /// Forced HNSW from the first insert; migration is skipped.
    Hnsw,
    /// Forced Vamana (DiskANN) graph from the first insert; migration is skipped.
    DiskAnn,
}

/// Graph structure a migration produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphAlgorithm {
    Hnsw,
    DiskAnn,
}

/// Construction and search parameters for the HNSW graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HnswParams {
    /// Links per node above layer 0.
    pub m: usize,
    /// Links per node at layer 0 (typically `2 * m`).
    pub m0: usize,
    /// Candidate list size during construction.
    pub ef_construction: usize,
    /// Candidate list size during search.
    pub ef_search: usize,
    /// Maximum number of layers.
    pub max_layers: usize,
    /// Stop layer-0 search after this many expansions without improvement (0 = off).
    pub patience: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: HNSW_DEFAULT_M,
            m0: HNSW_DEFAULT_M * 2,
            ef_construction: HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: HNSW_DEFAULT_EF_SEARCH,
            max_layers: HNSW_DEFAULT_MAX_LAYERS,
            patience: HNSW_DEFAULT_PATIENCE,
        }
    }
}

/// Construction and search parameters for the Vamana graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VamanaParams {
    pub max_degree: usize,
    pub l_build: usize,
    pub l_search: usize,
    pub alpha: f32,
}

impl Default for VamanaParams {
    fn default() -> Self {
        Self {
            max_degree: VAMANA_DEFAULT_R,
            l_build: VAMANA_DEFAULT_L_BUILD,
            l_search: VAMANA_DEFAULT_L_SEARCH,
            alpha: VAMANA_DEFAULT_ALPHA,
        }
    }
}

/// How quantization is calibrated and applied once enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuantizationSettings {
    /// Maximum recall@10 loss in percentage points before a codec is refused.
    pub tolerance_points: f32,
    /// Queries drawn from the index during calibration.
    pub calibration_queries: usize,
    /// Shortlist multiplier used for refinement.
    pub rerank_factor: usize,
    /// Keep the raw f32 vector next to its code (exact refinement and `get`).
    pub retain_raw: bool,
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            tolerance_points: QUANTIZATION_DEFAULT_TOLERANCE_POINTS,
            calibration_queries: CALIBRATION_DEFAULT_QUERIES,
            rerank_factor: DEFAULT_RERANK_FACTOR,
            retain_raw: false,
        }
    }
}

/// Runtime configuration of a [`VectorIndex`](crate::VectorIndex).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexConfig {
    /// Fixed dimension. `None` lets the first insert decide.
    pub dimension: Option<usize>,
    pub metric: DistanceMetric,
    pub algorithm: Algorithm,
    /// Graph produced when an `Auto` index migrates.
    pub target: GraphAlgorithm,
    pub migration_threshold: usize,
    pub hnsw: HnswParams,
    pub vamana: VamanaParams,
    pub quantization: QuantizationSettings,
    /// Hard cap on live vectors. Adds beyond it fail with `CapacityExceeded`.
    pub max_vectors: Option<usize>,
    pub max_pending_during_migration: usize,
    /// Upper bound on building a graph, in milliseconds. `None` removes the
    /// bound; the build can then only be stopped through a [`CancelToken`](crate::CancelToken).
    pub migration_timeout_ms: Option<u64>,
    /// Upper bound on checkpoint I/O, in milliseconds.
    pub checkpoint_timeout_ms: Option<u64>,
    pub max_segments: usize,
    /// Log every mutation to the write-ahead log of a persistent index.
    pub wal: bool,
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: None,
            metric: DistanceMetric::Cosine,
            algorithm: Algorithm::Auto,
            target: GraphAlgorithm::Hnsw,
            migration_threshold: DEFAULT_MIGRATION_THRESHOLD,
            hnsw: HnswParams::default(),
            vamana: VamanaParams::default(),
            quantization: QuantizationSettings::default(),
            max_vectors: None,
            max_pending_during_migration: DEFAULT_MAX_PENDING_DURING_MIGRATION,
            migration_timeout_ms: Some(DEFAULT_MIGRATION_TIMEOUT_MS),
            checkpoint_timeout_ms: None,
            max_segments: DEFAULT_MAX_SEGMENTS,
            wal: true,
            seed: DEFAULT_SEED,
        }
    }
}

impl IndexConfig {
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_target(mut self, target: GraphAlgorithm) -> Self {
        self.target = target;
        self
    }

    pub fn with_migration_threshold(mut self, threshold: usize) -> Self {
        self.migration_threshold = threshold;
        self
    }

    pub fn with_hnsw(mut self, hnsw: HnswParams) -> Self {
        self.hnsw = hnsw;
        self
    }

    pub fn with_vamana(mut self, vamana: VamanaParams) -> Self {
        self.vamana = vamana;
        self
    }

    pub fn with_quantization(mut self, settings: QuantizationSettings) -> Self {
        self.quantization = settings;
        self
    }

    pub fn with_max_vectors(mut self, max: usize) -> Self {
        self.max_vectors = Some(max);
        self
    }

    pub fn with_migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_checkpoint_timeout(mut self, timeout: Duration) -> Self {
        self.checkpoint_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_segments(mut self, max: usize) -> Self {
        self.max_segments = max;
        self
    }

    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn migration_timeout(&self) -> Option<Duration> {
        self.migration_timeout_ms.map(Duration::from_millis)
    }

    pub fn checkpoint_timeout(&self) -> Option<Duration> {
        self.checkpoint_timeout_ms.map(Duration::from_millis)
    }

    /// Reject parameter combinations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if let Some(dim) = self.dimension {
            if dim == 0 || dim > MAX_DIMENSION {
                return Err(IndexError::InvalidConfig(format!(
                    "dimension must be in 1..={MAX_DIMENSION}, got {dim}"
                )));
            }
        }
        let h = &self.hnsw;
        if h.m < 2 {
            return Err(IndexError::InvalidConfig(format!(
                "hnsw.m must be at least 2, got {}",
                h.m
            )));
        }
        if h.m0 < h.m {
            return Err(IndexError::InvalidConfig(format!(
                "hnsw.m0 ({}) must be >= hnsw.m ({})",
                h.m0, h.m
            )));
        }
        if h.ef_construction < h.m {
            return Err(IndexError::InvalidConfig(format!(
                "hnsw.ef_construction ({}) must be >= hnsw.m ({})",
                h.ef_construction, h.m
            )));
        }
        if h.ef_search == 0 || h.max_layers == 0 || h.max_layers > u8::MAX as usize {
            return Err(IndexError::InvalidConfig(
                "hnsw.ef_search must be positive and hnsw.max_layers in 1..=255".into(),
            ));
        }
        let v = &self.vamana;
        if v.max_degree < 2 || v.l_build < v.max_degree || v.l_search == 0 {
            return Err(IndexError::InvalidConfig(format!(
                "vamana needs max_degree >= 2 and l_build >= max_degree (got R={}, L={})",
                v.max_degree, v.l_build
            )));
        }
        if !(v.alpha >= 1.0 && v.alpha.is_finite()) {
            return Err(IndexError::InvalidConfig(format!(
                "vamana.alpha must be a finite value >= 1.0, got {}",
                v.alpha
            )));
        }
        let q = &self.quantization;
        if !(0.0..=100.0).contains(&q.tolerance_points) || q.rerank_factor == 0 {
            return Err(IndexError::InvalidConfig(
                "quantization.tolerance_points must be in 0..=100 and rerank_factor positive"
                    .into(),
            ));
        }
        if self.max_segments == 0 {
            return Err(IndexError::InvalidConfig("max_segments must be positive".into()));
        }
        if self.migration_threshold == 0 && self.algorithm == Algorithm::Auto {
            return Err(IndexError::InvalidConfig(
                "migration_threshold must be positive for the auto algorithm".into(),
            ));
        }
        Ok(())
    }
}
