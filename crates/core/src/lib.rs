//! # hybridann-core
//!
//! Embeddable approximate nearest neighbor index. Small collections are
//! served by an exact flat scan; once a collection crosses its migration
//! threshold it is promoted to an HNSW or Vamana (DiskANN) graph. Vectors
//! can be compressed with scalar, binary or product quantization after a
//! recall calibration, and indexes persist as checksummed segments plus a
//! write-ahead log.
//!
//! The crate is synchronous; long-running work (migration, checkpoint I/O)
//! takes a [`CancelToken`] and an optional deadline.

/// Cancellation tokens and work deadlines.
pub mod cancel;
/// Configuration: limits, defaults and per-index tuning parameters.
pub mod config;
/// Distance metrics and their kernels.
pub mod distance;
/// Error type shared by every operation.
pub mod error;
/// Metadata filters applied during search.
pub mod filter;
/// Exact scan over the vector store.
pub mod flat;
/// The graph an index migrates to, behind one interface.
pub mod graph;
/// HNSW graph: layered construction, beam search and repair.
pub mod hnsw;
/// The public [`VectorIndex`] handle.
pub mod index;
/// Flat-to-graph migration, synchronous or on a background thread.
pub mod migration;
/// Segments, manifest and write-ahead log.
pub mod persistence;
/// Vector codecs and recall calibration.
pub mod quantization;
/// Records, search hits and input validation.
pub mod record;
/// Slot-addressed vector storage.
pub mod store;
/// Vamana (DiskANN) graph.
pub mod vamana;

pub use cancel::CancelToken;
pub use config::{Algorithm, GraphAlgorithm, HnswParams, IndexConfig, QuantizationSettings, VamanaParams};
pub use distance::DistanceMetric;
pub use error::{IndexError, Result};
pub use filter::{Condition, Filter};
pub use graph::IndexState;
pub use index::{BatchOutcome, IndexInfo, SearchOptions, VectorIndex};
pub use migration::{MigrationHandle, MigrationProgress, MigrationStatus};
pub use persistence::{merge_segments, CheckpointOptions, CheckpointReport, Segment, SegmentKind};
pub use quantization::{CalibrationReport, QuantizationKind};
pub use record::{Confidence, Metadata, SearchHit, SearchResponse, VectorRecord};
