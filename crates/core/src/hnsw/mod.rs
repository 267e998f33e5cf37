//! Hierarchical Navigable Small World (HNSW) graph over the vector store.
//!
//! The graph holds only topology. Node `i` is store slot `i`; vectors,
//! liveness and distances come from the [`VectorStore`](crate::store::VectorStore).
//! Slots that were already tombstoned when the graph reached them become
//! edge-less placeholder nodes so the numbering stays aligned.
//!
//! The graph uses a Struct-of-Arrays layout: one neighbor-list vector per
//! node and layer, one level byte per node.

/// HNSW graph structure and level assignment.
pub mod graph;
/// Insertion with bidirectional connections and heuristic pruning.
pub mod insert;
/// Slot remapping after compaction, with neighbor repair.
pub mod repair;
/// Single-layer beam search and multi-layer KNN.
pub mod search;
/// Generation-based visited set for graph traversal.
pub mod visited;

pub use graph::{GraphState, HnswGraph};
pub use search::{search_layer, LayerSearch};
pub use visited::VisitedSet;
