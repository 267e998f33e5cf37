//! Graph index front: one of the two proximity graphs behind a common API.
//!
//! Search runs the graph beam, re-ranks the shortlist with the best distance
//! the store can provide and, when the beam produced fewer hits than
//! `min(k, live)`, backfills from an exact scan of the slots it missed.

use crate::cancel::WorkBudget;
use crate::config::{GraphAlgorithm, IndexConfig};
use crate::error::Result;
use crate::filter::Filter;
use crate::flat;
use crate::hnsw::{GraphState, HnswGraph, LayerSearch};
use crate::record::{Confidence, Slot};
use crate::store::{SlotRemap, VectorStore};
use crate::vamana::VamanaGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Which structure currently answers queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    FlatBuffer,
    GraphHnsw,
    GraphDiskAnn,
}

impl IndexState {
    pub fn of(graph: Option<&GraphIndex>) -> Self {
        match graph.map(GraphIndex::algorithm) {
            None => IndexState::FlatBuffer,
            Some(GraphAlgorithm::Hnsw) => IndexState::GraphHnsw,
            Some(GraphAlgorithm::DiskAnn) => IndexState::GraphDiskAnn,
        }
    }

    pub fn graph_algorithm(&self) -> Option<GraphAlgorithm> {
        match self {
            IndexState::FlatBuffer => None,
            IndexState::GraphHnsw => Some(GraphAlgorithm::Hnsw),
            IndexState::GraphDiskAnn => Some(GraphAlgorithm::DiskAnn),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::FlatBuffer => "flat",
            IndexState::GraphHnsw => "hnsw",
            IndexState::GraphDiskAnn => "diskann",
        }
    }
}

#[derive(Debug, Clone)]
pub enum GraphIndex {
    Hnsw(HnswGraph),
    Vamana(VamanaGraph),
}

/// Per-query knobs for a graph search.
#[derive(Debug, Clone, Copy)]
pub struct GraphQuery {
    pub k: usize,
    /// Beam width override; the configured width is used when `None`.
    pub ef: Option<usize>,
    /// Shortlist multiplier applied when the store is quantized.
    pub rerank_factor: usize,
}

impl GraphIndex {
    pub fn new(algorithm: GraphAlgorithm, config: &IndexConfig) -> Self {
        match algorithm {
            GraphAlgorithm::Hnsw => GraphIndex::Hnsw(HnswGraph::new(config.hnsw.clone(), config.seed)),
            GraphAlgorithm::DiskAnn => GraphIndex::Vamana(VamanaGraph::new(config.vamana.clone())),
        }
    }

    pub fn algorithm(&self) -> GraphAlgorithm {
        match self {
            GraphIndex::Hnsw(_) => GraphAlgorithm::Hnsw,
            GraphIndex::Vamana(_) => GraphAlgorithm::DiskAnn,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            GraphIndex::Hnsw(g) => g.len(),
            GraphIndex::Vamana(g) => g.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> GraphState {
        match self {
            GraphIndex::Hnsw(g) => g.state,
            GraphIndex::Vamana(g) => g.state,
        }
    }

    pub fn insert(&mut self, store: &VectorStore, slot: Slot) {
        match self {
            GraphIndex::Hnsw(g) => g.insert(store, slot),
            GraphIndex::Vamana(g) => g.insert(store, slot),
        }
    }

    /// Admit every slot of `from..to`, checking `budget` between vectors.
    pub fn build(&mut self, store: &VectorStore, from: Slot, to: Slot, budget: &WorkBudget) -> Result<()> {
        match self {
            GraphIndex::Hnsw(g) => g.build(store, from, to, budget),
            GraphIndex::Vamana(g) => g.build(store, from, to, budget),
        }
    }

    /// Admit slots the graph has not seen yet (everything from `len()` on).
    pub fn catch_up(&mut self, store: &VectorStore) -> usize {
        let from = self.len() as Slot;
        let to = store.slot_count() as Slot;
        if to <= from {
            return 0;
        }
        for slot in from..to {
            if store.is_live(slot) {
                self.insert(store, slot);
            } else {
                self.pad_to(slot + 1);
            }
        }
        (to - from) as usize
    }

    pub(crate) fn pad_to(&mut self, slot: Slot) {
        match self {
            GraphIndex::Hnsw(g) => g.pad_to(slot),
            GraphIndex::Vamana(g) => g.pad_to(slot),
        }
    }

    pub fn remap(&mut self, store: &VectorStore, remap: &SlotRemap) {
        match self {
            GraphIndex::Hnsw(g) => g.remap(store, remap),
            GraphIndex::Vamana(g) => g.remap(store, remap),
        }
    }

    pub fn take_dirty(&mut self) -> Vec<u32> {
        match self {
            GraphIndex::Hnsw(g) => g.take_dirty(),
            GraphIndex::Vamana(g) => g.take_dirty(),
        }
    }

    pub fn dirty_count(&self) -> usize {
        match self {
            GraphIndex::Hnsw(g) => g.dirty_count(),
            GraphIndex::Vamana(g) => g.dirty_count(),
        }
    }

    /// Per-layer neighbor lists of one node (a single layer for Vamana).
    pub fn node_layers(&self, node: u32) -> Vec<Vec<u32>> {
        match self {
            GraphIndex::Hnsw(g) => g.neighbors[node as usize].clone(),
            GraphIndex::Vamana(g) => vec![g.neighbors_of(node).to_vec()],
        }
    }

    pub fn entry_point(&self) -> Option<u32> {
        match self {
            GraphIndex::Hnsw(g) => g.entry_point,
            GraphIndex::Vamana(g) => g.entry_point,
        }
    }

    pub fn max_layer(&self) -> usize {
        match self {
            GraphIndex::Hnsw(g) => g.max_layer,
            GraphIndex::Vamana(_) => 0,
        }
    }

    /// Overwrite one node's adjacency (segment replay).
    pub fn set_node(&mut self, node: u32, mut layers: Vec<Vec<u32>>) {
        match self {
            GraphIndex::Hnsw(g) => g.set_node(node, layers),
            GraphIndex::Vamana(g) => {
                let list = if layers.is_empty() { Vec::new() } else { layers.swap_remove(0) };
                g.set_node(node, list);
            }
        }
    }

    pub fn set_entry(&mut self, entry_point: Option<u32>, max_layer: usize) {
        match self {
            GraphIndex::Hnsw(g) => g.set_entry(entry_point, max_layer),
            GraphIndex::Vamana(g) => g.set_entry(entry_point),
        }
    }

    pub fn memory_usage(&self) -> usize {
        match self {
            GraphIndex::Hnsw(g) => g.memory_usage(),
            GraphIndex::Vamana(g) => g.memory_usage(),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            GraphIndex::Hnsw(g) => g.validate(),
            GraphIndex::Vamana(g) => g.validate(),
        }
    }

    fn default_beam(&self) -> usize {
        match self {
            GraphIndex::Hnsw(g) => g.params.ef_search,
            GraphIndex::Vamana(g) => g.params.l_search,
        }
    }

    /// Top `k` live slots (best available distance, ascending) and how far
    /// the result can be trusted.
    pub fn search(
        &self,
        store: &VectorStore,
        query: &[f32],
        params: GraphQuery,
        filter: Option<&Filter>,
    ) -> (Vec<(Slot, f32)>, Confidence) {
        let k = params.k;
        let expected = k.min(store.live_count());
        if expected == 0 {
            return (Vec::new(), Confidence::Exact);
        }
        let prepared = store.prepare(query);
        let mut beam = params.ef.unwrap_or_else(|| self.default_beam()).max(k);
        if store.quantizer().is_some() {
            beam = beam.max(k * params.rerank_factor.max(1));
        }
        let accept = |slot: Slot| filter.map_or(true, |f| f.matches(&store.entry(slot).metadata));

        let found: LayerSearch = match self {
            GraphIndex::Hnsw(g) => g.search(store, &prepared, beam, &accept),
            GraphIndex::Vamana(g) => g.search(store, &prepared, beam, &accept),
        };
        let mut hits: Vec<(Slot, f32)> = found
            .results
            .iter()
            .map(|&(_, slot)| (slot, store.refine_distance(&prepared, slot)))
            .collect();
        hits.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits.truncate(k);

        // A beam that ran dry short of every reachable candidate missed part
        // of the graph even when it returned k hits.
        let mut confidence = Confidence::Approximate;
        if !found.saturated {
            let candidates = match filter {
                Some(f) => store.iter_live().filter(|(_, e)| f.matches(&e.metadata)).count(),
                None => store.live_count(),
            };
            if found.results.len() < beam.min(candidates) {
                confidence = Confidence::Low;
            }
        }
        if hits.len() < expected {
            let have: HashSet<Slot> = hits.iter().map(|h| h.0).collect();
            let extra = flat::scan(store, &prepared, expected - hits.len(), |slot, e| {
                !have.contains(&slot) && filter.map_or(true, |f| f.matches(&e.metadata))
            });
            if !extra.is_empty() {
                tracing::debug!(
                    beam_hits = hits.len(),
                    backfilled = extra.len(),
                    "graph search backfilled from scan"
                );
                confidence = Confidence::Low;
                hits.extend(extra);
                hits.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            }
        }
        (hits, confidence)
    }
}
