//! Applying a compaction remap to the HNSW graph.
//!
//! Surviving nodes are renumbered. An edge to a dropped node is replaced by
//! that node's own (surviving) neighbors on the same layer, and any list that
//! grows past its bound is re-pruned with the selection heuristic.

use crate::hnsw::graph::{GraphState, HnswGraph};
use crate::hnsw::insert::select_neighbors_heuristic;
use crate::quantization::PreparedQuery;
use crate::store::{SlotRemap, VectorStore};
use std::collections::BTreeSet;

impl HnswGraph {
    /// Renumber the graph after [`VectorStore::compact`]. `store` is the
    /// already-compacted store.
    pub fn remap(&mut self, store: &VectorStore, remap: &SlotRemap) {
        if remap.is_identity() && remap.old_len() == self.len() {
            return;
        }
        let old = std::mem::take(&mut self.neighbors);
        let old_levels = std::mem::take(&mut self.levels);
        let new_len = remap.new_len();
        let mut neighbors: Vec<Vec<Vec<u32>>> = vec![Vec::new(); new_len];
        let mut levels = vec![0u8; new_len];

        for (old_id, layers) in old.iter().enumerate() {
            let Some(new_id) = remap.get(old_id as u32) else {
                continue;
            };
            levels[new_id as usize] = old_levels[old_id];
            let mut new_layers = Vec::with_capacity(layers.len());
            for (layer, list) in layers.iter().enumerate() {
                let mut kept: BTreeSet<u32> = BTreeSet::new();
                let mut repaired = false;
                for &nb in list {
                    match remap.get(nb) {
                        Some(x) => {
                            kept.insert(x);
                        }
                        None => {
                            repaired = true;
                            // Re-link through the dropped node's neighbors.
                            let via = old.get(nb as usize).and_then(|l| l.get(layer));
                            for &second in via.into_iter().flatten() {
                                if let Some(x) = remap.get(second) {
                                    kept.insert(x);
                                }
                            }
                        }
                    }
                }
                kept.remove(&new_id);
                let mut list: Vec<u32> = kept.into_iter().collect();
                let bound = self.max_degree(layer);
                if repaired && list.len() > bound {
                    let base = store.vector(new_id);
                    let bq = PreparedQuery::Raw(&base);
                    let candidates: Vec<(f32, u32)> = list
                        .iter()
                        .map(|&c| (store.distance(&bq, c), c))
                        .collect();
                    list = select_neighbors_heuristic(store, &candidates, bound)
                        .into_iter()
                        .map(|(_, id)| id)
                        .collect();
                }
                new_layers.push(list);
            }
            if new_layers.is_empty() {
                new_layers.push(Vec::new());
            }
            neighbors[new_id as usize] = new_layers;
        }
        for node in neighbors.iter_mut().filter(|n| n.is_empty()) {
            node.push(Vec::new());
        }

        self.neighbors = neighbors;
        self.levels = levels;
        self.take_dirty();

        let surviving_entry = self.entry_point.and_then(|ep| remap.get(ep));
        let (entry, max_layer) = match surviving_entry {
            Some(ep) => (Some(ep), self.levels[ep as usize] as usize),
            None => self
                .levels
                .iter()
                .enumerate()
                .filter(|&(id, _)| store.is_live(id as u32))
                .max_by_key(|&(id, &l)| (l, std::cmp::Reverse(id)))
                .map_or((None, 0), |(id, &l)| (Some(id as u32), l as usize)),
        };
        self.entry_point = entry;
        self.max_layer = max_layer;
        self.state = if entry.is_some() {
            GraphState::Searchable
        } else {
            GraphState::Empty
        };
    }
}
