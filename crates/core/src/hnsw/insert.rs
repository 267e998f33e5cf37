//! HNSW insertion.
//!
//! Inserts a store slot into the graph with bidirectional connections and
//! heuristic neighbor pruning (Algorithm 4 from the HNSW paper). Tombstoned
//! nodes take part in construction as navigation nodes.

use crate::cancel::WorkBudget;
use crate::error::Result;
use crate::hnsw::graph::{GraphState, HnswGraph};
use crate::hnsw::search::search_layer;
use crate::quantization::PreparedQuery;
use crate::record::Slot;
use crate::store::VectorStore;
use std::collections::HashSet;

impl HnswGraph {
    /// Insert `slot`, which must not be in the graph yet. Missing slots below it
    /// become placeholder nodes.
    pub fn insert(&mut self, store: &VectorStore, slot: Slot) {
        debug_assert!(slot as usize >= self.len(), "slot {slot} already in graph");
        self.pad_to(slot);
        let level = self.random_level();
        let vector = store.vector(slot).into_owned();
        let query = store.prepare(&vector);

        let Some(entry_point) = self.entry_point else {
            self.neighbors.push(vec![Vec::new(); level + 1]);
            self.levels.push(level as u8);
            self.entry_point = Some(slot);
            self.max_layer = level;
            self.state = GraphState::Searchable;
            self.mark_dirty(slot);
            return;
        };

        let mut visited = std::mem::take(&mut self.scratch);
        visited.ensure_capacity(self.len() + 1);

        // Phase 1: greedy descent from the top layer down to level + 1
        let current_ep = self
            .descend(store, &query, level, &mut visited)
            .unwrap_or(entry_point);

        // Phase 2: beam search each remaining layer and pick neighbors
        let top = level.min(self.max_layer);
        let mut node_neighbors: Vec<Vec<u32>> = vec![Vec::new(); level + 1];
        let mut layer_eps: Vec<u32> = vec![current_ep];
        for layer in (0..=top).rev() {
            let found = search_layer(
                &layer_eps,
                self.params.ef_construction,
                &mut visited,
                |n| self.neighbors_at(n, layer),
                |n| store.distance(&query, n),
                |_| true,
                0,
            );
            let selected = select_neighbors_heuristic(store, &found.results, self.max_degree(layer));
            node_neighbors[layer] = selected.iter().map(|&(_, id)| id).collect();

            layer_eps.clear();
            layer_eps.extend(found.results.iter().map(|&(_, id)| id));
            if layer_eps.is_empty() {
                layer_eps.push(entry_point);
            }
        }
        self.scratch = visited;

        self.neighbors.push(node_neighbors);
        self.levels.push(level as u8);
        self.mark_dirty(slot);

        // Phase 3: back-edges, re-pruning neighbors that exceed their bound
        for layer in 0..=top {
            let m_max = self.max_degree(layer);
            let mine = self.neighbors[slot as usize][layer].clone();
            for nb in mine {
                let nid = nb as usize;
                while self.neighbors[nid].len() <= layer {
                    self.neighbors[nid].push(Vec::new());
                }
                self.neighbors[nid][layer].push(slot);
                self.mark_dirty(nb);

                if self.neighbors[nid][layer].len() > m_max {
                    let base = store.vector(nb);
                    let base_query = PreparedQuery::Raw(&base);
                    let candidates: Vec<(f32, u32)> = self.neighbors[nid][layer]
                        .iter()
                        .map(|&cid| (store.distance(&base_query, cid), cid))
                        .collect();
                    let pruned = select_neighbors_heuristic(store, &candidates, m_max);
                    self.neighbors[nid][layer] = pruned.iter().map(|&(_, id)| id).collect();
                }
            }
        }

        // Phase 4: a taller node becomes the entry point
        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(slot);
        }
    }

    /// Insert every slot in `from..to` in order; tombstoned slots become
    /// placeholders. Checks `budget` between vectors.
    pub fn build(
        &mut self,
        store: &VectorStore,
        from: Slot,
        to: Slot,
        budget: &WorkBudget,
    ) -> Result<()> {
        let previous = self.state;
        self.state = GraphState::Building;
        for slot in from..to {
            if let Err(e) = budget.check() {
                self.state = previous;
                return Err(e);
            }
            if store.is_live(slot) {
                self.insert(store, slot);
            } else {
                self.pad_to(slot + 1);
            }
        }
        self.state = if self.entry_point.is_some() {
            GraphState::Searchable
        } else {
            GraphState::Empty
        };
        Ok(())
    }
}

/// Heuristic neighbor selection (Algorithm 4 from the HNSW paper).
///
/// Walks candidates from closest to farthest and keeps one only if it is
/// closer to the base node than to every neighbor kept so far. If fewer than
/// `m` survive, the closest skipped candidates fill the remaining slots.
pub(crate) fn select_neighbors_heuristic(
    store: &VectorStore,
    candidates: &[(f32, u32)],
    m: usize,
) -> Vec<(f32, u32)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    sorted.dedup_by_key(|c| c.1);

    let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
    for &(dist_to_base, cid) in &sorted {
        if selected.len() >= m {
            break;
        }
        let cv = store.vector(cid);
        let cq = PreparedQuery::Raw(&cv);
        let is_diverse = selected
            .iter()
            .all(|&(_, sid)| dist_to_base <= store.distance(&cq, sid));
        if is_diverse {
            selected.push((dist_to_base, cid));
        }
    }

    if selected.len() < m {
        let chosen: HashSet<u32> = selected.iter().map(|&(_, id)| id).collect();
        for &(dist, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            if !chosen.contains(&cid) {
                selected.push((dist, cid));
            }
        }
    }

    selected
}
