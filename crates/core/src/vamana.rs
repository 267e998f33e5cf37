//! Vamana (DiskANN) single-layer proximity graph.
//!
//! Each node keeps at most `R` out-edges chosen by robust pruning: a
//! candidate is dropped when some already-kept neighbor is `alpha` times
//! closer to it than the base node is. With `alpha > 1` long edges survive,
//! which keeps greedy search paths short. Search starts from the medoid.

use crate::cancel::WorkBudget;
use crate::config::VamanaParams;
use crate::error::Result;
use crate::hnsw::search::with_visited;
use crate::hnsw::{search_layer, GraphState, LayerSearch, VisitedSet};
use crate::quantization::PreparedQuery;
use crate::record::Slot;
use crate::store::{SlotRemap, VectorStore};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct VamanaGraph {
    pub params: VamanaParams,
    pub neighbors: Vec<Vec<u32>>,
    pub entry_point: Option<u32>,
    pub state: GraphState,
    dirty: BTreeSet<u32>,
    scratch: VisitedSet,
}

impl VamanaGraph {
    pub fn new(params: VamanaParams) -> Self {
        Self {
            params,
            neighbors: Vec::new(),
            entry_point: None,
            state: GraphState::Empty,
            dirty: BTreeSet::new(),
            scratch: VisitedSet::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    #[inline]
    pub fn neighbors_of(&self, node: u32) -> &[u32] {
        self.neighbors
            .get(node as usize)
            .map_or(&[], Vec::as_slice)
    }

    pub fn pad_to(&mut self, slot: Slot) {
        if self.neighbors.len() < slot as usize {
            self.neighbors.resize(slot as usize, Vec::new());
        }
    }

    pub fn take_dirty(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn set_node(&mut self, node: u32, list: Vec<u32>) {
        self.pad_to(node + 1);
        self.neighbors[node as usize] = list;
    }

    pub fn set_entry(&mut self, entry_point: Option<u32>) {
        self.entry_point = entry_point;
        self.state = if entry_point.is_some() {
            GraphState::Searchable
        } else {
            GraphState::Empty
        };
    }

    /// Insert `slot`: beam search with width `L`, robust-prune the beam to `R`,
    /// add back-edges, re-prune neighbors above `R`.
    pub fn insert(&mut self, store: &VectorStore, slot: Slot) {
        debug_assert!(slot as usize >= self.len(), "slot {slot} already in graph");
        self.pad_to(slot);
        let Some(entry) = self.entry_point else {
            self.neighbors.push(Vec::new());
            self.set_entry(Some(slot));
            self.dirty.insert(slot);
            return;
        };

        let vector = store.vector(slot).into_owned();
        let query = store.prepare(&vector);
        let mut visited = std::mem::take(&mut self.scratch);
        visited.ensure_capacity(self.len() + 1);
        let found = search_layer(
            &[entry],
            self.params.l_build,
            &mut visited,
            |n| self.neighbors_of(n),
            |n| store.distance(&query, n),
            |_| true,
            0,
        );
        self.scratch = visited;

        let out = robust_prune(store, found.results, self.params.alpha, self.params.max_degree);
        self.neighbors.push(out.clone());
        self.dirty.insert(slot);

        for nb in out {
            let list = &mut self.neighbors[nb as usize];
            if list.contains(&slot) {
                continue;
            }
            list.push(slot);
            self.dirty.insert(nb);
            if self.neighbors[nb as usize].len() > self.params.max_degree {
                let base = store.vector(nb);
                let bq = PreparedQuery::Raw(&base);
                let candidates: Vec<(f32, u32)> = self.neighbors[nb as usize]
                    .iter()
                    .map(|&c| (store.distance(&bq, c), c))
                    .collect();
                self.neighbors[nb as usize] =
                    robust_prune(store, candidates, self.params.alpha, self.params.max_degree);
            }
        }
    }

    /// Insert `from..to` in order, then move the entry point to the medoid.
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
        let medoid = medoid(store, self.len());
        self.set_entry(medoid.or(self.entry_point));
        Ok(())
    }

    pub fn search<A>(
        &self,
        store: &VectorStore,
        query: &PreparedQuery<'_>,
        beam: usize,
        accept: A,
    ) -> LayerSearch
    where
        A: Fn(u32) -> bool,
    {
        let Some(entry) = self.entry_point else {
            return LayerSearch::default();
        };
        with_visited(self.len(), |visited| {
            search_layer(
                &[entry],
                beam,
                visited,
                |n| self.neighbors_of(n),
                |n| store.distance(query, n),
                |n| store.is_live(n) && accept(n),
                0,
            )
        })
    }

    /// Renumber after compaction; edges to dropped nodes are re-linked
    /// through the dropped node's neighbors and re-pruned.
    pub fn remap(&mut self, store: &VectorStore, remap: &SlotRemap) {
        let old = std::mem::take(&mut self.neighbors);
        let mut neighbors = vec![Vec::new(); remap.new_len()];
        for (old_id, list) in old.iter().enumerate() {
            let Some(new_id) = remap.get(old_id as u32) else {
                continue;
            };
            let mut kept = BTreeSet::new();
            let mut repaired = false;
            for &nb in list {
                match remap.get(nb) {
                    Some(x) => {
                        kept.insert(x);
                    }
                    None => {
                        repaired = true;
                        for &second in old.get(nb as usize).into_iter().flatten() {
                            if let Some(x) = remap.get(second) {
                                kept.insert(x);
                            }
                        }
                    }
                }
            }
            kept.remove(&new_id);
            let mut list: Vec<u32> = kept.into_iter().collect();
            if repaired && list.len() > self.params.max_degree {
                let base = store.vector(new_id);
                let bq = PreparedQuery::Raw(&base);
                let candidates = list.iter().map(|&c| (store.distance(&bq, c), c)).collect();
                list = robust_prune(store, candidates, self.params.alpha, self.params.max_degree);
            }
            neighbors[new_id as usize] = list;
        }
        self.neighbors = neighbors;
        self.dirty.clear();
        let entry = match self.entry_point.and_then(|ep| remap.get(ep)) {
            Some(ep) => Some(ep),
            None => medoid(store, self.len()),
        };
        self.set_entry(entry);
    }

    pub fn memory_usage(&self) -> usize {
        self.neighbors.capacity() * std::mem::size_of::<Vec<u32>>()
            + self.neighbors.iter().map(|l| l.capacity() * 4).sum::<usize>()
            + self.dirty.len() * 4
            + self.scratch.memory_usage()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        let n = self.neighbors.len();
        if let Some(ep) = self.entry_point {
            if ep as usize >= n {
                return Err(format!("entry point {ep} out of bounds (node count {n})"));
            }
        }
        for (node, list) in self.neighbors.iter().enumerate() {
            if list.len() > self.params.max_degree {
                return Err(format!(
                    "node {node} has degree {} > {}",
                    list.len(),
                    self.params.max_degree
                ));
            }
            if let Some(&bad) = list.iter().find(|&&nb| nb as usize >= n) {
                return Err(format!("node {node} links to {bad} (node count {n})"));
            }
        }
        Ok(())
    }
}

/// Robust prune: keep the closest candidate, discard every candidate that
/// the kept one covers within factor `alpha`, repeat until `r` are kept.
pub(crate) fn robust_prune(
    store: &VectorStore,
    mut candidates: Vec<(f32, u32)>,
    alpha: f32,
    r: usize,
) -> Vec<u32> {
    candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    candidates.dedup_by_key(|c| c.1);
    let mut out = Vec::with_capacity(r);
    let mut pool = candidates;
    while !pool.is_empty() && out.len() < r {
        let (_, best) = pool.remove(0);
        out.push(best);
        let bv = store.vector(best);
        let bq = PreparedQuery::Raw(&bv);
        pool.retain(|&(d_base, c)| relax(store.distance(&bq, c), alpha) > d_base);
    }
    out
}

/// Moves `d` away from zero by `alpha` in the direction that loosens pruning.
/// Dot-product distances are negative, where multiplying would tighten it.
#[inline]
fn relax(d: f32, alpha: f32) -> f32 {
    if d >= 0.0 {
        d * alpha
    } else {
        d / alpha
    }
}

/// Live slot closest to the centroid of all live vectors below `len`.
fn medoid(store: &VectorStore, len: usize) -> Option<u32> {
    let dim = store.dimension()?;
    let mut centroid = vec![0.0f32; dim];
    let mut count = 0usize;
    for (slot, _) in store.iter_live().take_while(|(s, _)| (*s as usize) < len) {
        for (c, v) in centroid.iter_mut().zip(store.vector(slot).iter()) {
            *c += v;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    for c in centroid.iter_mut() {
        *c /= count as f32;
    }
    let q = PreparedQuery::Raw(&centroid);
    store
        .iter_live()
        .take_while(|(s, _)| (*s as usize) < len)
        .map(|(s, _)| (store.refine_distance(&q, s), s))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, s)| s)
}
