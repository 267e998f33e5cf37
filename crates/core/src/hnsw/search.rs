//! HNSW search: single-layer beam search and multi-layer KNN.
//!
//! `accept` is applied during traversal: rejected nodes (tombstoned or
//! filtered out) are still expanded for navigation but never enter the result
//! heap. The beam search is shared with the Vamana graph.

use crate::hnsw::graph::HnswGraph;
use crate::hnsw::visited::VisitedSet;
use crate::quantization::PreparedQuery;
use crate::store::VectorStore;
use ordered_float::OrderedFloat;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

thread_local! {
    /// Per-thread visited set reused across searches.
    static SEARCH_VISITED: RefCell<VisitedSet> = RefCell::new(VisitedSet::new(0));
}

/// Run `f` with this thread's visited set, grown to `capacity` nodes.
pub(crate) fn with_visited<R>(capacity: usize, f: impl FnOnce(&mut VisitedSet) -> R) -> R {
    SEARCH_VISITED.with(|cell| {
        let mut visited = cell.borrow_mut();
        visited.ensure_capacity(capacity);
        f(&mut visited)
    })
}

/// Output of one beam search, ascending by distance.
#[derive(Debug, Clone, Default)]
pub struct LayerSearch {
    pub results: Vec<(f32, u32)>,
    /// The result heap reached `ef` entries before the beam ran dry.
    pub saturated: bool,
}

/// Beam search over one layer.
///
/// Returns up to `ef` accepted nodes closest to the query. With `patience > 0`
/// the search stops after that many consecutive expansions that admitted no
/// new result.
pub fn search_layer<'g, N, D, A>(
    entry_points: &[u32],
    ef: usize,
    visited: &mut VisitedSet,
    neighbors: N,
    mut distance: D,
    accept: A,
    patience: usize,
) -> LayerSearch
where
    N: Fn(u32) -> &'g [u32],
    D: FnMut(u32) -> f32,
    A: Fn(u32) -> bool,
{
    visited.clear();
    let ef = ef.max(1);
    // min-heap of candidates to expand, max-heap of current results
    let mut candidates: BinaryHeap<Reverse<(OrderedFloat<f32>, u32)>> =
        BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::with_capacity(ef + 1);
    let mut worst_dist = f32::MAX;

    for &ep in entry_points {
        if visited.insert(ep) {
            let dist = distance(ep);
            candidates.push(Reverse((OrderedFloat(dist), ep)));
            if accept(ep) {
                results.push((OrderedFloat(dist), ep));
                if results.len() > ef {
                    results.pop();
                }
                if results.len() >= ef {
                    worst_dist = results.peek().map_or(f32::MAX, |r| r.0 .0);
                }
            }
        }
    }

    let mut stale = 0usize;
    while let Some(Reverse((OrderedFloat(c_dist), node))) = candidates.pop() {
        // Closest candidate is farther than the worst result: done
        if results.len() >= ef && c_dist > worst_dist {
            break;
        }

        let mut improved = false;
        for &nb in neighbors(node) {
            if !visited.insert(nb) {
                continue;
            }
            let dist = distance(nb);
            if results.len() < ef || dist < worst_dist {
                candidates.push(Reverse((OrderedFloat(dist), nb)));
                if accept(nb) {
                    results.push((OrderedFloat(dist), nb));
                    if results.len() > ef {
                        results.pop();
                    }
                    if results.len() >= ef {
                        worst_dist = results.peek().map_or(f32::MAX, |r| r.0 .0);
                    }
                    improved = true;
                }
            }
        }

        if patience > 0 {
            stale = if improved { 0 } else { stale + 1 };
            if stale >= patience && results.len() >= ef {
                break;
            }
        }
    }

    let saturated = results.len() >= ef;
    LayerSearch {
        results: results
            .into_sorted_vec()
            .into_iter()
            .map(|(d, id)| (d.0, id))
            .collect(),
        saturated,
    }
}

impl HnswGraph {
    /// Greedy descent with beam width 1 from the global entry point down to `stop_layer + 1`.
    pub(crate) fn descend(
        &self,
        store: &VectorStore,
        query: &PreparedQuery<'_>,
        stop_layer: usize,
        visited: &mut VisitedSet,
    ) -> Option<u32> {
        let mut current = self.entry_point?;
        for layer in (stop_layer + 1..=self.max_layer).rev() {
            let found = search_layer(
                std::slice::from_ref(&current),
                1,
                visited,
                |n| self.neighbors_at(n, layer),
                |n| store.distance(query, n),
                |_| true,
                0,
            );
            if let Some(&(_, nearest)) = found.results.first() {
                current = nearest;
            }
        }
        Some(current)
    }

    /// Multi-layer KNN: descent to layer 1, then a layer-0 beam of width `ef`.
    ///
    /// Distances are navigation distances (quantized when the store is).
    pub fn search<A>(
        &self,
        store: &VectorStore,
        query: &PreparedQuery<'_>,
        ef: usize,
        accept: A,
    ) -> LayerSearch
    where
        A: Fn(u32) -> bool,
    {
        if self.entry_point.is_none() {
            return LayerSearch::default();
        }
        with_visited(self.len(), |visited| {
            let Some(ep) = self.descend(store, query, 0, visited) else {
                return LayerSearch::default();
            };
            search_layer(
                std::slice::from_ref(&ep),
                ef,
                visited,
                |n| self.neighbors_at(n, 0),
                |n| store.distance(query, n),
                |n| store.is_live(n) && accept(n),
                self.params.patience,
            )
        })
    }
}
