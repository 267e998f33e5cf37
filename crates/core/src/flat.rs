//! Exact linear scan over live vectors.
//!
//! Below [`FLAT_PARALLEL_MIN`](crate::config::FLAT_PARALLEL_MIN) live slots the
//! scan is sequential; above it each rayon worker keeps its own bounded heap
//! and the heaps are merged. Ties are broken by slot number, so both paths
//! return identical results.

use crate::config;
use crate::quantization::PreparedQuery;
use crate::record::Slot;
use crate::store::{SlotEntry, VectorStore};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use std::collections::BinaryHeap;

type Entry = (OrderedFloat<f32>, Slot);

/// Bounded max-heap keeping the `k` smallest entries.
struct TopK {
    k: usize,
    heap: BinaryHeap<Entry>,
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    #[inline]
    fn push(&mut self, entry: Entry) {
        if self.heap.len() < self.k {
            self.heap.push(entry);
        } else if let Some(top) = self.heap.peek() {
            if entry < *top {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    fn merge(mut self, other: TopK) -> TopK {
        for e in other.heap {
            self.push(e);
        }
        self
    }

    fn into_sorted(self) -> Vec<(Slot, f32)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|(d, s)| (s, d.0))
            .collect()
    }
}

/// Top `k` live slots by best available distance, ascending.
///
/// `accept` filters candidates (metadata filter, already-seen slots).
pub fn scan<F>(store: &VectorStore, query: &PreparedQuery<'_>, k: usize, accept: F) -> Vec<(Slot, f32)>
where
    F: Fn(Slot, &SlotEntry) -> bool + Sync,
{
    if k == 0 {
        return Vec::new();
    }
    let entries = store.entries();
    let score = |slot: Slot, e: &SlotEntry| -> Option<Entry> {
        (e.live && accept(slot, e)).then(|| (OrderedFloat(store.refine_distance(query, slot)), slot))
    };

    let top = if store.live_count() < config::FLAT_PARALLEL_MIN {
        let mut top = TopK::new(k);
        for (i, e) in entries.iter().enumerate() {
            if let Some(entry) = score(i as Slot, e) {
                top.push(entry);
            }
        }
        top
    } else {
        entries
            .par_iter()
            .enumerate()
            .fold(
                || TopK::new(k),
                |mut top, (i, e)| {
                    if let Some(entry) = score(i as Slot, e) {
                        top.push(entry);
                    }
                    top
                },
            )
            .reduce(|| TopK::new(k), TopK::merge)
    };
    top.into_sorted()
}
