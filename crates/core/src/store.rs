//! Vector store: raw or quantized vectors, metadata and the id ↔ slot map.
//!
//! Every insert appends a new slot. Re-inserting an existing id tombstones the
//! old slot first, so slot contents never change in place. Tombstoned slots
//! keep their vector until [`VectorStore::compact`] drops them, because graph
//! indexes still route through them.

use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};
use crate::quantization::{PreparedQuery, Quantizer};
use crate::record::{self, Metadata, Slot};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::mem::size_of;

/// Vector payload of one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredVector {
    Raw(Vec<f32>),
    Quantized { code: Vec<u8>, raw: Option<Vec<f32>> },
}

impl StoredVector {
    fn heap_bytes(&self) -> usize {
        match self {
            StoredVector::Raw(v) => v.capacity() * size_of::<f32>(),
            StoredVector::Quantized { code, raw } => {
                code.capacity() + raw.as_ref().map_or(0, |r| r.capacity() * size_of::<f32>())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub id: String,
    pub vector: StoredVector,
    pub metadata: Metadata,
    pub live: bool,
}

/// Old slot → new slot mapping produced by compaction.
#[derive(Debug, Clone, Default)]
pub struct SlotRemap {
    map: Vec<Option<Slot>>,
    new_len: usize,
}

impl SlotRemap {
    pub fn from_liveness(live: impl Iterator<Item = bool>) -> Self {
        let mut next = 0u32;
        let map: Vec<Option<Slot>> = live
            .map(|alive| {
                alive.then(|| {
                    let s = next;
                    next += 1;
                    s
                })
            })
            .collect();
        Self {
            map,
            new_len: next as usize,
        }
    }

    #[inline]
    pub fn get(&self, old: Slot) -> Option<Slot> {
        self.map.get(old as usize).copied().flatten()
    }

    pub fn old_len(&self) -> usize {
        self.map.len()
    }

    pub fn new_len(&self) -> usize {
        self.new_len
    }

    pub fn dropped(&self) -> usize {
        self.map.len() - self.new_len
    }

    pub fn is_identity(&self) -> bool {
        self.dropped() == 0
    }
}

#[derive(Debug, Clone)]
pub struct VectorStore {
    configured_dimension: Option<usize>,
    dimension: Option<usize>,
    metric: DistanceMetric,
    slots: Vec<SlotEntry>,
    id_to_slot: HashMap<String, Slot>,
    live: usize,
    quantizer: Option<Quantizer>,
    retain_raw: bool,
}

impl VectorStore {
    pub fn new(dimension: Option<usize>, metric: DistanceMetric) -> Self {
        Self {
            configured_dimension: dimension,
            dimension,
            metric,
            slots: Vec::new(),
            id_to_slot: HashMap::new(),
            live: 0,
            quantizer: None,
            retain_raw: false,
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn quantizer(&self) -> Option<&Quantizer> {
        self.quantizer.as_ref()
    }

    pub fn retains_raw(&self) -> bool {
        self.retain_raw
    }

    /// Validate a vector against the store without mutating it.
    pub fn check_vector(&self, vector: &[f32]) -> Result<()> {
        record::validate_vector(vector)?;
        match self.dimension {
            Some(expected) if expected != vector.len() => Err(IndexError::DimensionMismatch {
                expected,
                actual: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Insert or replace `id`. Returns the new slot and the tombstoned slot, if any.
    pub fn insert(
        &mut self,
        id: &str,
        vector: Vec<f32>,
        metadata: Metadata,
    ) -> Result<(Slot, Option<Slot>)> {
        record::validate_id(id)?;
        self.check_vector(&vector)?;
        if self.slots.len() >= Slot::MAX as usize {
            return Err(IndexError::CapacityExceeded(
                "slot space exhausted, compact the index".into(),
            ));
        }
        if self.dimension.is_none() {
            self.dimension = Some(vector.len());
        }
        let replaced = self.delete(id);
        let slot = self.slots.len() as Slot;
        let stored = self.encode(vector);
        self.slots.push(SlotEntry {
            id: id.to_owned(),
            vector: stored,
            metadata,
            live: true,
        });
        self.id_to_slot.insert(id.to_owned(), slot);
        self.live += 1;
        Ok((slot, replaced))
    }

    fn encode(&self, vector: Vec<f32>) -> StoredVector {
        match &self.quantizer {
            None => StoredVector::Raw(vector),
            Some(q) => StoredVector::Quantized {
                code: q.encode(&vector),
                raw: self.retain_raw.then_some(vector),
            },
        }
    }

    /// Tombstone `id`. Returns its slot, or `None` if unknown.
    pub fn delete(&mut self, id: &str) -> Option<Slot> {
        let slot = self.id_to_slot.remove(id)?;
        let entry = &mut self.slots[slot as usize];
        entry.live = false;
        entry.metadata = Metadata::new();
        self.live -= 1;
        Some(slot)
    }

    /// Tombstone a slot directly (segment replay).
    pub fn tombstone(&mut self, slot: Slot) -> bool {
        match self.slots.get(slot as usize) {
            Some(entry) if entry.live => {
                let id = entry.id.clone();
                self.delete(&id).is_some()
            }
            _ => false,
        }
    }

    /// Append a slot restored from disk, keeping its liveness.
    pub fn push_entry(&mut self, entry: SlotEntry) -> Result<Slot> {
        if let Some(dim) = self.dimension {
            let len = match &entry.vector {
                StoredVector::Raw(v) => v.len(),
                StoredVector::Quantized { raw: Some(r), .. } => r.len(),
                StoredVector::Quantized { .. } => dim,
            };
            if len != dim {
                return Err(IndexError::DimensionMismatch {
                    expected: dim,
                    actual: len,
                });
            }
        }
        let slot = self.slots.len() as Slot;
        if entry.live {
            if let Some(prev) = self.id_to_slot.insert(entry.id.clone(), slot) {
                // A later slot of the same id supersedes the earlier one.
                self.slots[prev as usize].live = false;
                self.live -= 1;
            }
            self.live += 1;
        }
        self.slots.push(entry);
        Ok(slot)
    }

    pub(crate) fn set_dimension(&mut self, dimension: Option<usize>) {
        self.dimension = dimension;
    }

    pub fn slot_of(&self, id: &str) -> Option<Slot> {
        self.id_to_slot.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.id_to_slot.contains_key(id)
    }

    pub fn entry(&self, slot: Slot) -> &SlotEntry {
        &self.slots[slot as usize]
    }

    pub fn entries(&self) -> &[SlotEntry] {
        &self.slots
    }

    #[inline]
    pub fn is_live(&self, slot: Slot) -> bool {
        self.slots.get(slot as usize).is_some_and(|e| e.live)
    }

    /// The raw vector when retained, otherwise the codec's reconstruction.
    pub fn vector(&self, slot: Slot) -> Cow<'_, [f32]> {
        match &self.slots[slot as usize].vector {
            StoredVector::Raw(v) => Cow::Borrowed(v),
            StoredVector::Quantized { raw: Some(r), .. } => Cow::Borrowed(r),
            StoredVector::Quantized { code, raw: None } => match &self.quantizer {
                Some(q) => Cow::Owned(q.decode(code)),
                None => Cow::Owned(Vec::new()),
            },
        }
    }

    pub fn get(&self, id: &str) -> Option<(Vec<f32>, Metadata)> {
        let slot = self.slot_of(id)?;
        let entry = self.entry(slot);
        Some((self.vector(slot).into_owned(), entry.metadata.clone()))
    }

    pub fn prepare<'q>(&self, query: &'q [f32]) -> PreparedQuery<'q> {
        match &self.quantizer {
            Some(q) => q.prepare(query),
            None => PreparedQuery::Raw(query),
        }
    }

    /// Navigation distance: uses the code when the slot is quantized.
    #[inline]
    pub fn distance(&self, query: &PreparedQuery<'_>, slot: Slot) -> f32 {
        match &self.slots[slot as usize].vector {
            StoredVector::Raw(v) => self.metric.distance(query.raw(), v),
            StoredVector::Quantized { code, raw } => match &self.quantizer {
                Some(q) => q.distance_to_query(query, code),
                None => raw
                    .as_ref()
                    .map_or(f32::MAX, |r| self.metric.distance(query.raw(), r)),
            },
        }
    }

    /// Best available distance: exact when the raw vector is present.
    #[inline]
    pub fn refine_distance(&self, query: &PreparedQuery<'_>, slot: Slot) -> f32 {
        match &self.slots[slot as usize].vector {
            StoredVector::Raw(v) | StoredVector::Quantized { raw: Some(v), .. } => {
                self.metric.distance(query.raw(), v)
            }
            StoredVector::Quantized { .. } => self.distance(query, slot),
        }
    }

    /// Distance between two stored vectors (graph construction and pruning).
    pub fn distance_between(&self, a: Slot, b: Slot) -> f32 {
        let va = self.vector(a);
        self.distance(&PreparedQuery::Raw(&va), b)
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (Slot, &SlotEntry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, e)| e.live)
            .map(|(i, e)| (i as Slot, e))
    }

    /// Live ids in slot order, paginated.
    pub fn ids(&self, offset: usize, limit: usize) -> Vec<String> {
        self.iter_live()
            .skip(offset)
            .take(limit)
            .map(|(_, e)| e.id.clone())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.slots.len() - self.live
    }

    /// Live vectors as one contiguous arena plus their slots.
    pub fn live_arena(&self) -> (Vec<f32>, Vec<Slot>) {
        let dim = self.dimension.unwrap_or(0);
        let mut arena = Vec::with_capacity(self.live * dim);
        let mut slots = Vec::with_capacity(self.live);
        for (slot, _) in self.iter_live() {
            arena.extend_from_slice(&self.vector(slot));
            slots.push(slot);
        }
        (arena, slots)
    }

    /// Drop tombstoned slots and renumber the rest densely.
    pub fn compact(&mut self) -> SlotRemap {
        let remap = SlotRemap::from_liveness(self.slots.iter().map(|e| e.live));
        if remap.is_identity() {
            return remap;
        }
        let old = std::mem::take(&mut self.slots);
        let mut slots = Vec::with_capacity(remap.new_len());
        slots.extend(old.into_iter().filter(|e| e.live));
        self.slots = slots;
        self.id_to_slot = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i as Slot))
            .collect();
        remap
    }

    /// Install a codec for future inserts. Slots already coded by a previous
    /// codec are decoded back to raw first; raw slots are untouched.
    pub fn set_quantizer(&mut self, quantizer: Option<Quantizer>, retain_raw: bool) {
        if self.quantizer.is_some() {
            self.decode_all();
        }
        self.quantizer = quantizer;
        self.retain_raw = retain_raw;
    }

    /// Rewrite every slot with the current codec (or back to raw without one).
    /// Returns the number of slots rewritten.
    pub fn reencode(&mut self) -> usize {
        let mut rewritten = 0;
        for i in 0..self.slots.len() {
            let vector = self.vector(i as Slot).into_owned();
            let stored = self.encode(vector);
            if stored != self.slots[i].vector {
                self.slots[i].vector = stored;
                rewritten += 1;
            }
        }
        rewritten
    }

    /// Decode every slot back to raw `f32` and drop the codec.
    pub fn remove_quantizer(&mut self) -> Option<Quantizer> {
        self.decode_all();
        self.retain_raw = false;
        self.quantizer.take()
    }

    /// Codes only make sense under the codec that wrote them.
    fn decode_all(&mut self) {
        for i in 0..self.slots.len() {
            if matches!(self.slots[i].vector, StoredVector::Quantized { .. }) {
                let vector = self.vector(i as Slot).into_owned();
                self.slots[i].vector = StoredVector::Raw(vector);
            }
        }
    }

    /// Drop every slot and release the buffers.
    pub fn clear(&mut self) {
        self.slots = Vec::new();
        self.id_to_slot = HashMap::new();
        self.live = 0;
        self.dimension = self.configured_dimension;
        self.quantizer = None;
        self.retain_raw = false;
    }

    /// Capacity-based estimate of heap bytes owned by the store.
    pub fn memory_usage(&self) -> usize {
        let mut bytes = self.slots.capacity() * size_of::<SlotEntry>();
        for e in &self.slots {
            bytes += e.id.capacity() + e.vector.heap_bytes();
            bytes += e.metadata.capacity() * size_of::<(String, String)>();
            bytes += e
                .metadata
                .iter()
                .map(|(k, v)| k.capacity() + v.capacity())
                .sum::<usize>();
        }
        bytes += self.id_to_slot.capacity() * (size_of::<String>() + size_of::<Slot>());
        bytes += self.id_to_slot.keys().map(String::capacity).sum::<usize>();
        bytes += self.quantizer.as_ref().map_or(0, Quantizer::memory_usage);
        bytes
    }

    /// Check the id map against the slot array.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let live = self.slots.iter().filter(|e| e.live).count();
        if live != self.live || live != self.id_to_slot.len() {
            return Err(format!(
                "live count {} != flagged live {} / mapped ids {}",
                self.live,
                live,
                self.id_to_slot.len()
            ));
        }
        for (id, &slot) in &self.id_to_slot {
            match self.slots.get(slot as usize) {
                Some(e) if e.live && &e.id == id => {}
                _ => return Err(format!("id {id} maps to invalid slot {slot}")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::QuantizationKind;

    fn store() -> VectorStore {
        VectorStore::new(None, DistanceMetric::L2)
    }

    #[test]
    fn test_first_insert_fixes_dimension() {
        let mut s = store();
        s.insert("a", vec![1.0, 2.0], Metadata::new()).unwrap();
        assert_eq!(s.dimension(), Some(2));
        let err = s.insert("b", vec![1.0, 2.0, 3.0], Metadata::new()).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_upsert_tombstones_old_slot() {
        let mut s = store();
        let (a0, none) = s.insert("a", vec![1.0, 0.0], Metadata::new()).unwrap();
        assert!(none.is_none());
        let (a1, replaced) = s.insert("a", vec![0.0, 1.0], Metadata::new()).unwrap();
        assert_eq!(replaced, Some(a0));
        assert_ne!(a0, a1);
        assert!(!s.is_live(a0));
        assert_eq!(s.live_count(), 1);
        assert_eq!(s.tombstone_count(), 1);
        assert_eq!(s.get("a").unwrap().0, vec![0.0, 1.0]);
    }

    #[test]
    fn test_compact_remaps_densely() {
        let mut s = store();
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            s.insert(id, vec![i as f32, 0.0], Metadata::new()).unwrap();
        }
        s.delete("b");
        s.delete("d");
        let remap = s.compact();
        assert_eq!(remap.get(0), Some(0));
        assert_eq!(remap.get(1), None);
        assert_eq!(remap.get(2), Some(1));
        assert_eq!(remap.get(3), None);
        assert_eq!(remap.dropped(), 2);
        assert_eq!(s.slot_count(), 2);
        assert_eq!(s.slot_of("c"), Some(1));
        s.validate().unwrap();
    }

    #[test]
    fn test_ids_are_paginated_in_slot_order() {
        let mut s = store();
        for id in ["x", "y", "z"] {
            s.insert(id, vec![1.0], Metadata::new()).unwrap();
        }
        s.delete("y");
        assert_eq!(s.ids(0, 10), vec!["x", "z"]);
        assert_eq!(s.ids(1, 1), vec!["z"]);
    }

    #[test]
    fn test_quantizer_is_not_retroactive() {
        let mut s = store();
        for i in 0..20 {
            s.insert(&format!("v{i}"), vec![i as f32, 1.0], Metadata::new())
                .unwrap();
        }
        let (arena, _) = s.live_arena();
        let q = Quantizer::train(QuantizationKind::Scalar, DistanceMetric::L2, &arena, 2, 1)
            .unwrap();
        s.set_quantizer(Some(q), false);
        assert!(matches!(s.entry(0).vector, StoredVector::Raw(_)));
        s.insert("new", vec![3.0, 1.0], Metadata::new()).unwrap();
        let slot = s.slot_of("new").unwrap();
        assert!(matches!(s.entry(slot).vector, StoredVector::Quantized { .. }));
        assert_eq!(s.reencode(), 20);
        assert!(matches!(s.entry(0).vector, StoredVector::Quantized { .. }));

        s.remove_quantizer();
        assert!(s.quantizer().is_none());
        let (v, _) = s.get("v7").unwrap();
        assert!((v[0] - 7.0).abs() < 0.1, "decoded {v:?}");
    }

    #[test]
    fn test_new_codec_decodes_codes_of_the_old_one() {
        let mut s = store();
        for i in 0..40 {
            s.insert(&format!("v{i}"), vec![i as f32, (i % 5) as f32], Metadata::new())
                .unwrap();
        }
        let (arena, _) = s.live_arena();
        let scalar = Quantizer::train(QuantizationKind::Scalar, DistanceMetric::L2, &arena, 2, 1)
            .unwrap();
        let binary = Quantizer::train(QuantizationKind::Binary, DistanceMetric::L2, &arena, 2, 1)
            .unwrap();
        s.set_quantizer(Some(scalar), false);
        s.reencode();
        let coded = s.get("v12").unwrap().0;

        s.set_quantizer(Some(binary), false);
        assert!(s.entries().iter().all(|e| matches!(e.vector, StoredVector::Raw(_))));
        assert_eq!(s.get("v12").unwrap().0, coded);
        assert!((coded[0] - 12.0).abs() < 0.2, "decoded {coded:?}");
    }

    #[test]
    fn test_clear_releases_memory() {
        let mut s = store();
        let baseline = s.memory_usage();
        for i in 0..500 {
            s.insert(&format!("v{i}"), vec![0.5; 32], Metadata::new())
                .unwrap();
        }
        assert!(s.memory_usage() > baseline + 500 * 32 * 4);
        s.clear();
        assert_eq!(s.memory_usage(), baseline);
        assert_eq!(s.dimension(), None);
    }
}
