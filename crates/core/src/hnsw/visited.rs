//! Generation-based visited set for graph traversal.
//!
//! `clear()` bumps a generation counter instead of zeroing the array, so a
//! traversal costs O(nodes touched) rather than O(graph size).

/// Visited marks keyed by node id. A node is visited when its mark equals
/// the current generation. The u16 generation wraps every 65 534 clears,
/// at which point the array is zeroed once.
#[derive(Debug, Clone)]
pub struct VisitedSet {
    marks: Vec<u16>,
    generation: u16,
}

impl VisitedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            marks: vec![0u16; capacity],
            generation: 1,
        }
    }

    pub fn clear(&mut self) {
        if self.generation == u16::MAX {
            self.marks.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
    }

    /// Grow to cover at least `cap` node ids.
    pub fn ensure_capacity(&mut self, cap: usize) {
        if cap > self.marks.len() {
            self.marks.resize(cap, 0);
        }
    }

    /// Mark `id`. Returns `true` if it was not yet visited in this generation.
    #[inline]
    pub fn insert(&mut self, id: u32) -> bool {
        let idx = id as usize;
        if self.marks[idx] == self.generation {
            false
        } else {
            self.marks[idx] = self.generation;
            true
        }
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.marks.get(id as usize) == Some(&self.generation)
    }

    pub fn memory_usage(&self) -> usize {
        self.marks.capacity() * std::mem::size_of::<u16>()
    }
}

impl Default for VisitedSet {
    fn default() -> Self {
        Self::new(0)
    }
}
