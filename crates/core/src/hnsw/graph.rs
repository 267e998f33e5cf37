//! HNSW graph structure.

use crate::config::HnswParams;
use crate::hnsw::visited::VisitedSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle of a graph: writers move it Empty → Building → Searchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphState {
    Empty,
    Building,
    Searchable,
}

/// HNSW topology using Struct-of-Arrays layout.
#[derive(Debug, Clone)]
pub struct HnswGraph {
    pub params: HnswParams,
    /// `[node][layer][neighbor]`
    pub neighbors: Vec<Vec<Vec<u32>>>,
    pub levels: Vec<u8>,
    pub entry_point: Option<u32>,
    pub max_layer: usize,
    pub state: GraphState,
    rng: StdRng,
    /// Nodes whose neighbor lists changed since the last [`take_dirty`](Self::take_dirty).
    dirty: BTreeSet<u32>,
    pub(crate) scratch: VisitedSet,
}

impl HnswGraph {
    pub fn new(params: HnswParams, seed: u64) -> Self {
        Self {
            params,
            neighbors: Vec::new(),
            levels: Vec::new(),
            entry_point: None,
            max_layer: 0,
            state: GraphState::Empty,
            rng: StdRng::seed_from_u64(seed),
            dirty: BTreeSet::new(),
            scratch: VisitedSet::default(),
        }
    }

    /// Number of nodes, placeholders included.
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Exponential level assignment: `floor(-ln(U) / ln(M))`, capped.
    pub fn random_level(&mut self) -> usize {
        let ml = 1.0 / (self.params.m as f64).ln();
        // gen::<f64>() is in [0, 1); flip it so ln never sees zero.
        let r: f64 = 1.0 - self.rng.gen::<f64>();
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.params.max_layers - 1)
    }

    #[inline]
    pub fn max_degree(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m0
        } else {
            self.params.m
        }
    }

    #[inline]
    pub fn neighbors_at(&self, node: u32, layer: usize) -> &[u32] {
        self.neighbors[node as usize]
            .get(layer)
            .map_or(&[], Vec::as_slice)
    }

    /// Append edge-less nodes until `slot` is the next node to be added.
    pub fn pad_to(&mut self, slot: u32) {
        while self.neighbors.len() < slot as usize {
            self.neighbors.push(vec![Vec::new()]);
            self.levels.push(0);
        }
    }

    pub(crate) fn mark_dirty(&mut self, node: u32) {
        self.dirty.insert(node);
    }

    /// Drain the set of nodes whose adjacency changed.
    pub fn take_dirty(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Replace a node's adjacency wholesale (segment replay).
    pub fn set_node(&mut self, node: u32, layers: Vec<Vec<u32>>) {
        self.pad_to(node);
        let level = layers.len().saturating_sub(1);
        let layers = if layers.is_empty() { vec![Vec::new()] } else { layers };
        if (node as usize) < self.neighbors.len() {
            self.neighbors[node as usize] = layers;
            self.levels[node as usize] = level as u8;
        } else {
            self.neighbors.push(layers);
            self.levels.push(level as u8);
        }
    }

    /// Restore entry point and top layer after [`set_node`](Self::set_node) replay.
    pub fn set_entry(&mut self, entry_point: Option<u32>, max_layer: usize) {
        self.entry_point = entry_point;
        self.max_layer = max_layer;
        self.state = if entry_point.is_some() {
            GraphState::Searchable
        } else {
            GraphState::Empty
        };
    }

    /// Heap bytes held by the adjacency lists.
    pub fn memory_usage(&self) -> usize {
        let mut bytes = self.neighbors.capacity() * std::mem::size_of::<Vec<Vec<u32>>>();
        for node in &self.neighbors {
            bytes += node.capacity() * std::mem::size_of::<Vec<u32>>();
            bytes += node.iter().map(|l| l.capacity() * 4).sum::<usize>();
        }
        bytes + self.levels.capacity() + self.dirty.len() * 4 + self.scratch.memory_usage()
    }

    /// Check array lengths, neighbor bounds, degree limits and the entry point.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.neighbors.len();
        if self.levels.len() != n {
            return Err(format!("levels length {} != node count {n}", self.levels.len()));
        }
        match self.entry_point {
            Some(ep) if ep as usize >= n => {
                return Err(format!("entry point {ep} out of bounds (node count {n})"));
            }
            Some(ep) if self.levels[ep as usize] as usize != self.max_layer => {
                return Err(format!(
                    "entry point {ep} has level {} but max layer is {}",
                    self.levels[ep as usize], self.max_layer
                ));
            }
            None if n > 0 && self.neighbors.iter().any(|l| l.iter().any(|x| !x.is_empty())) => {
                return Err("graph has edges but no entry point".into());
            }
            _ => {}
        }
        for (node, layers) in self.neighbors.iter().enumerate() {
            if layers.len() != self.levels[node] as usize + 1 {
                return Err(format!(
                    "node {node} has {} layers, level says {}",
                    layers.len(),
                    self.levels[node]
                ));
            }
            for (layer, list) in layers.iter().enumerate() {
                if list.len() > self.max_degree(layer) {
                    return Err(format!(
                        "node {node} layer {layer} has degree {} > {}",
                        list.len(),
                        self.max_degree(layer)
                    ));
                }
                if let Some(&bad) = list.iter().find(|&&nb| nb as usize >= n) {
                    return Err(format!("node {node} layer {layer} links to {bad} (node count {n})"));
                }
            }
        }
        Ok(())
    }
}
