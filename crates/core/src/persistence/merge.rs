//! Folding segments back into memory, and merging them into one.

use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::graph::{GraphIndex, IndexState};
use crate::persistence::manifest::segment_file_name;
use crate::persistence::segment::{Segment, SegmentKind};
use crate::store::VectorStore;
use std::path::{Path, PathBuf};

/// In-memory state rebuilt from a chain of segments.
#[derive(Debug)]
pub(crate) struct Restored {
    pub config: IndexConfig,
    pub store: VectorStore,
    pub graph: Option<GraphIndex>,
    pub generation: u64,
}

/// Apply segments in order: a full segment resets the state, a delta must
/// start exactly where the state ends. `None` when `segments` is empty.
pub(crate) fn fold_segments<I>(segments: I) -> Result<Option<Restored>>
where
    I: IntoIterator<Item = (PathBuf, Segment)>,
{
    let mut state = None;
    for (path, segment) in segments {
        state = Some(apply(state, segment, &path)?);
    }
    Ok(state)
}

fn apply(state: Option<Restored>, segment: Segment, path: &Path) -> Result<Restored> {
    let Segment {
        header,
        entries,
        tombstones,
        graph,
    } = segment;
    let corrupt = |reason: String| IndexError::corrupt(path, reason);

    let mut state = match (header.kind, state) {
        (SegmentKind::Full, _) => {
            let mut store = VectorStore::new(header.config.dimension, header.metric);
            store.set_dimension(header.dimension);
            store.set_quantizer(header.quantizer.clone(), header.retain_raw);
            let graph = header
                .state
                .graph_algorithm()
                .map(|a| GraphIndex::new(a, &header.config));
            Restored {
                config: header.config.clone(),
                store,
                graph,
                generation: header.generation,
            }
        }
        (SegmentKind::Delta, Some(s)) => s,
        (SegmentKind::Delta, None) => {
            return Err(corrupt("delta segment without a full segment before it".into()))
        }
    };

    if header.base_slot as usize != state.store.slot_count() {
        return Err(corrupt(format!(
            "slot discontinuity: segment starts at {}, index ends at {}",
            header.base_slot,
            state.store.slot_count()
        )));
    }
    if IndexState::of(state.graph.as_ref()) != header.state {
        return Err(corrupt(format!(
            "delta segment switches index state to {}",
            header.state.as_str()
        )));
    }

    for entry in entries {
        state
            .store
            .push_entry(entry)
            .map_err(|e| corrupt(e.to_string()))?;
    }
    for slot in tombstones {
        if slot as usize >= state.store.slot_count() {
            return Err(corrupt(format!("tombstone for unknown slot {slot}")));
        }
        state.store.tombstone(slot);
    }

    match (state.graph.as_mut(), graph) {
        (Some(g), Some(block)) => {
            if block.algorithm != g.algorithm() {
                return Err(corrupt("graph block algorithm differs from the index graph".into()));
            }
            for (node, layers) in block.nodes {
                if node >= block.len {
                    return Err(corrupt(format!("graph node {node} beyond graph length {}", block.len)));
                }
                g.set_node(node, layers);
            }
            g.pad_to(block.len);
            g.set_entry(block.entry_point, block.max_layer);
            g.take_dirty();
        }
        (None, None) => {}
        _ => return Err(corrupt("graph block does not match the header state".into())),
    }

    if state.store.slot_count() != header.slot_count as usize {
        return Err(corrupt(format!(
            "segment claims {} slots, fold produced {}",
            header.slot_count,
            state.store.slot_count()
        )));
    }
    if state.store.live_count() != header.live_count {
        return Err(corrupt(format!(
            "segment claims {} live vectors, fold produced {}",
            header.live_count,
            state.store.live_count()
        )));
    }
    state.store.validate().map_err(corrupt)?;
    if let Some(g) = &state.graph {
        if g.len() > state.store.slot_count() {
            return Err(corrupt(format!(
                "graph holds {} nodes for {} slots",
                g.len(),
                state.store.slot_count()
            )));
        }
        g.validate().map_err(corrupt)?;
    }
    state.config = header.config;
    state.generation = header.generation;
    Ok(state)
}

/// Fold `segments` (a full segment followed by deltas) into one full segment
/// stamped `generation`.
///
/// Tombstoned slots are dropped and survivors renumbered densely; graph edges
/// that ran through a dropped node are re-linked and re-pruned.
pub fn merge_segments(segments: Vec<Segment>, generation: u64) -> Result<Segment> {
    let labelled = segments
        .into_iter()
        .map(|s| (PathBuf::from(segment_file_name(s.generation())), s));
    let Some(mut state) = fold_segments(labelled)? else {
        return Err(IndexError::InvalidConfig("no segments to merge".into()));
    };
    if let Some(g) = state.graph.as_mut() {
        g.catch_up(&state.store);
    }
    let remap = state.store.compact();
    if let Some(g) = state.graph.as_mut() {
        g.remap(&state.store, &remap);
    }
    tracing::debug!(
        generation,
        dropped = remap.dropped(),
        live = state.store.live_count(),
        "merged segments"
    );
    Ok(Segment::full(
        generation,
        &state.config,
        &state.store,
        state.graph.as_ref(),
    ))
}
