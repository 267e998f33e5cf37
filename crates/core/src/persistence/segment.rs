//! Segment files.
//!
//! A segment is `"HSEG"`, a big-endian `u16` format version, then five tagged
//! blocks in fixed order: header, vectors, metadata, tombstones, graph. Each
//! block is framed as `[u8 tag][u32 len BE][u32 crc32 BE][bincode payload]`.
//!
//! The vector block carries an offset table so rows can be located without
//! decoding their predecessors. A full segment holds every slot; a delta
//! holds slots from `base_slot` on, tombstones for older slots and the
//! adjacency of graph nodes that changed since the previous generation.

use crate::cancel::WorkBudget;
use crate::config::{GraphAlgorithm, IndexConfig};
use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};
use crate::graph::{GraphIndex, IndexState};
use crate::quantization::Quantizer;
use crate::record::{Metadata, Slot};
use crate::store::{SlotEntry, StoredVector, VectorStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

pub const SEGMENT_MAGIC: &[u8; 4] = b"HSEG";
pub const SEGMENT_FORMAT_VERSION: u16 = 1;

const TAG_HEADER: u8 = 1;
const TAG_VECTORS: u8 = 2;
const TAG_METADATA: u8 = 3;
const TAG_TOMBSTONES: u8 = 4;
const TAG_GRAPH: u8 = 5;

/// Rows encoded between budget checks.
const ROWS_PER_CHECK: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    Full,
    Delta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub generation: u64,
    pub kind: SegmentKind,
    pub config: IndexConfig,
    pub dimension: Option<usize>,
    pub metric: DistanceMetric,
    pub state: IndexState,
    /// First slot held by the vector block.
    pub base_slot: u32,
    /// Slot count of the index once this segment is applied.
    pub slot_count: u32,
    pub live_count: usize,
    pub quantizer: Option<Quantizer>,
    pub retain_raw: bool,
}

/// Adjacency of a subset of graph nodes plus the graph-wide entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphBlock {
    pub algorithm: GraphAlgorithm,
    pub len: u32,
    pub entry_point: Option<u32>,
    pub max_layer: usize,
    pub nodes: Vec<(u32, Vec<Vec<u32>>)>,
}

impl GraphBlock {
    fn capture(graph: &GraphIndex, nodes: impl IntoIterator<Item = u32>) -> Self {
        Self {
            algorithm: graph.algorithm(),
            len: graph.len() as u32,
            entry_point: graph.entry_point(),
            max_layer: graph.max_layer(),
            nodes: nodes
                .into_iter()
                .filter(|&n| (n as usize) < graph.len())
                .map(|n| (n, graph.node_layers(n)))
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct RowRef<'a> {
    id: &'a str,
    vector: &'a StoredVector,
    live: bool,
}

#[derive(Deserialize)]
struct Row {
    id: String,
    vector: StoredVector,
    live: bool,
}

#[derive(Serialize, Deserialize)]
struct VectorBlock {
    offsets: Vec<u64>,
    payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub header: SegmentHeader,
    pub entries: Vec<SlotEntry>,
    /// Slots below `base_slot` deleted since the previous generation.
    pub tombstones: Vec<Slot>,
    pub graph: Option<GraphBlock>,
}

impl Segment {
    /// Snapshot every slot and every graph node.
    pub(crate) fn full(
        generation: u64,
        config: &IndexConfig,
        store: &VectorStore,
        graph: Option<&GraphIndex>,
    ) -> Self {
        Self {
            header: header(generation, SegmentKind::Full, config, store, graph, 0),
            entries: store.entries().to_vec(),
            tombstones: Vec::new(),
            graph: graph.map(|g| GraphBlock::capture(g, 0..g.len() as u32)),
        }
    }

    /// Snapshot the changes since a generation that ended at `base_slot`.
    pub(crate) fn delta(
        generation: u64,
        config: &IndexConfig,
        store: &VectorStore,
        graph: Option<&GraphIndex>,
        base_slot: u32,
        tombstones: Vec<Slot>,
        changed_nodes: Vec<u32>,
    ) -> Self {
        Self {
            header: header(generation, SegmentKind::Delta, config, store, graph, base_slot),
            entries: store.entries()[base_slot as usize..].to_vec(),
            tombstones,
            graph: graph.map(|g| GraphBlock::capture(g, changed_nodes)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.header.generation
    }

    pub fn kind(&self) -> SegmentKind {
        self.header.kind
    }

    /// Serialize to the on-disk layout, checking `budget` while encoding rows.
    pub fn encode(&self, budget: &WorkBudget) -> Result<Vec<u8>> {
        let mut offsets = Vec::with_capacity(self.entries.len());
        let mut payload = Vec::new();
        for (i, e) in self.entries.iter().enumerate() {
            if i % ROWS_PER_CHECK == 0 {
                budget.check()?;
            }
            offsets.push(payload.len() as u64);
            let row = RowRef {
                id: &e.id,
                vector: &e.vector,
                live: e.live,
            };
            bincode::serialize_into(&mut payload, &row).map_err(encode_error)?;
        }
        let metadata: Vec<(Slot, &Metadata)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.metadata.is_empty())
            .map(|(i, e)| (self.header.base_slot + i as Slot, &e.metadata))
            .collect();

        let mut out = Vec::with_capacity(payload.len() + offsets.len() * 8 + 1024);
        out.extend_from_slice(SEGMENT_MAGIC);
        out.extend_from_slice(&SEGMENT_FORMAT_VERSION.to_be_bytes());
        push_block(&mut out, TAG_HEADER, &self.header)?;
        push_block(&mut out, TAG_VECTORS, &VectorBlock { offsets, payload })?;
        budget.check()?;
        push_block(&mut out, TAG_METADATA, &metadata)?;
        push_block(&mut out, TAG_TOMBSTONES, &self.tombstones)?;
        push_block(&mut out, TAG_GRAPH, &self.graph)?;
        Ok(out)
    }

    /// Parse and verify a segment. `path` is only used in error messages.
    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        if bytes.len() < 6 || &bytes[..4] != SEGMENT_MAGIC {
            return Err(IndexError::corrupt(path, "bad segment magic"));
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != SEGMENT_FORMAT_VERSION {
            return Err(IndexError::corrupt(
                path,
                format!("unsupported segment format version {version}"),
            ));
        }
        let mut reader = BlockReader {
            bytes,
            pos: 6,
            path,
        };
        let header: SegmentHeader = reader.next(TAG_HEADER, "header")?;
        let vectors: VectorBlock = reader.next(TAG_VECTORS, "vector")?;
        let metadata: Vec<(Slot, Metadata)> = reader.next(TAG_METADATA, "metadata")?;
        let tombstones: Vec<Slot> = reader.next(TAG_TOMBSTONES, "tombstone")?;
        let graph: Option<GraphBlock> = reader.next(TAG_GRAPH, "graph")?;
        if reader.pos != bytes.len() {
            return Err(IndexError::corrupt(path, "trailing bytes after graph block"));
        }

        let expected = header.slot_count.checked_sub(header.base_slot).ok_or_else(|| {
            IndexError::corrupt(path, "segment slot count below its base slot")
        })?;
        if vectors.offsets.len() != expected as usize {
            return Err(IndexError::corrupt(
                path,
                format!(
                    "vector block holds {} rows, header expects {expected}",
                    vectors.offsets.len()
                ),
            ));
        }
        let mut entries = Vec::with_capacity(vectors.offsets.len());
        for (i, &start) in vectors.offsets.iter().enumerate() {
            let end = vectors
                .offsets
                .get(i + 1)
                .copied()
                .unwrap_or(vectors.payload.len() as u64);
            if start > end || end > vectors.payload.len() as u64 {
                return Err(IndexError::corrupt(path, format!("bad offset for row {i}")));
            }
            let row: Row = bincode::deserialize(&vectors.payload[start as usize..end as usize])
                .map_err(|e| IndexError::corrupt(path, format!("row {i}: {e}")))?;
            entries.push(SlotEntry {
                id: row.id,
                vector: row.vector,
                metadata: Metadata::new(),
                live: row.live,
            });
        }
        for (slot, meta) in metadata {
            let idx = slot
                .checked_sub(header.base_slot)
                .map(|i| i as usize)
                .filter(|&i| i < entries.len())
                .ok_or_else(|| IndexError::corrupt(path, format!("metadata for unknown slot {slot}")))?;
            entries[idx].metadata = meta;
        }
        if let Some(&bad) = tombstones.iter().find(|&&t| t >= header.base_slot) {
            return Err(IndexError::corrupt(
                path,
                format!("tombstone {bad} is not below base slot {}", header.base_slot),
            ));
        }
        Ok(Self {
            header,
            entries,
            tombstones,
            graph,
        })
    }

    /// Write atomically: temp file, fsync, rename. Returns the file size.
    pub fn write(&self, path: &Path, budget: &WorkBudget) -> Result<u64> {
        let bytes = self.encode(budget)?;
        let tmp = path.with_extension("hseg.tmp");
        let written = write_synced(&tmp, &bytes).and_then(|_| budget.check());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, path)?;
        tracing::debug!(
            "wrote {:?} segment {} ({} rows, {} tombstones, {} bytes)",
            self.header.kind,
            self.header.generation,
            self.entries.len(),
            self.tombstones.len(),
            bytes.len()
        );
        Ok(bytes.len() as u64)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::decode(&bytes, path)
    }
}

fn header(
    generation: u64,
    kind: SegmentKind,
    config: &IndexConfig,
    store: &VectorStore,
    graph: Option<&GraphIndex>,
    base_slot: u32,
) -> SegmentHeader {
    SegmentHeader {
        generation,
        kind,
        config: config.clone(),
        dimension: store.dimension(),
        metric: store.metric(),
        state: IndexState::of(graph),
        base_slot,
        slot_count: store.slot_count() as u32,
        live_count: store.live_count(),
        quantizer: store.quantizer().cloned(),
        retain_raw: store.retains_raw(),
    }
}

pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn encode_error(e: bincode::Error) -> IndexError {
    IndexError::Io(io::Error::other(e.to_string()))
}

fn push_block<T: Serialize + ?Sized>(out: &mut Vec<u8>, tag: u8, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(encode_error)?;
    let len = u32::try_from(bytes.len()).map_err(|_| {
        IndexError::CapacityExceeded(format!("segment block {tag} exceeds 4 GiB"))
    })?;
    out.push(tag);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(&bytes).to_be_bytes());
    out.extend_from_slice(&bytes);
    Ok(())
}

struct BlockReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl BlockReader<'_> {
    fn next<T: DeserializeOwned>(&mut self, tag: u8, name: &str) -> Result<T> {
        let rest = &self.bytes[self.pos..];
        if rest.len() < 9 {
            return Err(IndexError::corrupt(self.path, format!("{name} block truncated")));
        }
        if rest[0] != tag {
            return Err(IndexError::corrupt(
                self.path,
                format!("expected {name} block (tag {tag}), found tag {}", rest[0]),
            ));
        }
        let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        let stored_crc = u32::from_be_bytes([rest[5], rest[6], rest[7], rest[8]]);
        let payload = rest
            .get(9..9 + len)
            .ok_or_else(|| IndexError::corrupt(self.path, format!("{name} block truncated")))?;
        let computed = crc32fast::hash(payload);
        if computed != stored_crc {
            return Err(IndexError::corrupt(
                self.path,
                format!("{name} block CRC32 mismatch: expected {stored_crc:#010x}, got {computed:#010x}"),
            ));
        }
        let value = bincode::deserialize(payload)
            .map_err(|e| IndexError::corrupt(self.path, format!("{name} block: {e}")))?;
        self.pos += 9 + len;
        Ok(value)
    }
}
