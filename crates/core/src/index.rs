//! The public index handle.
//!
//! [`VectorIndex`] is a cheaply cloneable handle over one engine: a vector
//! store, an optional graph and, for persistent indexes, a storage
//! directory. Writers take the engine's write lock; searches and lookups
//! share the read lock. Mutations of a persistent index are logged to the
//! WAL before they are applied.

use crate::cancel::{CancelToken, WorkBudget};
use crate::config::{self, Algorithm, GraphAlgorithm, IndexConfig};
use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};
use crate::filter::Filter;
use crate::flat;
use crate::graph::{GraphIndex, GraphQuery, IndexState};
use crate::migration::{self, MigrationHandle, MigrationProgress, MigrationShared, MigrationStatus};
use crate::persistence::{
    CheckpointOptions, CheckpointReport, PersistenceManager, Segment, WalEntry,
};
use crate::quantization::{self, CalibrationReport, QuantizationKind, Quantizer};
use crate::record::{self, Confidence, Metadata, SearchHit, SearchResponse, Slot, VectorRecord};
use crate::store::VectorStore;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Per-query options for [`VectorIndex::search_with`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub k: usize,
    pub filter: Option<Filter>,
    /// Beam width override for graph search.
    pub ef: Option<usize>,
    /// Attach the stored (or decoded) vector to every hit.
    pub include_vectors: bool,
}

impl SearchOptions {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ef(mut self, ef: usize) -> Self {
        self.ef = Some(ef);
        self
    }

    pub fn with_vectors(mut self) -> Self {
        self.include_vectors = true;
        self
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            k: 10,
            filter: None,
            ef: None,
            include_vectors: false,
        }
    }
}

/// Per-item results of [`VectorIndex::add_batch`], in input order.
#[derive(Debug)]
pub struct BatchOutcome {
    /// `Ok(true)` for a new id, `Ok(false)` for an upsert.
    pub results: Vec<(String, Result<bool>)>,
}

impl BatchOutcome {
    /// Ids that were written.
    pub fn committed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<(&str, &IndexError)> {
        self.results
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.as_str(), e)))
            .collect()
    }

    pub fn inserted(&self) -> usize {
        self.results.iter().filter(|(_, r)| matches!(r, Ok(true))).count()
    }

    pub fn updated(&self) -> usize {
        self.results.iter().filter(|(_, r)| matches!(r, Ok(false))).count()
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }
}

/// A point-in-time summary of an index.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub vector_count: usize,
    pub slot_count: usize,
    pub tombstone_count: usize,
    pub dimension: Option<usize>,
    pub metric: DistanceMetric,
    pub algorithm: Algorithm,
    pub status: IndexState,
    pub migration: Option<MigrationProgress>,
    pub auto_migration_suspended: bool,
    pub last_migration_error: Option<String>,
    pub quantization: Option<QuantizationKind>,
    pub calibration: Option<CalibrationReport>,
    pub memory_bytes: usize,
    pub path: Option<PathBuf>,
    /// Generation of the last successful checkpoint.
    pub generation: u64,
    pub segments: usize,
}

#[derive(Debug)]
struct ActiveMigration {
    epoch: u64,
    shared: Arc<MigrationShared>,
    /// Adds accepted since the snapshot was taken.
    pending: usize,
}

#[derive(Debug)]
struct IndexCore {
    config: IndexConfig,
    store: VectorStore,
    graph: Option<GraphIndex>,
    /// Bumped whenever slot numbers are invalidated (clear, compact).
    epoch: u64,
    active: Option<ActiveMigration>,
    auto_migration_suspended: bool,
    last_migration_error: Option<String>,
    calibration: Option<CalibrationReport>,
    /// Slots covered by the last checkpoint.
    persisted_slots: usize,
    /// Slots below `persisted_slots` deleted since the last checkpoint.
    unsaved_tombstones: BTreeSet<Slot>,
    needs_full: bool,
    dirty: bool,
}

fn forced_graph(config: &IndexConfig) -> Option<GraphIndex> {
    match config.algorithm {
        Algorithm::Hnsw => Some(GraphIndex::new(GraphAlgorithm::Hnsw, config)),
        Algorithm::DiskAnn => Some(GraphIndex::new(GraphAlgorithm::DiskAnn, config)),
        Algorithm::Auto | Algorithm::Flat => None,
    }
}

impl IndexCore {
    fn new(config: IndexConfig) -> Self {
        Self {
            store: VectorStore::new(config.dimension, config.metric),
            graph: forced_graph(&config),
            config,
            epoch: 0,
            active: None,
            auto_migration_suspended: false,
            last_migration_error: None,
            calibration: None,
            persisted_slots: 0,
            unsaved_tombstones: BTreeSet::new(),
            needs_full: true,
            dirty: false,
        }
    }

    /// Whether `id` with `vector` may be added, given `new_ids` new ids and
    /// `accepted` adds already admitted in the same call.
    fn admit(
        &self,
        id: &str,
        vector: &[f32],
        dimension: Option<usize>,
        is_new: bool,
        new_ids: usize,
        accepted: usize,
    ) -> Result<()> {
        record::validate_id(id)?;
        record::validate_vector(vector)?;
        if let Some(expected) = dimension {
            if expected != vector.len() {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }
        if let Some(max) = self.config.max_vectors {
            if is_new && self.store.live_count() + new_ids >= max {
                return Err(IndexError::CapacityExceeded(format!(
                    "index holds its maximum of {max} vectors"
                )));
            }
        }
        if let Some(active) = &self.active {
            if active.pending + accepted >= self.config.max_pending_during_migration {
                return Err(IndexError::CapacityExceeded(format!(
                    "{} adds are waiting for the running migration",
                    active.pending + accepted
                )));
            }
        }
        Ok(())
    }

    fn admit_one(&self, id: &str, vector: &[f32]) -> Result<()> {
        let is_new = !self.store.contains(id);
        self.admit(id, vector, self.store.dimension(), is_new, 0, 0)
    }

    fn note_tombstone(&mut self, slot: Option<Slot>) {
        if let Some(slot) = slot {
            if (slot as usize) < self.persisted_slots {
                self.unsaved_tombstones.insert(slot);
            }
        }
    }

    fn apply_add(&mut self, id: &str, vector: Vec<f32>, metadata: Metadata) -> Result<bool> {
        let (_, replaced) = self.store.insert(id, vector, metadata)?;
        self.note_tombstone(replaced);
        self.after_insert(1);
        Ok(replaced.is_none())
    }

    fn apply_batch(&mut self, items: Vec<(String, Vec<f32>, Metadata)>) -> Result<Vec<bool>> {
        let mut inserted = Vec::with_capacity(items.len());
        let mut result = Ok(());
        for (id, vector, metadata) in items {
            match self.store.insert(&id, vector, metadata) {
                Ok((_, replaced)) => {
                    self.note_tombstone(replaced);
                    inserted.push(replaced.is_none());
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.after_insert(inserted.len());
        result.map(|_| inserted)
    }

    /// Admit new slots to the graph, count backpressure, maybe migrate.
    fn after_insert(&mut self, added: usize) {
        if added == 0 {
            return;
        }
        self.dirty = true;
        if let Some(graph) = self.graph.as_mut() {
            graph.catch_up(&self.store);
        }
        if let Some(active) = self.active.as_mut() {
            active.pending += added;
        }
        self.maybe_migrate();
    }

    fn maybe_migrate(&mut self) {
        let due = self.config.algorithm == Algorithm::Auto
            && self.graph.is_none()
            && self.active.is_none()
            && !self.auto_migration_suspended
            && self.store.live_count() >= self.config.migration_threshold;
        if due {
            // Failures are recorded in `last_migration_error`; the add stands.
            let _ = self.migrate_now(CancelToken::new());
        }
    }

    /// Build the target graph inside the write lock.
    fn migrate_now(&mut self, token: CancelToken) -> Result<()> {
        let budget = WorkBudget::new(token, self.config.migration_timeout());
        let started = Instant::now();
        match migration::build_graph(&self.store, self.config.target, &self.config, &budget, None) {
            Ok(graph) => {
                self.install_graph(graph);
                tracing::info!(
                    "migrated {} vectors to {} in {} ms",
                    self.store.live_count(),
                    IndexState::of(self.graph.as_ref()).as_str(),
                    started.elapsed().as_millis()
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "migration to {:?} abandoned after {} ms: {}; staying flat until flush()",
                    self.config.target,
                    started.elapsed().as_millis(),
                    e
                );
                self.last_migration_error = Some(e.to_string());
                self.auto_migration_suspended = true;
                Err(e)
            }
        }
    }

    fn install_graph(&mut self, mut graph: GraphIndex) {
        graph.take_dirty();
        self.graph = Some(graph);
        self.last_migration_error = None;
        self.needs_full = true;
        self.dirty = true;
    }

    fn apply_delete(&mut self, ids: &[String]) -> Vec<bool> {
        let out: Vec<bool> = ids
            .iter()
            .map(|id| {
                let slot = self.store.delete(id);
                self.note_tombstone(slot);
                slot.is_some()
            })
            .collect();
        if out.iter().any(|&d| d) {
            self.dirty = true;
        }
        out
    }

    fn apply_clear(&mut self) {
        if let Some(active) = self.active.take() {
            active.shared.token.cancel();
        }
        self.store.clear();
        self.graph = forced_graph(&self.config);
        self.epoch += 1;
        self.auto_migration_suspended = false;
        self.last_migration_error = None;
        self.calibration = None;
        self.unsaved_tombstones = BTreeSet::new();
        self.persisted_slots = 0;
        self.needs_full = true;
        self.dirty = true;
    }

    fn apply_compact(&mut self) -> usize {
        if let Some(graph) = self.graph.as_mut() {
            graph.catch_up(&self.store);
        }
        let remap = self.store.compact();
        if remap.is_identity() {
            return 0;
        }
        if let Some(graph) = self.graph.as_mut() {
            graph.remap(&self.store, &remap);
        }
        self.epoch += 1;
        self.unsaved_tombstones.clear();
        self.needs_full = true;
        self.dirty = true;
        tracing::debug!(dropped = remap.dropped(), "compacted store");
        remap.dropped()
    }

    fn apply_enable_quantization(&mut self, quantizer: Quantizer, retain_raw: bool) {
        self.store.set_quantizer(Some(quantizer), retain_raw);
        self.needs_full = true;
        self.dirty = true;
    }

    fn apply_disable_quantization(&mut self) -> bool {
        let removed = self.store.remove_quantizer().is_some();
        if removed {
            self.calibration = None;
            self.needs_full = true;
            self.dirty = true;
        }
        removed
    }

    fn apply_reencode(&mut self) -> usize {
        let rewritten = self.store.reencode();
        if rewritten > 0 {
            self.needs_full = true;
            self.dirty = true;
        }
        rewritten
    }

    /// Re-apply a logged mutation. Item-level failures are skipped exactly as
    /// they were rejected the first time.
    fn replay(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::Add {
                id,
                vector,
                metadata,
            } => {
                let applied = self
                    .admit_one(&id, &vector)
                    .and_then(|_| self.apply_add(&id, vector, metadata));
                if let Err(e) = applied {
                    tracing::debug!("skipping logged add of {}: {}", id, e);
                }
            }
            WalEntry::AddBatch { items } => {
                if let Err(e) = self.apply_batch(items) {
                    tracing::debug!("logged batch stopped early: {}", e);
                }
            }
            WalEntry::Delete { ids } => {
                self.apply_delete(&ids);
            }
            WalEntry::Clear => self.apply_clear(),
            WalEntry::Compact => {
                self.apply_compact();
            }
            WalEntry::EnableQuantization {
                quantizer,
                retain_raw,
            } => self.apply_enable_quantization(quantizer, retain_raw),
            WalEntry::DisableQuantization => {
                self.apply_disable_quantization();
            }
            WalEntry::Reencode => {
                self.apply_reencode();
            }
        }
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&Filter>,
        ef: Option<usize>,
        include_vectors: bool,
    ) -> Result<SearchResponse> {
        if k > config::MAX_K {
            return Err(IndexError::InvalidConfig(format!(
                "k must be at most {}, got {k}",
                config::MAX_K
            )));
        }
        self.store.check_vector(query)?;
        if k == 0 || self.store.live_count() == 0 {
            return Ok(SearchResponse::empty());
        }

        let (found, confidence) = match &self.graph {
            Some(graph) => graph.search(
                &self.store,
                query,
                GraphQuery {
                    k,
                    ef,
                    rerank_factor: self.config.quantization.rerank_factor,
                },
                filter,
            ),
            None => {
                let prepared = self.store.prepare(query);
                let hits = flat::scan(&self.store, &prepared, k, |_, e| {
                    filter.map_or(true, |f| f.matches(&e.metadata))
                });
                (hits, Confidence::Exact)
            }
        };

        let metric = self.store.metric();
        let hits = found
            .into_iter()
            .map(|(slot, distance)| {
                let entry = self.store.entry(slot);
                SearchHit {
                    id: entry.id.clone(),
                    score: metric.score(distance),
                    distance,
                    metadata: entry.metadata.clone(),
                    vector: include_vectors.then(|| self.store.vector(slot).into_owned()),
                }
            })
            .collect();
        Ok(SearchResponse { hits, confidence })
    }

    fn memory_usage(&self) -> usize {
        self.store.memory_usage() + self.graph.as_ref().map_or(0, GraphIndex::memory_usage)
    }
}

/// Structural parameters come from disk; operational knobs from the caller.
fn reconcile(persisted: IndexConfig, requested: &IndexConfig, stored_dim: Option<usize>) -> Result<IndexConfig> {
    if persisted.metric != requested.metric {
        return Err(IndexError::InvalidConfig(format!(
            "index on disk uses the {} metric, {} was requested",
            persisted.metric.as_str(),
            requested.metric.as_str()
        )));
    }
    if let (Some(expected), Some(actual)) = (stored_dim.or(persisted.dimension), requested.dimension) {
        if expected != actual {
            return Err(IndexError::DimensionMismatch { expected, actual });
        }
    }
    Ok(IndexConfig {
        migration_threshold: requested.migration_threshold,
        quantization: requested.quantization.clone(),
        max_vectors: requested.max_vectors,
        max_pending_during_migration: requested.max_pending_during_migration,
        migration_timeout_ms: requested.migration_timeout_ms,
        checkpoint_timeout_ms: requested.checkpoint_timeout_ms,
        max_segments: requested.max_segments,
        wal: requested.wal,
        ..persisted
    })
}

#[derive(Debug)]
struct Shared {
    core: RwLock<IndexCore>,
    storage: Option<PersistenceManager>,
}

/// Handle to an index. Clones share the same engine.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    shared: Arc<Shared>,
}

impl VectorIndex {
    /// An in-memory index. `checkpoint` is a no-op on it.
    pub fn new(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                core: RwLock::new(IndexCore::new(config)),
                storage: None,
            }),
        })
    }

    /// Open (or create) a persistent index in `path`.
    ///
    /// Segments are folded in generation order and the WAL tail is replayed.
    /// Any checksum or structural mismatch fails with `CorruptPersistence`;
    /// another live instance on the same directory fails with `Locked`.
    pub fn open(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let started = Instant::now();
        let (storage, recovered) = PersistenceManager::open(path.as_ref(), config.wal)?;
        let mut core = match recovered.restored {
            Some(restored) => {
                let config = reconcile(restored.config, &config, restored.store.dimension())?;
                let persisted_slots = restored.store.slot_count();
                IndexCore {
                    store: restored.store,
                    graph: restored.graph,
                    persisted_slots,
                    needs_full: false,
                    ..IndexCore::new(config)
                }
            }
            None => IndexCore::new(config),
        };
        let replayed = recovered.wal.len();
        for entry in recovered.wal {
            core.replay(entry);
        }
        if let Some(graph) = core.graph.as_mut() {
            graph.catch_up(&core.store);
        }
        tracing::info!(
            "recovered {} vectors from {:?} ({}, {} WAL entries replayed) in {} ms",
            core.store.live_count(),
            storage.dir(),
            IndexState::of(core.graph.as_ref()).as_str(),
            replayed,
            started.elapsed().as_millis()
        );
        if recovered.stats.crc_errors > 0 || recovered.stats.truncated > 0 {
            tracing::warn!("WAL replay stopped early: {:?}", recovered.stats);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                core: RwLock::new(core),
                storage: Some(storage),
            }),
        })
    }

    fn log_with(&self, entry: impl FnOnce() -> WalEntry) -> Result<()> {
        match &self.shared.storage {
            Some(storage) if storage.wal_enabled() => storage.log(&entry()),
            _ => Ok(()),
        }
    }

    /// Insert or replace `id`. Returns `true` when the id was new.
    pub fn add(&self, id: &str, vector: &[f32], metadata: Option<Metadata>) -> Result<bool> {
        let mut core = self.shared.core.write();
        core.admit_one(id, vector)?;
        let metadata = metadata.unwrap_or_default();
        self.log_with(|| WalEntry::Add {
            id: id.to_owned(),
            vector: vector.to_vec(),
            metadata: metadata.clone(),
        })?;
        core.apply_add(id, vector.to_vec(), metadata)
    }

    /// Insert many vectors under one write lock. Items are validated one by
    /// one and reported in [`BatchOutcome`]; mismatched argument lengths or an
    /// invalid first vector on an index without a dimension abort the call.
    pub fn add_batch<S: AsRef<str>>(
        &self,
        ids: &[S],
        vectors: &[Vec<f32>],
        metadata: Option<Vec<Metadata>>,
    ) -> Result<BatchOutcome> {
        if ids.len() != vectors.len() || metadata.as_ref().is_some_and(|m| m.len() != ids.len()) {
            return Err(IndexError::InvalidVector(format!(
                "batch has {} ids, {} vectors and {} metadata maps",
                ids.len(),
                vectors.len(),
                metadata.as_ref().map_or(ids.len(), Vec::len)
            )));
        }
        let mut metadata = metadata.map(|m| m.into_iter());
        let mut core = self.shared.core.write();
        if core.store.dimension().is_none() {
            if let Some(first) = vectors.first() {
                record::validate_vector(first)?;
            }
        }

        let mut dimension = core.store.dimension();
        let mut seen_new: HashSet<&str> = HashSet::new();
        let mut verdicts: Vec<Result<()>> = Vec::with_capacity(ids.len());
        let mut accepted = Vec::new();
        for (id, vector) in ids.iter().zip(vectors) {
            let id = id.as_ref();
            let meta = metadata.as_mut().and_then(Iterator::next).unwrap_or_default();
            let is_new = !core.store.contains(id) && !seen_new.contains(id);
            let verdict = core.admit(id, vector, dimension, is_new, seen_new.len(), accepted.len());
            if verdict.is_ok() {
                dimension.get_or_insert(vector.len());
                if is_new {
                    seen_new.insert(id);
                }
                accepted.push((id.to_owned(), vector.clone(), meta));
            }
            verdicts.push(verdict);
        }

        if !accepted.is_empty() {
            self.log_with(|| WalEntry::AddBatch {
                items: accepted.clone(),
            })?;
        }
        let mut inserted = core.apply_batch(accepted)?.into_iter();
        let results = ids
            .iter()
            .zip(verdicts)
            .map(|(id, verdict)| {
                let result = verdict.map(|_| inserted.next().unwrap_or(false));
                (id.as_ref().to_owned(), result)
            })
            .collect();
        Ok(BatchOutcome { results })
    }

    pub fn search(&self, query: &[f32], k: usize, filter: Option<&Filter>) -> Result<SearchResponse> {
        self.shared.core.read().search(query, k, filter, None, false)
    }

    pub fn search_with(&self, query: &[f32], options: &SearchOptions) -> Result<SearchResponse> {
        self.shared.core.read().search(
            query,
            options.k,
            options.filter.as_ref(),
            options.ef,
            options.include_vectors,
        )
    }

    /// Tombstone `id`. Returns `false` if it was unknown.
    pub fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.delete_batch(&[id])?[0])
    }

    pub fn delete_batch<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<bool>> {
        let ids: Vec<String> = ids.iter().map(|s| s.as_ref().to_owned()).collect();
        let mut core = self.shared.core.write();
        if !ids.iter().any(|id| core.store.contains(id)) {
            return Ok(vec![false; ids.len()]);
        }
        self.log_with(|| WalEntry::Delete { ids: ids.clone() })?;
        Ok(core.apply_delete(&ids))
    }

    /// The vector and metadata of `id`. For a quantized slot without a
    /// retained raw copy the vector is the codec's reconstruction.
    pub fn get(&self, id: &str) -> Option<(Vec<f32>, Metadata)> {
        self.shared.core.read().store.get(id)
    }

    pub fn get_record(&self, id: &str) -> Option<VectorRecord> {
        self.get(id).map(|(vector, metadata)| VectorRecord {
            id: id.to_owned(),
            vector,
            metadata,
        })
    }

    pub fn exists(&self, id: &str) -> bool {
        self.shared.core.read().store.contains(id)
    }

    pub fn count(&self) -> usize {
        self.shared.core.read().store.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Live ids in insertion (slot) order.
    pub fn list_ids(&self, offset: usize, limit: usize) -> Vec<String> {
        self.shared.core.read().store.ids(offset, limit)
    }

    pub fn dimension(&self) -> Option<usize> {
        self.shared.core.read().store.dimension()
    }

    pub fn config(&self) -> IndexConfig {
        self.shared.core.read().config.clone()
    }

    pub fn state(&self) -> IndexState {
        IndexState::of(self.shared.core.read().graph.as_ref())
    }

    /// Drop every vector and return to the initial state, releasing memory.
    /// A running scheduled migration is cancelled.
    pub fn clear(&self) -> Result<()> {
        let mut core = self.shared.core.write();
        self.log_with(|| WalEntry::Clear)?;
        core.apply_clear();
        Ok(())
    }

    /// Physically drop tombstoned slots and repair the graph. Returns the
    /// number of slots reclaimed.
    pub fn compact(&self) -> Result<usize> {
        let mut core = self.shared.core.write();
        if core.store.tombstone_count() == 0 {
            return Ok(0);
        }
        self.log_with(|| WalEntry::Compact)?;
        Ok(core.apply_compact())
    }

    /// Promote the flat buffer to the target graph now, regardless of the
    /// threshold, and lift a suspension left by a failed migration.
    pub fn flush(&self) -> Result<()> {
        self.flush_with(CancelToken::new())
    }

    /// [`flush`](Self::flush) that another thread can stop through `token`.
    /// A cancelled build leaves the index flat, like a timed-out one.
    pub fn flush_with(&self, token: CancelToken) -> Result<()> {
        let mut core = self.shared.core.write();
        core.auto_migration_suspended = false;
        let due = core.config.algorithm == Algorithm::Auto
            && core.graph.is_none()
            && core.active.is_none()
            && core.store.live_count() > 0;
        if due {
            core.migrate_now(token)?;
        }
        Ok(())
    }

    /// Build the target graph on a background thread while the flat view
    /// keeps serving. The graph is swapped in under the write lock after the
    /// vectors added in the meantime are caught up.
    pub fn schedule_migration(&self) -> Result<MigrationHandle> {
        let mut core = self.shared.core.write();
        if core.config.algorithm == Algorithm::Flat {
            return Err(IndexError::InvalidConfig(
                "a flat index never migrates".into(),
            ));
        }
        if core.graph.is_some() {
            let live = core.store.live_count();
            return Ok(MigrationHandle::finished(
                MigrationStatus::Completed {
                    vectors: live,
                    elapsed_ms: 0,
                },
                live,
            ));
        }
        if core.active.is_some() {
            return Err(IndexError::CapacityExceeded(
                "a migration is already running".into(),
            ));
        }

        let snapshot = core.store.clone();
        let config = core.config.clone();
        let epoch = core.epoch;
        let shared = Arc::clone(&self.shared);
        let (handle, migration) = MigrationHandle::spawn(snapshot.slot_count(), CancelToken::new(), move |m| {
            run_scheduled(&shared, snapshot, config, m)
        })?;
        core.active = Some(ActiveMigration {
            epoch,
            shared: migration,
            pending: 0,
        });
        tracing::debug!(epoch, "scheduled migration started");
        Ok(handle)
    }

    /// Train and calibrate `kind` on the live vectors and use it for future
    /// inserts. Stored vectors are untouched until [`reencode`](Self::reencode).
    pub fn enable_quantization(&self, kind: QuantizationKind) -> Result<CalibrationReport> {
        let (quantizer, report) = self.calibrate(kind)?;
        if !report.within_tolerance {
            tracing::warn!(
                "refusing {} quantization: recall@{} dropped {:.2} points (tolerance {:.2})",
                kind.as_str(),
                report.k,
                report.degradation_points,
                report.tolerance_points
            );
            return Err(IndexError::CalibrationFailed {
                k: report.k,
                degradation: report.degradation_points,
                tolerance: report.tolerance_points,
            });
        }
        let mut core = self.shared.core.write();
        let retain_raw = core.config.quantization.retain_raw;
        self.log_with(|| WalEntry::EnableQuantization {
            quantizer: quantizer.clone(),
            retain_raw,
        })?;
        core.apply_enable_quantization(quantizer, retain_raw);
        core.calibration = Some(report.clone());
        tracing::info!(
            "enabled {} quantization ({:.1}x, recall@{} {:.1}%)",
            kind.as_str(),
            report.compression_ratio,
            report.k,
            report.quantized_recall
        );
        Ok(report)
    }

    /// Measure `kind` without installing it.
    pub fn calibrate_quantization(&self, kind: QuantizationKind) -> Result<CalibrationReport> {
        self.calibrate(kind).map(|(_, report)| report)
    }

    fn calibrate(&self, kind: QuantizationKind) -> Result<(Quantizer, CalibrationReport)> {
        let core = self.shared.core.read();
        let dim = match core.store.dimension() {
            Some(dim) if core.store.live_count() > 0 => dim,
            _ => {
                return Err(IndexError::InvalidConfig(
                    "quantization needs stored vectors to train on".into(),
                ))
            }
        };
        let (arena, _) = core.store.live_arena();
        let metric = core.store.metric();
        let settings = core.config.quantization.clone();
        let seed = core.config.seed;
        drop(core);
        quantization::calibrate(kind, metric, &arena, dim, &settings, seed)
    }

    /// Decode every slot back to `f32` and drop the codec. Returns `false`
    /// when quantization was not enabled.
    pub fn disable_quantization(&self) -> Result<bool> {
        let mut core = self.shared.core.write();
        if core.store.quantizer().is_none() {
            return Ok(false);
        }
        self.log_with(|| WalEntry::DisableQuantization)?;
        Ok(core.apply_disable_quantization())
    }

    /// Rewrite stored vectors with the current codec. Returns the number of
    /// slots rewritten.
    pub fn reencode(&self) -> Result<usize> {
        let mut core = self.shared.core.write();
        if core.store.quantizer().is_none() {
            return Ok(0);
        }
        self.log_with(|| WalEntry::Reencode)?;
        Ok(core.apply_reencode())
    }

    /// Capacity-based estimate of heap bytes held by vectors, metadata and graph.
    pub fn memory_usage(&self) -> usize {
        self.shared.core.read().memory_usage()
    }

    pub fn info(&self) -> IndexInfo {
        let core = self.shared.core.read();
        let migration = core.active.as_ref().map(|a| MigrationProgress {
            processed: a.shared.processed.load(Ordering::Acquire),
            total: a.shared.total.load(Ordering::Acquire),
        });
        IndexInfo {
            vector_count: core.store.live_count(),
            slot_count: core.store.slot_count(),
            tombstone_count: core.store.tombstone_count(),
            dimension: core.store.dimension(),
            metric: core.store.metric(),
            algorithm: core.config.algorithm,
            status: IndexState::of(core.graph.as_ref()),
            migration,
            auto_migration_suspended: core.auto_migration_suspended,
            last_migration_error: core.last_migration_error.clone(),
            quantization: core.store.quantizer().map(Quantizer::kind),
            calibration: core.calibration.clone(),
            memory_bytes: core.memory_usage(),
            path: self.shared.storage.as_ref().map(|s| s.dir().to_path_buf()),
            generation: self.shared.storage.as_ref().map_or(0, PersistenceManager::generation),
            segments: self.shared.storage.as_ref().map_or(0, PersistenceManager::segment_count),
        }
    }

    /// Persist a new generation. Returns `false` for an in-memory index or
    /// when nothing changed since the last checkpoint.
    pub fn checkpoint(&self) -> Result<bool> {
        Ok(self.checkpoint_with(CheckpointOptions::default())?.is_some())
    }

    pub fn checkpoint_with(&self, options: CheckpointOptions) -> Result<Option<CheckpointReport>> {
        let Some(storage) = &self.shared.storage else {
            return Ok(None);
        };
        let _gate = storage.checkpoint_gate();
        let (segment, max_segments, timeout) = {
            let mut core = self.shared.core.write();
            if !core.dirty && !options.force_full && storage.has_base() {
                return Ok(None);
            }
            let generation = storage.begin()?;
            let full = options.force_full || core.needs_full || !storage.has_base();
            let core = &mut *core;
            let segment = if full {
                if let Some(graph) = core.graph.as_mut() {
                    graph.take_dirty();
                }
                core.unsaved_tombstones.clear();
                Segment::full(generation, &core.config, &core.store, core.graph.as_ref())
            } else {
                let changed = core.graph.as_mut().map(GraphIndex::take_dirty).unwrap_or_default();
                let tombstones = std::mem::take(&mut core.unsaved_tombstones).into_iter().collect();
                Segment::delta(
                    generation,
                    &core.config,
                    &core.store,
                    core.graph.as_ref(),
                    core.persisted_slots as u32,
                    tombstones,
                    changed,
                )
            };
            core.persisted_slots = core.store.slot_count();
            core.needs_full = false;
            core.dirty = false;
            (
                segment,
                core.config.max_segments,
                options.timeout.or(core.config.checkpoint_timeout()),
            )
        };

        let budget = WorkBudget::new(options.token.unwrap_or_default(), timeout);
        match storage.commit(segment, max_segments, &budget) {
            Ok(report) => {
                if report.merged {
                    // The merge renumbered slots on disk.
                    self.shared.core.write().needs_full = true;
                }
                Ok(Some(report))
            }
            Err(e) => {
                tracing::warn!("checkpoint failed, previous generation kept: {}", e);
                let mut core = self.shared.core.write();
                core.needs_full = true;
                core.dirty = true;
                Err(e)
            }
        }
    }

    /// Check store and graph invariants.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let core = self.shared.core.read();
        core.store.validate()?;
        if let Some(graph) = &core.graph {
            if graph.len() != core.store.slot_count() {
                return Err(format!(
                    "graph holds {} nodes for {} slots",
                    graph.len(),
                    core.store.slot_count()
                ));
            }
            graph.validate()?;
        }
        Ok(())
    }
}

/// Body of a scheduled migration's worker thread.
fn run_scheduled(
    shared: &Shared,
    snapshot: VectorStore,
    config: IndexConfig,
    migration: &MigrationShared,
) -> MigrationStatus {
    let started = Instant::now();
    let budget = WorkBudget::new(migration.token.clone(), config.migration_timeout());
    let built = migration::build_graph(
        &snapshot,
        config.target,
        &config,
        &budget,
        Some(&migration.processed),
    );
    drop(snapshot);

    let mut core = shared.core.write();
    // Epoch the snapshot was taken at, if this is still the active migration.
    let snapshot_epoch = core
        .active
        .as_ref()
        .filter(|a| std::ptr::eq(Arc::as_ptr(&a.shared), migration))
        .map(|a| a.epoch);
    let ours = snapshot_epoch.is_some();
    if ours {
        core.active = None;
    }
    let mut graph = match built {
        Ok(graph) => graph,
        Err(e) => {
            tracing::warn!("scheduled migration stopped: {}", e);
            if ours {
                core.last_migration_error = Some(e.to_string());
            }
            return MigrationStatus::from_error(&e);
        }
    };
    if migration.token.is_cancelled() {
        return MigrationStatus::Cancelled;
    }
    if snapshot_epoch != Some(core.epoch) || core.graph.is_some() {
        tracing::info!("scheduled migration superseded, graph discarded");
        return MigrationStatus::Superseded;
    }
    let caught_up = graph.catch_up(&core.store);
    core.install_graph(graph);
    let vectors = core.store.live_count();
    migration.total.store(core.store.slot_count(), Ordering::Release);
    migration.processed.store(core.store.slot_count(), Ordering::Release);
    let elapsed_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        "scheduled migration to {} finished: {} vectors ({} caught up) in {} ms",
        IndexState::of(core.graph.as_ref()).as_str(),
        vectors,
        caught_up,
        elapsed_ms
    );
    MigrationStatus::Completed {
        vectors,
        elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantizationSettings;
    use crate::filter::Condition;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn point(i: usize) -> Vec<f32> {
        vec![i as f32, (i % 7) as f32, (i % 3) as f32, 1.0]
    }

    fn l2(threshold: usize) -> IndexConfig {
        IndexConfig::default()
            .with_metric(DistanceMetric::L2)
            .with_migration_threshold(threshold)
    }

    fn filled(config: IndexConfig, n: usize) -> VectorIndex {
        let index = VectorIndex::new(config).unwrap();
        for i in 0..n {
            index.add(&format!("v{i}"), &point(i), None).unwrap();
        }
        index
    }

    #[test]
    fn test_add_get_and_upsert() {
        let index = VectorIndex::new(IndexConfig::default()).unwrap();
        let mut meta = Metadata::new();
        meta.insert("lang".into(), "en".into());
        assert!(index.add("a", &[0.5, -2.0, 3.25], Some(meta.clone())).unwrap());
        let (vector, got) = index.get("a").unwrap();
        assert_eq!(vector, vec![0.5, -2.0, 3.25]);
        assert_eq!(got, meta);

        assert!(!index.add("a", &[1.0, 1.0, 1.0], None).unwrap());
        assert_eq!(index.count(), 1);
        assert_eq!(index.info().tombstone_count, 1);
        assert_eq!(index.get("a").unwrap().0, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_dimension_mismatch_leaves_index_untouched() {
        let index = filled(l2(1_000), 5);
        let err = index.add("bad", &[1.0, 2.0], None).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        ));
        assert_eq!(index.count(), 5);
        assert!(!index.exists("bad"));
    }

    #[test]
    fn test_invalid_vector_and_id_rejected() {
        let index = VectorIndex::new(IndexConfig::default()).unwrap();
        assert!(matches!(
            index.add("x", &[f32::NAN, 1.0], None),
            Err(IndexError::InvalidVector(_))
        ));
        assert!(matches!(index.add("", &[1.0], None), Err(IndexError::InvalidId(_))));
        assert!(index.is_empty());
        assert_eq!(index.dimension(), None);
    }

    #[test]
    fn test_crossing_threshold_migrates_and_keeps_every_vector() {
        let index = filled(l2(50), 49);
        assert_eq!(index.state(), IndexState::FlatBuffer);
        index.add("v49", &point(49), None).unwrap();
        assert_eq!(index.state(), IndexState::GraphHnsw);
        for i in (0..50).step_by(7) {
            let hits = index.search(&point(i), 1, None).unwrap();
            assert_eq!(hits.ids(), vec![format!("v{i}").as_str()]);
        }
        index.validate().unwrap();
    }

    #[test]
    fn test_flat_search_is_exact_and_sorted() {
        let index = filled(l2(1_000), 40);
        let response = index.search(&[10.2, 3.0, 1.0, 1.0], 5, None).unwrap();
        assert_eq!(response.confidence, Confidence::Exact);
        assert_eq!(response.hits[0].id, "v10");
        assert!(response.hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_forced_diskann_is_a_graph_from_the_start() {
        let index = filled(l2(1_000).with_algorithm(Algorithm::DiskAnn), 30);
        assert_eq!(index.state(), IndexState::GraphDiskAnn);
        let hits = index.search(&point(17), 3, None).unwrap();
        assert_eq!(hits.hits[0].id, "v17");
        index.validate().unwrap();
    }

    #[test]
    fn test_flat_algorithm_never_migrates() {
        let index = filled(l2(10).with_algorithm(Algorithm::Flat), 30);
        index.flush().unwrap();
        assert_eq!(index.state(), IndexState::FlatBuffer);
        assert!(matches!(
            index.schedule_migration(),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_flush_migrates_below_threshold() {
        let index = filled(l2(1_000).with_target(GraphAlgorithm::DiskAnn), 20);
        index.flush().unwrap();
        assert_eq!(index.state(), IndexState::GraphDiskAnn);
    }

    #[test]
    fn test_timed_out_migration_stays_flat_until_flush() {
        let config = l2(10).with_migration_timeout(Duration::ZERO);
        let index = filled(config, 15);
        let info = index.info();
        assert_eq!(info.status, IndexState::FlatBuffer);
        assert!(info.auto_migration_suspended);
        assert!(info.last_migration_error.is_some());
        assert_eq!(index.count(), 15);
        assert!(matches!(index.flush(), Err(IndexError::Timeout(_))));
        assert_eq!(index.search(&point(3), 1, None).unwrap().hits[0].id, "v3");
    }

    #[test]
    fn test_cancelled_flush_stays_flat() {
        let index = filled(l2(100_000), 300);
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(index.flush_with(token), Err(IndexError::Cancelled)));
        let info = index.info();
        assert_eq!(info.status, IndexState::FlatBuffer);
        assert!(info.last_migration_error.is_some());
        assert_eq!(index.search(&point(42), 1, None).unwrap().hits[0].id, "v42");

        index.flush().unwrap();
        assert_eq!(index.state(), IndexState::GraphHnsw);
        assert!(index.info().last_migration_error.is_none());
    }

    #[test]
    fn test_default_sync_migration_is_time_bounded() {
        let index = filled(l2(10), 15);
        assert_eq!(index.state(), IndexState::GraphHnsw);
        assert!(index.config().migration_timeout().is_some());
    }

    #[test]
    fn test_scheduled_migration_catches_up_late_adds() {
        let index = filled(l2(100_000), 600);
        let handle = index.schedule_migration().unwrap();
        for i in 600..620 {
            index.add(&format!("v{i}"), &point(i), None).unwrap();
        }
        let status = handle.wait(None);
        assert!(matches!(status, MigrationStatus::Completed { .. }), "{status:?}");
        assert_eq!(index.state(), IndexState::GraphHnsw);
        assert_eq!(index.count(), 620);
        assert_eq!(index.search(&point(615), 1, None).unwrap().hits[0].id, "v615");
        index.validate().unwrap();
    }

    #[test]
    fn test_clear_supersedes_scheduled_migration() {
        let index = filled(l2(100_000), 2_000);
        let handle = index.schedule_migration().unwrap();
        index.clear().unwrap();
        let status = handle.wait(None);
        assert!(
            matches!(status, MigrationStatus::Cancelled | MigrationStatus::Superseded),
            "{status:?}"
        );
        assert_eq!(index.state(), IndexState::FlatBuffer);
        assert!(index.is_empty());
    }

    #[test]
    fn test_compaction_supersedes_scheduled_migration() {
        let index = filled(l2(100_000), 3_000);
        let handle = index.schedule_migration().unwrap();
        index.delete("v1").unwrap();
        assert_eq!(index.compact().unwrap(), 1);
        assert_eq!(handle.wait(None), MigrationStatus::Superseded);
        assert_eq!(index.state(), IndexState::FlatBuffer);
        assert_eq!(index.count(), 2_999);
        assert!(index.info().last_migration_error.is_none());
    }

    #[test]
    fn test_batch_reports_items_individually() {
        let index = filled(l2(1_000), 2);
        let ids = ["v0", "new", "bad", ""];
        let vectors = vec![point(9), point(10), vec![1.0], point(11)];
        let outcome = index.add_batch(&ids, &vectors, None).unwrap();
        assert_eq!(outcome.committed(), vec!["v0", "new"]);
        assert_eq!(outcome.inserted(), 1);
        assert_eq!(outcome.updated(), 1);
        let failed = outcome.failed();
        assert!(matches!(failed[0], ("bad", IndexError::DimensionMismatch { .. })));
        assert!(matches!(failed[1], ("", IndexError::InvalidId(_))));
        assert_eq!(index.count(), 3);
    }

    #[test]
    fn test_batch_argument_mismatch_aborts() {
        let index = VectorIndex::new(IndexConfig::default()).unwrap();
        let err = index.add_batch(&["a", "b"], &[vec![1.0]], None).unwrap_err();
        assert!(matches!(err, IndexError::InvalidVector(_)));
        let err = index
            .add_batch(&["a"], &[vec![f32::INFINITY]], None)
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidVector(_)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_max_vectors_is_enforced() {
        let index = filled(l2(1_000).with_max_vectors(3), 3);
        assert!(matches!(
            index.add("v3", &point(3), None),
            Err(IndexError::CapacityExceeded(_))
        ));
        assert!(!index.add("v1", &point(1), None).unwrap());
    }

    #[test]
    fn test_delete_and_compact() {
        let index = filled(l2(10), 30);
        assert!(index.delete("v3").unwrap());
        assert!(!index.delete("v3").unwrap());
        assert_eq!(index.delete_batch(&["v4", "missing", "v4"]).unwrap(), vec![true, false, false]);
        assert_eq!(index.count(), 28);
        let hits = index.search(&point(3), 30, None).unwrap();
        assert!(!hits.ids().contains(&"v3"));

        assert_eq!(index.compact().unwrap(), 2);
        assert_eq!(index.info().tombstone_count, 0);
        assert_eq!(index.search(&point(20), 1, None).unwrap().hits[0].id, "v20");
        index.validate().unwrap();
    }

    #[test]
    fn test_filtered_search() {
        let index = VectorIndex::new(l2(1_000)).unwrap();
        for i in 0..20 {
            let mut m = Metadata::new();
            m.insert("parity".into(), if i % 2 == 0 { "even" } else { "odd" }.into());
            index.add(&format!("v{i}"), &point(i), Some(m)).unwrap();
        }
        let filter = Filter::new().must(Condition::Eq("parity".into(), "odd".into()));
        let hits = index.search(&point(4), 3, Some(&filter)).unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.hits.iter().all(|h| h.metadata["parity"] == "odd"));
    }

    #[test]
    fn test_search_limits() {
        let index = filled(l2(1_000), 3);
        assert!(index.search(&point(0), 0, None).unwrap().is_empty());
        assert!(matches!(
            index.search(&point(0), config::MAX_K + 1, None),
            Err(IndexError::InvalidConfig(_))
        ));
        let opts = SearchOptions::new(10).with_vectors();
        let response = index.search_with(&point(1), &opts).unwrap();
        assert_eq!(response.len(), 3);
        assert_eq!(response.hits[0].vector.as_deref(), Some(point(1).as_slice()));
    }

    #[test]
    fn test_clear_releases_memory() {
        let index = filled(l2(100), 500);
        let loaded = index.memory_usage();
        index.clear().unwrap();
        assert!(index.memory_usage() < loaded / 10);
        assert_eq!(index.state(), IndexState::FlatBuffer);
        assert_eq!(index.dimension(), None);
        index.add("z", &[1.0, 2.0], None).unwrap();
        assert_eq!(index.dimension(), Some(2));
    }

    #[test]
    fn test_enable_quantization_is_not_retroactive() {
        let mut settings = QuantizationSettings::default();
        settings.tolerance_points = 20.0;
        let index = VectorIndex::new(IndexConfig::default().with_quantization(settings)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..300 {
            let v: Vec<f32> = (0..16).map(|_| rng.gen::<f32>()).collect();
            index.add(&format!("v{i}"), &v, None).unwrap();
        }
        let before = index.get("v5").unwrap().0;
        let report = index.enable_quantization(QuantizationKind::Scalar).unwrap();
        assert!(report.within_tolerance);
        assert_eq!(index.info().quantization, Some(QuantizationKind::Scalar));
        assert_eq!(index.get("v5").unwrap().0, before);

        assert_eq!(index.reencode().unwrap(), 300);
        let after = index.get("v5").unwrap().0;
        assert!(before.iter().zip(&after).all(|(a, b)| (a - b).abs() < 0.02));
        assert!(index.disable_quantization().unwrap());
        assert!(!index.disable_quantization().unwrap());
    }

    #[test]
    fn test_switching_codecs_keeps_stored_vectors() {
        let mut settings = QuantizationSettings::default();
        settings.tolerance_points = 100.0;
        let index = VectorIndex::new(IndexConfig::default().with_quantization(settings)).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let vectors: Vec<Vec<f32>> = (0..300)
            .map(|_| (0..16).map(|_| rng.gen::<f32>()).collect())
            .collect();
        for (i, v) in vectors.iter().enumerate() {
            index.add(&format!("v{i}"), v, None).unwrap();
        }
        let close = |a: &[f32], b: &[f32]| a.iter().zip(b).all(|(x, y)| (x - y).abs() < 0.02);

        index.enable_quantization(QuantizationKind::Scalar).unwrap();
        assert_eq!(index.reencode().unwrap(), 300);
        assert!(close(&index.get("v5").unwrap().0, &vectors[5]));

        index.enable_quantization(QuantizationKind::Binary).unwrap();
        assert!(close(&index.get("v5").unwrap().0, &vectors[5]));
        index.add("late", &vectors[7], None).unwrap();

        index
            .enable_quantization(QuantizationKind::Product { subspaces: 8 })
            .unwrap();
        assert_eq!(index.info().quantization, Some(QuantizationKind::Product { subspaces: 8 }));
        assert!(close(&index.get("v5").unwrap().0, &vectors[5]));
        let hits = index.search(&vectors[5], 1, None).unwrap();
        assert_eq!(hits.ids(), vec!["v5"]);
        index.validate().unwrap();
    }

    #[test]
    fn test_quantization_needs_vectors() {
        let index = VectorIndex::new(IndexConfig::default()).unwrap();
        assert!(matches!(
            index.enable_quantization(QuantizationKind::Binary),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_in_memory_checkpoint_is_a_no_op() {
        let index = filled(l2(1_000), 3);
        assert!(!index.checkpoint().unwrap());
        assert!(index.info().path.is_none());
    }

    #[test]
    fn test_list_ids_in_insertion_order() {
        let index = filled(l2(1_000), 6);
        index.delete("v1").unwrap();
        assert_eq!(index.list_ids(1, 3), vec!["v2", "v3", "v4"]);
    }
}
