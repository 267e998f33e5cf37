//! On-disk persistence: segments, the manifest, the write-ahead log.
//!
//! A storage directory holds:
//!
//! - `MANIFEST`: JSON naming the current generation and its live segments
//! - `seg-<generation>.hseg`: one full segment followed by zero or more deltas
//! - `wal-<generation>.log`: mutations not yet covered by the segments
//! - `LOCK`: held by the one instance that has the directory open
//!
//! A checkpoint snapshots the index under its write lock, rotates the WAL,
//! then writes the segment and swaps the manifest with the lock released.
//! Old segments and logs are deleted only after the manifest swap, so a
//! failed checkpoint leaves the previous generation intact.

pub mod manifest;
pub mod merge;
pub mod segment;
pub mod wal;

pub use manifest::{segment_file_name, Manifest, SegmentRef};
pub use merge::merge_segments;
pub use segment::{GraphBlock, Segment, SegmentHeader, SegmentKind};
pub use wal::{ReplayStats, WalEntry, WriteAheadLog};

use crate::cancel::{CancelToken, WorkBudget};
use crate::error::{IndexError, Result};
use merge::Restored;
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const LOCK_FILE: &str = "LOCK";

/// Knobs for a single checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    pub token: Option<CancelToken>,
    /// Overrides the configured checkpoint timeout.
    pub timeout: Option<Duration>,
    /// Write a full segment even when a delta would do.
    pub force_full: bool,
}

impl CheckpointOptions {
    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn full(mut self) -> Self {
        self.force_full = true;
        self
    }
}

/// What a successful checkpoint wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointReport {
    pub generation: u64,
    pub kind: SegmentKind,
    /// Whether live segments were merged into one full segment.
    pub merged: bool,
    pub bytes: u64,
    pub live_vectors: usize,
    pub segments: usize,
    pub elapsed_ms: u64,
}

/// Exclusive ownership of a storage directory, released on drop.
#[derive(Debug)]
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        match Self::create(&path) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && owner_is_gone(&path) => {
                tracing::warn!("removing stale lock {:?} left by a dead process", path);
                fs::remove_file(&path)?;
                Self::create(&path).map_err(|e| Self::map_err(dir, e))
            }
            other => other.map_err(|e| Self::map_err(dir, e)),
        }
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn map_err(dir: &Path, e: io::Error) -> IndexError {
        if e.kind() == io::ErrorKind::AlreadyExists {
            IndexError::Locked(dir.display().to_string())
        } else {
            e.into()
        }
    }
}

/// Whether the pid recorded in a lock file names a process that no longer
/// runs. Only decidable where `/proc` exists; elsewhere locks are never stale.
fn owner_is_gone(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return false;
    };
    if pid == std::process::id() {
        return false;
    }
    let proc = Path::new("/proc");
    proc.is_dir() && !proc.join(pid.to_string()).exists()
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("failed to release {:?}: {}", self.path, e);
        }
    }
}

/// State recovered by [`PersistenceManager::open`].
#[derive(Debug)]
pub(crate) struct Recovered {
    pub restored: Option<Restored>,
    pub wal: Vec<WalEntry>,
    pub stats: ReplayStats,
}

#[derive(Debug)]
pub struct PersistenceManager {
    dir: PathBuf,
    manifest: Mutex<Option<Manifest>>,
    wal: Option<WriteAheadLog>,
    next_generation: AtomicU64,
    checkpoint_gate: Mutex<()>,
    _lock: DirLock,
}

impl PersistenceManager {
    /// Lock `dir`, load the manifest chain and read the WAL tail.
    pub(crate) fn open(dir: &Path, wal_enabled: bool) -> Result<(Self, Recovered)> {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
        }
        let lock = DirLock::acquire(dir)?;

        let manifest = Manifest::load(dir)?;
        let mut segments = Vec::new();
        for r in manifest.iter().flat_map(|m| m.segments.iter()) {
            let path = dir.join(&r.file);
            let segment = Segment::read(&path).map_err(|e| match e {
                IndexError::Io(err) if err.kind() == io::ErrorKind::NotFound => {
                    IndexError::corrupt(&path, "segment listed in the manifest is missing")
                }
                other => other,
            })?;
            if segment.generation() != r.generation {
                return Err(IndexError::corrupt(
                    &path,
                    format!(
                        "segment generation {} differs from manifest entry {}",
                        segment.generation(),
                        r.generation
                    ),
                ));
            }
            segments.push((path, segment));
        }
        let restored = merge::fold_segments(segments)?;

        let base = manifest.as_ref().map_or(0, |m| m.generation);
        let (entries, stats) = wal::replay_from(dir, base)?;
        let newest_wal = wal::list_wal_files(dir)?
            .last()
            .map_or(0, |(gen, _)| *gen);
        let wal_generation = base.max(newest_wal) + 1;
        let wal = if wal_enabled {
            Some(WriteAheadLog::open(dir, wal_generation)?)
        } else {
            None
        };

        tracing::info!(
            "opened {:?}: generation {}, {} segment(s), {} WAL entries to replay",
            dir,
            base,
            manifest.as_ref().map_or(0, |m| m.segments.len()),
            entries.len()
        );
        Ok((
            Self {
                dir: dir.to_path_buf(),
                manifest: Mutex::new(manifest),
                wal,
                next_generation: AtomicU64::new(wal_generation + 1),
                checkpoint_gate: Mutex::new(()),
                _lock: lock,
            },
            Recovered {
                restored,
                wal: entries,
                stats,
            },
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generation of the last successful checkpoint (0 if none).
    pub fn generation(&self) -> u64 {
        self.manifest.lock().as_ref().map_or(0, |m| m.generation)
    }

    pub fn segment_count(&self) -> usize {
        self.manifest.lock().as_ref().map_or(0, |m| m.segments.len())
    }

    pub fn has_base(&self) -> bool {
        self.segment_count() > 0
    }

    pub fn wal_enabled(&self) -> bool {
        self.wal.is_some()
    }

    /// Log a mutation. A no-op when the WAL is disabled.
    pub fn log(&self, entry: &WalEntry) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.append(entry)?;
        }
        Ok(())
    }

    /// Serializes checkpoints; hold it from [`begin`](Self::begin) through [`commit`](Self::commit).
    pub(crate) fn checkpoint_gate(&self) -> MutexGuard<'_, ()> {
        self.checkpoint_gate.lock()
    }

    /// Claim the next generation and route new WAL appends to it. Must be
    /// called under the index write lock, right before the snapshot is taken.
    pub(crate) fn begin(&self) -> Result<u64> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(wal) = &self.wal {
            wal.rotate(generation)?;
        }
        Ok(generation)
    }

    /// Write `segment`, then publish it in a new manifest. A delta that would
    /// push the segment count past `max_segments` is merged with the live
    /// segments into one full segment first.
    pub(crate) fn commit(
        &self,
        segment: Segment,
        max_segments: usize,
        budget: &WorkBudget,
    ) -> Result<CheckpointReport> {
        let started = Instant::now();
        let generation = segment.generation();
        let mut refs = match segment.kind() {
            SegmentKind::Full => Vec::new(),
            SegmentKind::Delta => self
                .manifest
                .lock()
                .as_ref()
                .map(|m| m.segments.clone())
                .ok_or_else(|| {
                    IndexError::InvalidConfig("delta checkpoint without a base segment".into())
                })?,
        };

        let mut merged = false;
        let segment = if segment.kind() == SegmentKind::Delta && refs.len() + 1 > max_segments {
            let mut chain = Vec::with_capacity(refs.len() + 1);
            for r in &refs {
                budget.check()?;
                chain.push(Segment::read(&self.dir.join(&r.file))?);
            }
            chain.push(segment);
            refs.clear();
            merged = true;
            merge_segments(chain, generation)?
        } else {
            segment
        };

        budget.check()?;
        let path = self.dir.join(segment_file_name(generation));
        let bytes = segment.write(&path, budget)?;
        refs.push(SegmentRef {
            file: segment_file_name(generation),
            generation,
            kind: segment.kind(),
            slot_count: segment.header.slot_count,
            live_count: segment.header.live_count,
            bytes,
        });
        let manifest = Manifest::new(generation, refs);
        if let Err(e) = budget.check().and_then(|_| manifest.store(&self.dir)) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        let segments = manifest.segments.len();
        *self.manifest.lock() = Some(manifest.clone());
        self.collect_garbage(&manifest);

        let report = CheckpointReport {
            generation,
            kind: segment.kind(),
            merged,
            bytes,
            live_vectors: segment.header.live_count,
            segments,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "checkpoint generation {} written ({:?}, {} bytes, {} live vectors, {} segment(s){})",
            generation,
            report.kind,
            bytes,
            report.live_vectors,
            segments,
            if merged { ", merged" } else { "" }
        );
        Ok(report)
    }

    /// Delete segments the manifest no longer names and logs it covers.
    fn collect_garbage(&self, manifest: &Manifest) {
        let keep: Vec<&str> = manifest.segments.iter().map(|r| r.file.as_str()).collect();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("segment cleanup skipped: {}", e);
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let is_segment = name.starts_with("seg-")
                && (name.ends_with(".hseg") || name.ends_with(".hseg.tmp"));
            if is_segment && !keep.contains(&name) {
                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::warn!("failed to remove stale segment {}: {}", name, e);
                }
            }
        }
        let removed = match &self.wal {
            Some(wal) => wal.remove_before(manifest.generation),
            None => remove_logs_before(&self.dir, manifest.generation),
        };
        if let Err(e) = removed {
            tracing::warn!("WAL cleanup failed: {}", e);
        }
    }
}

fn remove_logs_before(dir: &Path, generation: u64) -> io::Result<usize> {
    let mut removed = 0;
    for (gen, path) in wal::list_wal_files(dir)? {
        if gen < generation {
            fs::remove_file(path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::distance::DistanceMetric;
    use crate::record::Metadata;
    use crate::store::VectorStore;

    fn store(n: usize) -> VectorStore {
        let mut s = VectorStore::new(None, DistanceMetric::Cosine);
        for i in 0..n {
            s.insert(&format!("v{i}"), vec![1.0, i as f32], Metadata::new())
                .unwrap();
        }
        s
    }

    #[test]
    fn test_second_open_of_a_directory_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = PersistenceManager::open(dir.path(), true).unwrap();
        let err = PersistenceManager::open(dir.path(), true).unwrap_err();
        assert!(matches!(err, IndexError::Locked(_)));
        drop(first);
        assert!(PersistenceManager::open(dir.path(), true).is_ok());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_lock_of_a_dead_process_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), format!("{}\n", u32::MAX - 1)).unwrap();
        assert!(PersistenceManager::open(dir.path(), true).is_ok());
    }

    #[test]
    fn test_commit_publishes_and_collects_old_generations() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig::default();
        let (pm, recovered) = PersistenceManager::open(dir.path(), true).unwrap();
        assert!(recovered.restored.is_none());

        let s = store(10);
        let g1 = pm.begin().unwrap();
        pm.commit(Segment::full(g1, &config, &s, None), 4, &WorkBudget::default())
            .unwrap();
        let g2 = pm.begin().unwrap();
        pm.commit(Segment::full(g2, &config, &s, None), 4, &WorkBudget::default())
            .unwrap();

        assert_eq!(pm.generation(), g2);
        assert!(!dir.path().join(segment_file_name(g1)).exists());
        assert!(dir.path().join(segment_file_name(g2)).exists());
        let logs = wal::list_wal_files(dir.path()).unwrap();
        assert!(logs.iter().all(|(gen, _)| *gen >= g2), "{logs:?}");
    }

    #[test]
    fn test_deltas_beyond_the_limit_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig::default();
        let (pm, _) = PersistenceManager::open(dir.path(), false).unwrap();
        let mut s = store(5);
        let g = pm.begin().unwrap();
        pm.commit(Segment::full(g, &config, &s, None), 2, &WorkBudget::default())
            .unwrap();

        s.insert("v5", vec![1.0, 5.0], Metadata::new()).unwrap();
        let g = pm.begin().unwrap();
        let report = pm
            .commit(Segment::delta(g, &config, &s, None, 5, Vec::new(), Vec::new()), 2, &WorkBudget::default())
            .unwrap();
        assert_eq!(report.kind, SegmentKind::Delta);
        assert_eq!(report.segments, 2);

        s.delete("v0");
        s.insert("v6", vec![1.0, 6.0], Metadata::new()).unwrap();
        let g = pm.begin().unwrap();
        let report = pm
            .commit(Segment::delta(g, &config, &s, None, 6, vec![0], Vec::new()), 2, &WorkBudget::default())
            .unwrap();
        assert!(report.merged);
        assert_eq!(report.kind, SegmentKind::Full);
        assert_eq!(report.segments, 1);
        assert_eq!(report.live_vectors, 6);
    }

    #[test]
    fn test_failed_commit_keeps_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig::default();
        let (pm, _) = PersistenceManager::open(dir.path(), true).unwrap();
        let s = store(3);
        let g1 = pm.begin().unwrap();
        pm.commit(Segment::full(g1, &config, &s, None), 4, &WorkBudget::default())
            .unwrap();

        let token = CancelToken::new();
        token.cancel();
        let g2 = pm.begin().unwrap();
        let err = pm
            .commit(Segment::full(g2, &config, &s, None), 4, &WorkBudget::unbounded(token))
            .unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));
        assert_eq!(pm.generation(), g1);
        assert!(dir.path().join(segment_file_name(g1)).exists());
        assert!(Manifest::load(dir.path()).unwrap().is_some());
    }
}
