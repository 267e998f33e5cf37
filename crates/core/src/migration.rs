//! Flat → graph migration.
//!
//! [`build_graph`] constructs a graph over every slot of a store, in chunks,
//! checking the work budget between vectors and publishing progress.
//! Synchronous migration calls it inside the index write lock. Scheduled
//! migration runs it on a background thread against a snapshot of the store;
//! the index then catches the graph up and swaps it in under the write lock.

use crate::cancel::{CancelToken, WorkBudget};
use crate::config::{GraphAlgorithm, IndexConfig};
use crate::error::{IndexError, Result};
use crate::graph::GraphIndex;
use crate::record::Slot;
use crate::store::VectorStore;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Slots inserted between progress updates.
const PROGRESS_CHUNK: usize = 256;

/// Where a scheduled migration stands.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStatus {
    Running,
    Completed { vectors: usize, elapsed_ms: u64 },
    Cancelled,
    TimedOut,
    /// The index was cleared or compacted while the graph was being built;
    /// the result was thrown away.
    Superseded,
    Failed(String),
}

impl MigrationStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, MigrationStatus::Running)
    }

    pub(crate) fn from_error(err: &IndexError) -> Self {
        match err {
            IndexError::Cancelled => MigrationStatus::Cancelled,
            IndexError::Timeout(_) => MigrationStatus::TimedOut,
            other => MigrationStatus::Failed(other.to_string()),
        }
    }
}

/// Slots processed out of the snapshot total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationProgress {
    pub processed: usize,
    pub total: usize,
}

impl MigrationProgress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.processed as f32 / self.total as f32
        }
    }
}

/// State shared between a [`MigrationHandle`] and its worker thread.
#[derive(Debug)]
pub(crate) struct MigrationShared {
    status: Mutex<MigrationStatus>,
    done: Condvar,
    pub(crate) processed: AtomicUsize,
    pub(crate) total: AtomicUsize,
    pub(crate) token: CancelToken,
}

impl MigrationShared {
    fn new(total: usize, token: CancelToken) -> Self {
        Self {
            status: Mutex::new(MigrationStatus::Running),
            done: Condvar::new(),
            processed: AtomicUsize::new(0),
            total: AtomicUsize::new(total),
            token,
        }
    }

    pub(crate) fn finish(&self, status: MigrationStatus) {
        let mut guard = self.status.lock();
        if !guard.is_finished() {
            *guard = status;
        }
        self.done.notify_all();
    }

    pub(crate) fn status(&self) -> MigrationStatus {
        self.status.lock().clone()
    }
}

/// Handle to a migration started with [`VectorIndex::schedule_migration`](crate::VectorIndex::schedule_migration).
///
/// Dropping the handle does not stop the migration.
#[derive(Debug)]
pub struct MigrationHandle {
    shared: Arc<MigrationShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MigrationHandle {
    /// Run `job` on a named background thread. The job's return value becomes
    /// the final status unless the migration already finished.
    pub(crate) fn spawn<F>(total: usize, token: CancelToken, job: F) -> Result<(Self, Arc<MigrationShared>)>
    where
        F: FnOnce(&MigrationShared) -> MigrationStatus + Send + 'static,
    {
        let shared = Arc::new(MigrationShared::new(total, token));
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("hybridann-migration".into())
            .spawn(move || {
                let status = job(&worker);
                worker.finish(status);
            })?;
        Ok((
            Self {
                shared: Arc::clone(&shared),
                thread: Mutex::new(Some(thread)),
            },
            shared,
        ))
    }

    /// A handle for a migration that completed (or was refused) immediately.
    pub(crate) fn finished(status: MigrationStatus, total: usize) -> Self {
        let shared = Arc::new(MigrationShared::new(total, CancelToken::new()));
        shared.processed.store(total, Ordering::Release);
        shared.finish(status);
        Self {
            shared,
            thread: Mutex::new(None),
        }
    }

    pub fn status(&self) -> MigrationStatus {
        self.shared.status()
    }

    pub fn progress(&self) -> MigrationProgress {
        MigrationProgress {
            processed: self.shared.processed.load(Ordering::Acquire),
            total: self.shared.total.load(Ordering::Acquire),
        }
    }

    /// Request cancellation. The flat view stays in service.
    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    /// Block until the migration finishes or `timeout` elapses; returns the
    /// status at that point.
    pub fn wait(&self, timeout: Option<Duration>) -> MigrationStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let mut guard = self.shared.status.lock();
            while !guard.is_finished() {
                match deadline {
                    Some(d) => {
                        if self.shared.done.wait_until(&mut guard, d).timed_out() {
                            return guard.clone();
                        }
                    }
                    None => self.shared.done.wait(&mut guard),
                }
            }
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::warn!("migration thread panicked");
            }
        }
        self.status()
    }
}

/// Build a `target` graph over every slot of `store`.
pub(crate) fn build_graph(
    store: &VectorStore,
    target: GraphAlgorithm,
    config: &IndexConfig,
    budget: &WorkBudget,
    progress: Option<&AtomicUsize>,
) -> Result<GraphIndex> {
    let mut graph = GraphIndex::new(target, config);
    let total = store.slot_count();
    let mut start = 0usize;
    while start < total {
        let end = (start + PROGRESS_CHUNK).min(total);
        graph.build(store, start as Slot, end as Slot, budget)?;
        if let Some(p) = progress {
            p.store(end, Ordering::Release);
        }
        start = end;
    }
    Ok(graph)
}
