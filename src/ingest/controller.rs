//! Concurrent ingestion controller
//!
//! Fans ingestion out over `N` worker threads. Worker 0 writes to the
//! primary database; workers `1..N` each write to a private temporary store.
//! The record source is the only state the workers share and mutate:
//!
//! ```text
//!                ┌──────────────────────────────┐
//!                │  RecordSource (Mutex cursor) │
//!                │  + first-error cell          │
//!                │  + shutdown flag             │
//!                └──────────────┬───────────────┘
//!             next_raw()        │  (lock held for read-and-advance only)
//!       ┌───────────────────────┼───────────────────────┐
//! ┌─────▼─────┐           ┌─────▼─────┐           ┌─────▼─────┐
//! │ Worker 0  │           │ Worker 1  │    ...    │ Worker N-1│
//! │ primary   │           │ temp 1    │           │ temp N-1  │
//! └───────────┘           └───────────┘           └───────────┘
//! ```
//!
//! Each creator is moved into its thread and handed back through the join
//! handle, so no store is ever reachable from two threads at once.

use crate::creator::{DatabaseCreator, ProcessOutcome, StatsSnapshot, Statistics};
use crate::error::{Result, WorkerError};
use crate::ingest::merge::{TempStoreFile, TemporaryStore};
use crate::ingest::IngestProgress;
use crate::record::{Record, RecordSource};
use crate::store::{CreationMode, SqliteStore};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// State shared by all ingestion workers
pub struct SharedIngest<R> {
    /// Record source behind the single ingestion lock
    source: Mutex<R>,

    /// Records handed out so far, readable without the lock
    position: AtomicUsize,

    total: usize,

    /// First error reported by any worker; later errors are dropped
    first_error: OnceLock<String>,

    /// Process-wide cancellation request
    shutdown: Arc<AtomicBool>,
}

impl<R: RecordSource> SharedIngest<R> {
    pub fn new(source: R, shutdown: Arc<AtomicBool>) -> Self {
        let total = source.record_count();
        Self {
            position: AtomicUsize::new(source.current_index()),
            source: Mutex::new(source),
            total,
            first_error: OnceLock::new(),
            shutdown,
        }
    }

    /// Take the next record, or `None` at end of stream, after an error, or
    /// once shutdown has been requested
    pub fn next_record(&self) -> Option<Record> {
        if self.should_stop() {
            return None;
        }

        // Only the cursor advance is serialized; decoding runs unlocked
        let raw = {
            let mut source = self.source.lock();
            let raw = source.next_raw();
            self.position.store(source.current_index(), Ordering::Relaxed);
            raw
        };

        match raw.and_then(|raw| raw.map(R::decode).transpose()) {
            Ok(record) => record,
            Err(e) => {
                self.set_error(e.to_string());
                None
            }
        }
    }

    /// Record an error; returns `false` if another error got there first
    pub fn set_error(&self, message: String) -> bool {
        match self.first_error.set(message) {
            Ok(()) => {
                if let Some(message) = self.first_error.get() {
                    error!(error = %message, "Ingestion error, stopping workers");
                }
                true
            }
            Err(dropped) => {
                debug!(error = %dropped, "Dropping error after the first");
                false
            }
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.first_error.get().map(String::as_str)
    }

    pub fn should_stop(&self) -> bool {
        self.first_error.get().is_some() || self.shutdown.load(Ordering::Relaxed)
    }

    pub fn position(&self) -> usize {
        self.position.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// Notification sent by a worker when its thread ends
#[derive(Debug)]
enum WorkerEvent {
    Finished { id: usize },
}

/// Sends `Finished` when dropped, including during a panic unwind
struct FinishGuard {
    id: usize,
    events: Sender<WorkerEvent>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let _ = self.events.send(WorkerEvent::Finished { id: self.id });
    }
}

/// A spawned ingestion thread
struct IngestWorker {
    id: usize,
    handle: Option<JoinHandle<DatabaseCreator>>,
    stats: Arc<Statistics>,

    /// Backing file of a temporary store; `None` for the primary
    file: Option<TempStoreFile>,
}

/// Output of the parallel phase, ready for merging
pub struct IngestionResult {
    /// Creator bound to the output database, still open
    pub primary: DatabaseCreator,

    /// Closed temporary stores in creation order
    pub temporaries: Vec<TemporaryStore>,

    /// Whether shutdown was requested during ingestion
    pub interrupted: bool,
}

/// Runs ingestion on `N` threads, one creator per thread
pub struct ConcurrentIngestionController<R: RecordSource + 'static> {
    shared: Arc<SharedIngest<R>>,
    workers: Vec<IngestWorker>,
    events: Receiver<WorkerEvent>,
    finished: usize,
    start: Instant,
}

impl<R: RecordSource + 'static> ConcurrentIngestionController<R> {
    /// Spawn `num_threads` workers
    ///
    /// Worker 0 ingests into `primary`; every other worker gets a fresh
    /// temporary store in `tmp_dir`. Temporary stores are opened here, so
    /// open failures surface before any thread starts.
    pub fn spawn(
        primary: DatabaseCreator,
        source: R,
        num_threads: usize,
        tmp_dir: &Path,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let num_threads = num_threads.max(1);
        let allow_duplicates = primary.allows_duplicates();

        let mut creators = Vec::with_capacity(num_threads);
        creators.push((primary, None));
        for id in 1..num_threads {
            let file = TempStoreFile::create(tmp_dir)?;
            let store = SqliteStore::open(file.path(), CreationMode::Create)?;
            let creator = DatabaseCreator::with_store(
                format!("temp-{}", id),
                store,
                CreationMode::Create,
                allow_duplicates,
            )?;
            debug!(worker = id, path = %file.path().display(), "Temporary store created");
            creators.push((creator, Some(file)));
        }

        let shared = Arc::new(SharedIngest::new(source, shutdown));
        let (events_tx, events) = unbounded();

        let mut controller = Self {
            shared,
            workers: Vec::with_capacity(num_threads),
            events,
            finished: 0,
            start: Instant::now(),
        };

        for (id, (creator, file)) in creators.into_iter().enumerate() {
            let stats = creator.stats_handle();
            let shared = Arc::clone(&controller.shared);
            let guard = FinishGuard {
                id,
                events: events_tx.clone(),
            };

            let spawned = thread::Builder::new()
                .name(format!("ingest-{}", id))
                .spawn(move || worker_loop(id, creator, shared, guard));

            match spawned {
                Ok(handle) => controller.workers.push(IngestWorker {
                    id,
                    handle: Some(handle),
                    stats,
                    file,
                }),
                Err(e) => {
                    let err = WorkerError::SpawnFailed {
                        id,
                        reason: e.to_string(),
                    };
                    controller.shared.set_error(err.to_string());
                    controller.join_all();
                    return Err(err.into());
                }
            }
        }

        info!(count = controller.workers.len(), "Ingestion workers spawned");
        Ok(controller)
    }

    /// Wait up to `timeout` for workers to finish; true once all have
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.finished < self.workers.len() {
            match self.events.recv_deadline(deadline) {
                Ok(WorkerEvent::Finished { id }) => {
                    debug!(worker = id, "Worker finished");
                    self.finished += 1;
                }
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        true
    }

    /// Live progress across all workers
    pub fn progress(&self) -> IngestProgress {
        let stats = self
            .workers
            .iter()
            .map(|w| w.stats.snapshot())
            .fold(StatsSnapshot::default(), |acc, s| StatsSnapshot {
                processed: acc.processed + s.processed,
                rejected: acc.rejected + s.rejected,
                deleted: acc.deleted + s.deleted,
                inserted: acc.inserted + s.inserted,
            });

        IngestProgress {
            read: self.shared.position(),
            total: self.shared.total(),
            stats,
            active_workers: self.workers.len() - self.finished.min(self.workers.len()),
            total_workers: self.workers.len(),
            elapsed: self.start.elapsed(),
        }
    }

    /// First error reported so far
    pub fn error(&self) -> Option<String> {
        self.shared.error().map(str::to_string)
    }

    /// Wait for every worker and hand back their creators
    ///
    /// Fails with the first recorded error if any worker failed; temporary
    /// files are deleted in that case.
    pub fn join(mut self) -> Result<IngestionResult> {
        let joined = self.join_all();

        if let Some(message) = self.shared.error() {
            return Err(WorkerError::Failed {
                message: message.to_string(),
            }
            .into());
        }

        let mut primary = None;
        let mut temporaries = Vec::with_capacity(joined.len().saturating_sub(1));
        for (creator, file) in joined {
            match file {
                None => primary = Some(creator),
                Some(file) => temporaries.push(TemporaryStore::new(creator, file)),
            }
        }

        let primary = primary.ok_or_else(|| WorkerError::Failed {
            message: "primary worker produced no database".to_string(),
        })?;

        let interrupted = self.shared.shutdown.load(Ordering::Relaxed);
        info!(
            records = self.shared.position(),
            temporaries = temporaries.len(),
            interrupted,
            "Ingestion finished"
        );

        Ok(IngestionResult {
            primary,
            temporaries,
            interrupted,
        })
    }

    /// Join every spawned thread; panics are recorded as the first error
    fn join_all(&mut self) -> Vec<(DatabaseCreator, Option<TempStoreFile>)> {
        let mut joined = Vec::with_capacity(self.workers.len());

        for mut worker in std::mem::take(&mut self.workers) {
            let Some(handle) = worker.handle.take() else {
                continue;
            };
            match handle.join() {
                Ok(creator) => joined.push((creator, worker.file.take())),
                Err(_) => {
                    let err = WorkerError::Panicked {
                        id: worker.id,
                        message: "ingestion thread panicked".into(),
                    };
                    warn!(worker = worker.id, "Worker panicked");
                    self.shared.set_error(err.to_string());
                }
            }
        }

        joined
    }
}

/// Reports a panic unwinding through a worker as the first error, so the
/// other workers stop pulling records
struct PanicSignal<'a, R: RecordSource> {
    id: usize,
    shared: &'a SharedIngest<R>,
}

impl<R: RecordSource> Drop for PanicSignal<'_, R> {
    fn drop(&mut self) {
        if thread::panicking() {
            let err = WorkerError::Panicked {
                id: self.id,
                message: "ingestion thread panicked".into(),
            };
            self.shared.set_error(err.to_string());
        }
    }
}

/// Main worker loop: pull, process, repeat
fn worker_loop<R: RecordSource>(
    id: usize,
    mut creator: DatabaseCreator,
    shared: Arc<SharedIngest<R>>,
    _finish: FinishGuard,
) -> DatabaseCreator {
    info!(worker = id, db = %creator.database_name(), "Worker starting");
    let _panic_signal = PanicSignal { id, shared: &shared };

    while let Some(record) = shared.next_record() {
        if let ProcessOutcome::Failed(e) = creator.process(&record) {
            shared.set_error(format!("worker {}: {}", id, e));
            break;
        }
    }

    // Temporary stores are released here so the merge can open them
    if id != 0 {
        if let Err(e) = creator.close() {
            shared.set_error(format!("worker {}: failed to close store: {}", id, e));
        }
    }

    let stats = creator.statistics();
    info!(
        worker = id,
        processed = stats.processed,
        inserted = stats.inserted,
        rejected = stats.rejected,
        "Worker shutting down"
    );

    creator
}
