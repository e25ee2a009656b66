//! Merge of temporary stores into the primary database
//!
//! Temporary stores are folded into the primary one at a time, in creation
//! order, on the calling thread. Every record goes through the primary
//! creator's `merge`, so the final database follows the primary's dedup and
//! UPDATE policy no matter which worker ingested a record.
//!
//! A temporary store's files are deleted as soon as it has been merged, and
//! on every other exit path (error, cancellation, unwind) by the drop of its
//! [`TempStoreFile`].

use crate::creator::{DatabaseCreator, MergeOutcome, StatsSnapshot};
use crate::error::Result;
use crate::record::RecordAccessor;
use crate::store::{RecordStoreEngine, SqliteAccessor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tracing::{debug, info, warn};

/// SQLite sidecar files that can outlive the connection
const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Temporary database file, deleted with its sidecars on drop
#[derive(Debug)]
pub struct TempStoreFile {
    path: TempPath,
}

impl TempStoreFile {
    /// Reserve a fresh file name in `dir`
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        let path = tempfile::Builder::new()
            .prefix("screendb-")
            .suffix(".tmp.db")
            .tempfile_in(dir)?
            .into_temp_path();
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sidecars(&self) -> impl Iterator<Item = PathBuf> + '_ {
        SIDECAR_SUFFIXES.iter().map(move |suffix| {
            let mut name = self.path.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        })
    }
}

impl Drop for TempStoreFile {
    fn drop(&mut self) {
        // The main file is removed by TempPath after this runs
        for sidecar in self.sidecars() {
            match std::fs::remove_file(&sidecar) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %sidecar.display(), error = %e, "Failed to remove temporary file"),
            }
        }
        debug!(path = %self.path.display(), "Temporary store removed");
    }
}

/// A worker's finished database waiting to be merged
///
/// Field order matters: the creator drops (closing its connection) before
/// the file is deleted.
pub struct TemporaryStore {
    creator: DatabaseCreator,
    file: TempStoreFile,
}

impl TemporaryStore {
    pub fn new(creator: DatabaseCreator, file: TempStoreFile) -> Self {
        Self { creator, file }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Counters accumulated while this store was ingesting
    pub fn statistics(&self) -> StatsSnapshot {
        self.creator.statistics()
    }
}

/// Outcome of merging all temporary stores
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Stores fully folded into the primary
    pub stores_merged: usize,

    /// Ingestion counters of every temporary store, in creation order
    pub store_stats: Vec<StatsSnapshot>,

    /// Shutdown was requested before the merge finished
    pub cancelled: bool,

    pub duration: Duration,
}

/// Folds temporary stores into the primary database
pub struct MergeCoordinator {
    shutdown: Arc<AtomicBool>,
}

impl MergeCoordinator {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self { shutdown }
    }

    /// Merge `temporaries` into `primary`, in order
    ///
    /// `on_progress` receives overall progress in `[0, 1]`: store `i` of `n`
    /// at fraction `f` reports `(i + f) / n`. Once shutdown is requested the
    /// current store stops between records and the rest are skipped. Every
    /// temporary file is deleted before this returns, whatever the outcome.
    pub fn merge_all<S, F>(
        &self,
        primary: &mut DatabaseCreator<S>,
        temporaries: Vec<TemporaryStore>,
        mut on_progress: F,
    ) -> Result<MergeReport>
    where
        S: RecordStoreEngine,
        F: FnMut(f64),
    {
        let start = Instant::now();
        let total = temporaries.len();
        let mut report = MergeReport {
            store_stats: temporaries.iter().map(TemporaryStore::statistics).collect(),
            ..MergeReport::default()
        };

        if total == 0 {
            on_progress(1.0);
            return Ok(report);
        }

        info!(stores = total, "Merging temporary stores");

        for (i, mut temp) in temporaries.into_iter().enumerate() {
            if self.shutdown.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }

            temp.creator.close()?;
            let mut accessor = SqliteAccessor::open(temp.path())?;
            debug!(
                store = i,
                path = %temp.path().display(),
                records = accessor.num_records(),
                "Merging store"
            );

            let shutdown = &self.shutdown;
            let outcome = primary.merge(&mut accessor, |fraction| {
                on_progress((i as f64 + fraction) / total as f64);
                !shutdown.load(Ordering::Relaxed)
            })?;

            drop(accessor);
            drop(temp);

            match outcome {
                MergeOutcome::Completed => report.stores_merged += 1,
                MergeOutcome::Cancelled { merged } => {
                    info!(store = i, merged, "Merge interrupted");
                    report.cancelled = true;
                    break;
                }
            }
        }

        report.duration = start.elapsed();
        info!(
            merged = report.stores_merged,
            cancelled = report.cancelled,
            duration_ms = report.duration.as_millis() as u64,
            "Merge finished"
        );
        Ok(report)
    }
}
