//! Database build orchestration
//!
//! [`DatabaseBuilder`] drives a whole build: open the output database, ingest
//! the source on one thread or many, merge temporary stores, then record the
//! final status. Two execution paths:
//!
//! - **Single-threaded** (`num_threads == 0`): the calling thread feeds the
//!   primary creator directly. A record whose transaction fails is logged,
//!   counted and skipped.
//! - **Concurrent** (`num_threads >= 1`): a
//!   [`ConcurrentIngestionController`] runs the workers, then a
//!   [`MergeCoordinator`] folds the temporary stores into the primary. The
//!   first failure stops every worker and fails the build.

pub mod controller;
pub mod merge;

pub use controller::{ConcurrentIngestionController, IngestionResult, SharedIngest};
pub use merge::{MergeCoordinator, MergeReport, TempStoreFile, TemporaryStore};

use crate::config::BuildConfig;
use crate::creator::{DatabaseCreator, ProcessOutcome, StatsSnapshot};
use crate::error::Result;
use crate::progress::ProgressReporter;
use crate::record::RecordSource;
use crate::store::RecordStoreEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How often the progress display is refreshed
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Live view of an ingestion in progress
#[derive(Debug, Clone, Default)]
pub struct IngestProgress {
    /// Records taken from the source
    pub read: usize,

    /// Source size if known, 0 otherwise
    pub total: usize,

    /// Counters summed over every creator
    pub stats: StatsSnapshot,

    pub active_workers: usize,
    pub total_workers: usize,
    pub elapsed: Duration,
}

impl IngestProgress {
    pub fn records_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.read as f64 / secs
        } else {
            0.0
        }
    }

    /// Fraction of the source consumed, if its size is known
    pub fn fraction(&self) -> Option<f64> {
        (self.total > 0).then(|| self.read as f64 / self.total as f64)
    }
}

/// Final report of a build
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    /// Aggregate counters (see [`aggregate_stats`])
    pub stats: StatsSnapshot,

    /// Records whose transaction failed (single-threaded path only)
    pub failed: u64,

    /// Temporary stores folded into the primary
    pub temporary_stores: usize,

    /// Records taken from the source
    pub records_read: usize,

    /// False when interrupted by shutdown
    pub completed: bool,

    pub ingest_duration: Duration,
    pub merge_duration: Duration,
    pub duration: Duration,
}

/// Combine the primary's counters with those of the merged temporary stores
///
/// Inserted and deleted come from the primary alone, since every surviving
/// record was written there (directly or by the merge). Records rejected
/// inside a temporary store never reached the primary, so they are added to
/// both processed and rejected.
pub fn aggregate_stats(primary: StatsSnapshot, temporaries: &[StatsSnapshot]) -> StatsSnapshot {
    let temp_rejected: u64 = temporaries.iter().map(|s| s.rejected).sum();
    StatsSnapshot {
        processed: primary.processed + temp_rejected,
        rejected: primary.rejected + temp_rejected,
        deleted: primary.deleted,
        inserted: primary.inserted,
    }
}

/// Builds one output database from one record source
pub struct DatabaseBuilder {
    config: BuildConfig,
    shutdown: Arc<AtomicBool>,
}

impl DatabaseBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the build between records when set
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Run the build to completion (or interruption)
    pub fn run<R>(&self, source: R, progress: Option<&ProgressReporter>) -> Result<BuildSummary>
    where
        R: RecordSource + 'static,
    {
        self.config.validate()?;

        let start = Instant::now();
        let allow_duplicates = !self.config.drop_duplicates;
        let primary =
            DatabaseCreator::open(&self.config.output_path, self.config.mode, allow_duplicates)?;

        info!(
            output = %self.config.output_path.display(),
            mode = %self.config.mode,
            threads = self.config.num_threads,
            drop_duplicates = self.config.drop_duplicates,
            "Starting build"
        );

        let mut summary = if self.config.num_threads == 0 {
            self.run_single(primary, source, progress)?
        } else {
            self.run_concurrent(primary, source, progress)?
        };

        summary.duration = start.elapsed();
        info!(
            processed = summary.stats.processed,
            inserted = summary.stats.inserted,
            rejected = summary.stats.rejected,
            deleted = summary.stats.deleted,
            failed = summary.failed,
            completed = summary.completed,
            duration_ms = summary.duration.as_millis() as u64,
            "Build finished"
        );
        Ok(summary)
    }

    fn run_single<R: RecordSource>(
        &self,
        mut primary: DatabaseCreator,
        mut source: R,
        progress: Option<&ProgressReporter>,
    ) -> Result<BuildSummary> {
        let start = Instant::now();
        let total = source.record_count();
        let mut failed = 0u64;
        let mut interrupted = false;
        let mut last_update = Instant::now();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                interrupted = true;
                break;
            }
            let Some(record) = source.next_record()? else {
                break;
            };

            if let ProcessOutcome::Failed(e) = primary.process(&record) {
                failed += 1;
                warn!(record = source.current_index(), error = %e, "Record skipped");
            }

            if let Some(reporter) = progress {
                if last_update.elapsed() >= PROGRESS_INTERVAL {
                    reporter.update_ingest(&IngestProgress {
                        read: source.current_index(),
                        total,
                        stats: primary.statistics(),
                        active_workers: 1,
                        total_workers: 1,
                        elapsed: start.elapsed(),
                    });
                    last_update = Instant::now();
                }
            }
        }

        let ingest_duration = start.elapsed();
        let stats = primary.statistics();
        finish(&mut primary, !interrupted)?;

        Ok(BuildSummary {
            stats,
            failed,
            temporary_stores: 0,
            records_read: source.current_index(),
            completed: !interrupted,
            ingest_duration,
            ..BuildSummary::default()
        })
    }

    fn run_concurrent<R: RecordSource + 'static>(
        &self,
        primary: DatabaseCreator,
        source: R,
        progress: Option<&ProgressReporter>,
    ) -> Result<BuildSummary> {
        let start = Instant::now();
        let mut controller = ConcurrentIngestionController::spawn(
            primary,
            source,
            self.config.num_threads,
            &self.config.tmp_dir,
            self.shutdown_flag(),
        )?;

        while !controller.wait_timeout(PROGRESS_INTERVAL) {
            if let Some(reporter) = progress {
                reporter.update_ingest(&controller.progress());
            }
        }
        let records_read = controller.progress().read;

        let IngestionResult {
            mut primary,
            temporaries,
            interrupted,
        } = controller.join()?;
        let ingest_duration = start.elapsed();
        let temporary_stores = temporaries.len();

        let report = MergeCoordinator::new(self.shutdown_flag()).merge_all(
            &mut primary,
            temporaries,
            |fraction| {
                if let Some(reporter) = progress {
                    reporter.update_merge(fraction);
                }
            },
        )?;

        let completed = !interrupted && !report.cancelled;
        let stats = aggregate_stats(primary.statistics(), &report.store_stats);
        finish(&mut primary, completed)?;

        Ok(BuildSummary {
            stats,
            failed: 0,
            temporary_stores,
            records_read,
            completed,
            ingest_duration,
            merge_duration: report.duration,
            duration: Duration::ZERO,
        })
    }
}

fn finish<S: RecordStoreEngine>(primary: &mut DatabaseCreator<S>, completed: bool) -> Result<()> {
    let status = if completed { "completed" } else { "interrupted" };
    primary.finish(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(processed: u64, rejected: u64, deleted: u64, inserted: u64) -> StatsSnapshot {
        StatsSnapshot {
            processed,
            rejected,
            deleted,
            inserted,
        }
    }

    #[test]
    fn test_aggregate_counts_temp_rejections_once() {
        // Primary merged 150 records from temps, 10 more were rejected inside them
        let primary = snap(250, 20, 3, 230);
        let temps = [snap(80, 4, 0, 76), snap(80, 6, 0, 74)];

        let total = aggregate_stats(primary, &temps);
        assert_eq!(total.processed, 260);
        assert_eq!(total.rejected, 30);
        assert_eq!(total.inserted, 230);
        assert_eq!(total.deleted, 3);
        assert_eq!(total.processed, total.inserted + total.rejected);
    }

    #[test]
    fn test_aggregate_without_temps() {
        let primary = snap(5, 1, 0, 4);
        assert_eq!(aggregate_stats(primary, &[]), primary);
    }

    #[test]
    fn test_progress_fraction() {
        let progress = IngestProgress {
            read: 25,
            total: 100,
            ..IngestProgress::default()
        };
        assert_eq!(progress.fraction(), Some(0.25));
        assert_eq!(IngestProgress::default().fraction(), None);
    }
}
