//! Database creator: dedup policy, per-record transactions and merge
//!
//! A [`DatabaseCreator`] owns one record store for its whole life. Every
//! `process()` call and every record folded in by `merge()` runs the same
//! steps:
//!
//! ```text
//! hash ──► dedup check ──► BEGIN ──► (UPDATE: delete same-hash records)
//!   (seen set, HashIndex)           ──► insert record + derived records
//!                                   ──► COMMIT ──► HashIndex, seen, stats
//! ```
//!
//! The in-memory index, the seen set and the statistics only advance after
//! the store has committed, so a failed record leaves all three untouched.

use crate::error::{Result, ScreenDbError, StoreError, StoreResult};
use crate::hash::{ContentHash, HashIndex, RecordId};
use crate::record::{Record, RecordAccessor};
use crate::store::schema::keys;
use crate::store::{CreationMode, RecordStoreEngine, SqliteStore, TransactionGuard};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Live counters of a creator
///
/// Shared behind an `Arc` so progress displays on other threads can read
/// them while the owning thread ingests.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Records that reached a policy decision (inserted or rejected)
    pub processed: AtomicU64,

    /// Records refused as duplicates
    pub rejected: AtomicU64,

    /// Existing records removed by UPDATE-mode replacement
    pub deleted: AtomicU64,

    /// Records written
    pub inserted: AtomicU64,
}

impl Statistics {
    // `processed` is bumped last with Release and read first with Acquire,
    // so a snapshot never shows more processed than inserted + rejected.

    fn record_inserted(&self, deleted: u64) {
        self.deleted.fetch_add(deleted, Ordering::Relaxed);
        self.inserted.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Release);
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Release);
    }

    /// Point-in-time copy of the counters
    ///
    /// Taken while the owner is still ingesting, `inserted` and `rejected`
    /// may run ahead of `processed` by the record in flight. They never lag
    /// behind it. Once the owner has stopped the copy is exact.
    pub fn snapshot(&self) -> StatsSnapshot {
        let processed = self.processed.load(Ordering::Acquire);
        StatsSnapshot {
            processed,
            rejected: self.rejected.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`Statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub rejected: u64,
    pub deleted: u64,
    pub inserted: u64,
}

/// Result of processing one record
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Record committed; `deleted` same-hash records were replaced first
    Inserted { id: RecordId, deleted: usize },

    /// Refused as a duplicate; nothing was written
    Rejected,

    /// The transaction failed and was rolled back
    Failed(StoreError),
}

impl ProcessOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, ProcessOutcome::Inserted { .. })
    }
}

/// Result of a merge that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Every source record was folded in
    Completed,

    /// The progress callback asked to stop after `merged` records
    Cancelled { merged: usize },
}

/// One logical database: a record store plus its dedup policy
pub struct DatabaseCreator<S: RecordStoreEngine = SqliteStore> {
    name: String,
    store: S,
    mode: CreationMode,
    allow_duplicates: bool,

    /// Persisted `(hash, id)` pairs; maintained only when rejecting
    /// duplicates, loaded from the store in APPEND and UPDATE mode
    index: HashIndex,

    /// Hashes inserted during this session
    seen: HashSet<ContentHash>,

    stats: Arc<Statistics>,
    open: bool,
}

impl DatabaseCreator<SqliteStore> {
    /// Open (or create) the SQLite database at `path`
    pub fn open(path: &Path, mode: CreationMode, allow_duplicates: bool) -> Result<Self> {
        let store = SqliteStore::open(path, mode)?;
        Self::with_store(path.display().to_string(), store, mode, allow_duplicates)
    }
}

impl<S: RecordStoreEngine> DatabaseCreator<S> {
    /// Wrap an already opened store
    pub fn with_store(
        name: impl Into<String>,
        mut store: S,
        mode: CreationMode,
        allow_duplicates: bool,
    ) -> Result<Self> {
        let name = name.into();

        let index = if !allow_duplicates && mode != CreationMode::Create {
            let pairs = store.load_all_hashes()?;
            let index = HashIndex::from_pairs(pairs);
            info!(
                db = %name,
                records = index.len(),
                hashes = index.distinct_hashes(),
                "Loaded hash index"
            );
            index
        } else {
            HashIndex::new()
        };

        store.set_metadata(keys::ENGINE_VERSION, env!("CARGO_PKG_VERSION"))?;
        store.set_metadata(keys::MODE, mode.as_str())?;
        store.set_metadata(keys::STATUS, "building")?;

        debug!(db = %name, mode = %mode, allow_duplicates, "Database opened");

        Ok(Self {
            name,
            store,
            mode,
            allow_duplicates,
            index,
            seen: HashSet::new(),
            stats: Arc::new(Statistics::default()),
            open: true,
        })
    }

    /// Store one record, subject to the dedup policy
    pub fn process(&mut self, record: &Record) -> ProcessOutcome {
        if !self.open {
            return ProcessOutcome::Failed(StoreError::Closed);
        }

        let hash = record.content_hash();
        if self.is_duplicate(hash) {
            self.stats.record_rejected();
            trace!(db = %self.name, hash, "Duplicate rejected");
            return ProcessOutcome::Rejected;
        }

        match self.insert_transaction(record) {
            Ok((id, removed)) => {
                for &old in &removed {
                    self.index.remove(hash, old);
                }
                if !self.allow_duplicates {
                    self.seen.insert(hash);
                    self.index.insert(hash, id);
                }
                self.stats.record_inserted(removed.len() as u64);
                ProcessOutcome::Inserted {
                    id,
                    deleted: removed.len(),
                }
            }
            Err(e) => {
                debug!(db = %self.name, error = %e, "Record transaction rolled back");
                ProcessOutcome::Failed(e)
            }
        }
    }

    fn is_duplicate(&self, hash: ContentHash) -> bool {
        if self.allow_duplicates {
            return false;
        }
        self.seen.contains(&hash) || (self.mode == CreationMode::Append && self.index.contains(hash))
    }

    /// Delete-then-insert for one record inside a single transaction
    ///
    /// Returns the new id and the ids removed by UPDATE-mode replacement.
    fn insert_transaction(&mut self, record: &Record) -> StoreResult<(RecordId, Vec<RecordId>)> {
        let hash = record.content_hash();
        let mut tx = TransactionGuard::begin(&mut self.store)?;

        let mut removed = Vec::new();
        if self.mode == CreationMode::Update {
            for id in tx.lookup_ids_by_hash(hash)? {
                tx.delete_record(id)?;
                removed.push(id);
            }
        }

        let id = tx.insert_record(record.encoded(), hash, record.derived_count())?;
        for (derived_index, derived) in record.derived().iter().enumerate() {
            tx.insert_derived(id, derived_index, derived)?;
        }

        tx.commit()?;
        Ok((id, removed))
    }

    /// Fold every record of `source` into this database
    ///
    /// Each record goes through the same dedup and transaction logic as
    /// [`Self::process`]. After each record `progress` receives the fraction
    /// done; returning `false` stops the merge between records. The first
    /// failed transaction aborts the merge with an error.
    pub fn merge<A, F>(&mut self, source: &mut A, mut progress: F) -> Result<MergeOutcome>
    where
        A: RecordAccessor + ?Sized,
        F: FnMut(f64) -> bool,
    {
        if !self.open {
            return Err(ScreenDbError::NotOpen {
                name: self.name.clone(),
            });
        }

        let total = source.num_records();
        if total == 0 {
            progress(1.0);
            return Ok(MergeOutcome::Completed);
        }

        for idx in 0..total {
            let record = source
                .get_record(idx)
                .map_err(|e| ScreenDbError::Transaction { record: idx, source: e })?;

            if let ProcessOutcome::Failed(e) = self.process(&record) {
                warn!(db = %self.name, record = idx, error = %e, "Merge aborted");
                return Err(ScreenDbError::Transaction { record: idx, source: e });
            }

            if !progress((idx + 1) as f64 / total as f64) {
                info!(db = %self.name, merged = idx + 1, total, "Merge cancelled");
                return Ok(MergeOutcome::Cancelled { merged: idx + 1 });
            }
        }

        Ok(MergeOutcome::Completed)
    }

    /// Record the final build status and close the store
    pub fn finish(&mut self, status: &str) -> Result<()> {
        if self.open {
            self.store.set_metadata(keys::STATUS, status)?;
            self.store
                .set_metadata(keys::UPDATED_AT, &chrono::Utc::now().to_rfc3339())?;
        }
        self.close()
    }

    /// Close the store; statistics stay readable. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.store.close()?;

        let stats = self.stats.snapshot();
        debug!(
            db = %self.name,
            processed = stats.processed,
            inserted = stats.inserted,
            rejected = stats.rejected,
            deleted = stats.deleted,
            "Database closed"
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn num_processed(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    pub fn num_rejected(&self) -> u64 {
        self.stats.rejected.load(Ordering::Relaxed)
    }

    pub fn num_deleted(&self) -> u64 {
        self.stats.deleted.load(Ordering::Relaxed)
    }

    pub fn num_inserted(&self) -> u64 {
        self.stats.inserted.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared handle to the live counters
    pub fn stats_handle(&self) -> Arc<Statistics> {
        Arc::clone(&self.stats)
    }

    pub fn database_name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> CreationMode {
        self.mode
    }

    pub fn allows_duplicates(&self) -> bool {
        self.allow_duplicates
    }

    /// The hash index (empty unless loaded at open)
    pub fn hash_index(&self) -> &HashIndex {
        &self.index
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DerivedRecord;
    use crate::store::{FailPoint, MemoryStore};

    fn creator(mode: CreationMode, allow_duplicates: bool) -> DatabaseCreator<MemoryStore> {
        DatabaseCreator::with_store("mem", MemoryStore::new(), mode, allow_duplicates).unwrap()
    }

    fn record(hash: ContentHash, conformers: usize) -> Record {
        let derived = (0..conformers)
            .map(|i| DerivedRecord::new(vec![i as u8], [(1u16, 2u32)].into_iter().collect()))
            .collect();
        Record::with_hash(hash, format!("mol-{}", hash).into_bytes(), derived)
    }

    #[test]
    fn test_snapshot_never_shows_processed_ahead() {
        let stats = Arc::new(Statistics::default());
        let writer = {
            let stats = Arc::clone(&stats);
            std::thread::spawn(move || {
                for i in 0..100_000u64 {
                    if i % 3 == 0 {
                        stats.record_rejected();
                    } else {
                        stats.record_inserted(i % 2);
                    }
                }
            })
        };

        while !writer.is_finished() {
            let snap = stats.snapshot();
            assert!(snap.processed <= snap.inserted + snap.rejected, "{:?}", snap);
        }
        writer.join().unwrap();

        let done = stats.snapshot();
        assert_eq!(done.processed, 100_000);
        assert_eq!(done.processed, done.inserted + done.rejected);
    }

    #[test]
    fn test_duplicate_rejected_in_same_session() {
        let mut db = creator(CreationMode::Create, false);

        assert!(db.process(&record(1, 1)).is_inserted());
        assert_eq!(db.num_inserted(), 1);

        assert!(matches!(db.process(&record(1, 1)), ProcessOutcome::Rejected));
        assert_eq!(db.num_rejected(), 1);
        assert_eq!(db.num_inserted(), 1);
        assert_eq!(db.num_processed(), 2);
    }

    #[test]
    fn test_duplicates_allowed() {
        let mut db = creator(CreationMode::Create, true);
        assert!(db.process(&record(1, 0)).is_inserted());
        assert!(db.process(&record(1, 0)).is_inserted());
        assert_eq!(db.store_mut().lookup_ids_by_hash(1).unwrap().len(), 2);
        assert_eq!(db.num_rejected(), 0);
    }

    #[test]
    fn test_append_rejects_existing_hash() {
        let mut store = MemoryStore::new();
        store.begin_transaction().unwrap();
        store.insert_record(b"old", 5, 0).unwrap();
        store.commit().unwrap();

        let mut db = DatabaseCreator::with_store("mem", store, CreationMode::Append, false).unwrap();
        assert!(db.hash_index().contains(5));

        assert!(matches!(db.process(&record(5, 0)), ProcessOutcome::Rejected));
        assert!(db.process(&record(6, 0)).is_inserted());
        assert!(db.hash_index().contains(6));
        assert_eq!(db.store_mut().record_count().unwrap(), 2);
    }

    #[test]
    fn test_update_replaces_existing_hash() {
        let mut store = MemoryStore::new();
        store.begin_transaction().unwrap();
        store.insert_record(b"a", 6, 0).unwrap();
        store.insert_record(b"b", 6, 0).unwrap();
        let old = store.insert_record(b"c", 7, 0).unwrap();
        store.commit().unwrap();

        let mut db = DatabaseCreator::with_store("mem", store, CreationMode::Update, false).unwrap();
        let outcome = db.process(&record(7, 2));

        let ProcessOutcome::Inserted { id, deleted } = outcome else {
            panic!("expected insert, got {:?}", outcome);
        };
        assert_eq!(deleted, 1);
        assert_ne!(id, old);
        assert_eq!(db.num_deleted(), 1);
        assert_eq!(db.num_inserted(), 1);
        assert_eq!(db.store_mut().lookup_ids_by_hash(7).unwrap(), vec![id]);
        assert_eq!(db.hash_index().ids(7), &[id]);
    }

    #[test]
    fn test_update_only_touches_incoming_hash() {
        // Pre-existing duplicates of other hashes stay; replacement is
        // scoped to the hash being inserted
        let mut store = MemoryStore::new();
        store.begin_transaction().unwrap();
        store.insert_record(b"a", 6, 0).unwrap();
        store.insert_record(b"b", 6, 0).unwrap();
        store.commit().unwrap();

        let mut db = DatabaseCreator::with_store("mem", store, CreationMode::Update, true).unwrap();
        assert!(db.process(&record(8, 0)).is_inserted());
        assert_eq!(db.store_mut().lookup_ids_by_hash(6).unwrap().len(), 2);
    }

    #[test]
    fn test_update_siblings_with_duplicates_allowed() {
        let mut db = creator(CreationMode::Update, true);
        assert!(db.process(&record(3, 0)).is_inserted());
        let ProcessOutcome::Inserted { deleted, .. } = db.process(&record(3, 0)) else {
            panic!("expected insert");
        };
        assert_eq!(deleted, 1);
        assert_eq!(db.store_mut().record_count().unwrap(), 1);
    }

    #[test]
    fn test_failed_transaction_leaves_no_trace() {
        let mut db = creator(CreationMode::Create, false);
        assert!(db.process(&record(1, 3)).is_inserted());
        let before = db.store_mut().summary().unwrap();

        db.store_mut().fail_at(FailPoint::InsertDerived, 1);
        let outcome = db.process(&record(2, 3));
        assert!(matches!(outcome, ProcessOutcome::Failed(_)));

        assert_eq!(db.store_mut().summary().unwrap(), before);
        assert!(!db.store().in_transaction());
        assert_eq!(db.statistics(), StatsSnapshot {
            processed: 1,
            rejected: 0,
            deleted: 0,
            inserted: 1,
        });

        // The failed hash was never marked as seen
        assert!(db.process(&record(2, 3)).is_inserted());
    }

    #[test]
    fn test_failed_update_keeps_old_record() {
        let mut store = MemoryStore::new();
        store.begin_transaction().unwrap();
        let old = store.insert_record(b"a", 9, 0).unwrap();
        store.commit().unwrap();

        let mut db = DatabaseCreator::with_store("mem", store, CreationMode::Update, false).unwrap();
        db.store_mut().fail_at(FailPoint::Commit, 0);

        assert!(matches!(db.process(&record(9, 1)), ProcessOutcome::Failed(_)));
        assert_eq!(db.store_mut().lookup_ids_by_hash(9).unwrap(), vec![old]);
        assert_eq!(db.num_deleted(), 0);
        assert_eq!(db.hash_index().ids(9), &[old]);
    }

    #[test]
    fn test_merge_folds_and_dedups() {
        let mut db = creator(CreationMode::Create, false);
        assert!(db.process(&record(1, 0)).is_inserted());

        let mut source = vec![record(1, 0), record(2, 1), record(3, 0), record(2, 1)];
        let mut reported = Vec::new();
        let outcome = db
            .merge(&mut source, |f| {
                reported.push(f);
                true
            })
            .unwrap();

        assert_eq!(outcome, MergeOutcome::Completed);
        assert_eq!(reported, vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(db.num_inserted(), 3);
        assert_eq!(db.num_rejected(), 2);
        assert_eq!(db.num_processed(), 5);
    }

    #[test]
    fn test_merge_empty_source_changes_nothing() {
        let mut db = creator(CreationMode::Create, false);
        assert!(db.process(&record(1, 1)).is_inserted());
        let stats = db.statistics();
        let summary = db.store_mut().summary().unwrap();

        let mut empty: Vec<Record> = Vec::new();
        let outcome = db.merge(&mut empty, |_| true).unwrap();

        assert_eq!(outcome, MergeOutcome::Completed);
        assert_eq!(db.statistics(), stats);
        assert_eq!(db.store_mut().summary().unwrap(), summary);
    }

    #[test]
    fn test_merge_cancel_between_records() {
        let mut db = creator(CreationMode::Create, false);
        let mut source: Vec<Record> = (0..10).map(|h| record(h, 0)).collect();

        let mut calls = 0;
        let outcome = db
            .merge(&mut source, |_| {
                calls += 1;
                calls < 3
            })
            .unwrap();

        assert_eq!(outcome, MergeOutcome::Cancelled { merged: 3 });
        assert_eq!(db.num_inserted(), 3);
        assert!(!db.store().in_transaction());
    }

    #[test]
    fn test_merge_aborts_on_failure() {
        let mut db = creator(CreationMode::Create, false);
        db.store_mut().fail_at(FailPoint::InsertRecord, 2);
        let mut source: Vec<Record> = (0..5).map(|h| record(h, 0)).collect();

        let err = db.merge(&mut source, |_| true).unwrap_err();
        assert!(matches!(err, ScreenDbError::Transaction { record: 2, .. }));
        assert_eq!(db.num_inserted(), 2);
        assert_eq!(db.store_mut().record_count().unwrap(), 2);
    }

    #[test]
    fn test_close_keeps_statistics() {
        let mut db = creator(CreationMode::Create, false);
        assert!(db.process(&record(1, 0)).is_inserted());

        db.close().unwrap();
        db.close().unwrap();

        assert!(!db.is_open());
        assert_eq!(db.num_inserted(), 1);
        assert!(matches!(db.process(&record(2, 0)), ProcessOutcome::Failed(StoreError::Closed)));
        assert!(matches!(
            db.merge(&mut Vec::<Record>::new(), |_| true),
            Err(ScreenDbError::NotOpen { .. })
        ));
    }
}
