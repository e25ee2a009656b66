//! In-memory record store
//!
//! Mirrors [`super::SqliteStore`] semantics without touching disk: a
//! transaction snapshots the committed state on begin and restores it on
//! rollback. Failures can be injected at a chosen write so callers can check
//! that a failed record leaves no trace.

use crate::error::{StoreError, StoreResult};
use crate::hash::{ContentHash, RecordId};
use crate::record::{DerivedRecord, RecordAccessor};
use crate::store::{RecordStoreEngine, StoreSummary};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Write operation at which an injected failure fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertRecord,
    InsertDerived,
    DeleteRecord,
    Commit,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    hash: ContentHash,
    encoded: Vec<u8>,
    derived: BTreeMap<usize, DerivedRecord>,
}

#[derive(Debug, Clone, Default)]
struct State {
    records: BTreeMap<RecordId, StoredRecord>,
    metadata: HashMap<String, String>,
    next_id: RecordId,
}

/// In-memory store for tests and benchmarks
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: State,

    /// Committed state captured at begin, restored on rollback
    snapshot: Option<State>,

    /// Fire on the `n`th (0-based) call reaching this point
    fail_at: Option<(FailPoint, usize)>,
    calls: HashMap<FailPoint, usize>,

    closed: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: State {
                next_id: 1,
                ..State::default()
            },
            ..Self::default()
        }
    }

    /// Fail the `nth` (0-based) future call at `point`
    pub fn fail_at(&mut self, point: FailPoint, nth: usize) {
        self.fail_at = Some((point, nth));
        self.calls.remove(&point);
    }

    fn check(&mut self, point: FailPoint) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        let calls = self.calls.entry(point).or_insert(0);
        let current = *calls;
        *calls += 1;

        match self.fail_at {
            Some((p, nth)) if p == point && nth == current => {
                self.fail_at = None;
                Err(StoreError::Backend(format!("injected failure at {:?}", point)))
            }
            _ => Ok(()),
        }
    }

    fn record_at(&self, idx: usize) -> StoreResult<&StoredRecord> {
        self.state
            .records
            .values()
            .nth(idx)
            .ok_or(StoreError::IndexOutOfRange {
                idx,
                len: self.state.records.len(),
            })
    }

    /// Writes are only accepted inside a transaction
    fn require_transaction(&self) -> StoreResult<()> {
        self.live()?;
        if self.snapshot.is_none() {
            return Err(StoreError::NoTransaction);
        }
        Ok(())
    }

    fn live(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl RecordStoreEngine for MemoryStore {
    fn begin_transaction(&mut self) -> StoreResult<()> {
        self.live()?;
        assert!(
            self.snapshot.is_none(),
            "begin_transaction called while a transaction is open"
        );
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        if self.snapshot.is_none() {
            return Err(StoreError::NoTransaction);
        }
        self.check(FailPoint::Commit)?;
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let snapshot = self.snapshot.take().ok_or(StoreError::NoTransaction)?;
        self.state = snapshot;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    fn insert_record(
        &mut self,
        encoded: &[u8],
        hash: ContentHash,
        _derived_count: usize,
    ) -> StoreResult<RecordId> {
        self.require_transaction()?;
        self.check(FailPoint::InsertRecord)?;
        let id = self.state.next_id;
        self.state.next_id += 1;
        self.state.records.insert(
            id,
            StoredRecord {
                hash,
                encoded: encoded.to_vec(),
                derived: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn insert_derived(
        &mut self,
        id: RecordId,
        derived_index: usize,
        derived: &DerivedRecord,
    ) -> StoreResult<()> {
        self.require_transaction()?;
        self.check(FailPoint::InsertDerived)?;
        let record = self
            .state
            .records
            .get_mut(&id)
            .ok_or_else(|| StoreError::Backend(format!("no record with id {}", id)))?;
        if record.derived.contains_key(&derived_index) {
            return Err(StoreError::Backend(format!(
                "duplicate derived index {} for record {}",
                derived_index, id
            )));
        }
        record.derived.insert(derived_index, derived.clone());
        Ok(())
    }

    fn delete_record(&mut self, id: RecordId) -> StoreResult<()> {
        self.require_transaction()?;
        self.check(FailPoint::DeleteRecord)?;
        self.state.records.remove(&id);
        Ok(())
    }

    fn lookup_ids_by_hash(&mut self, hash: ContentHash) -> StoreResult<Vec<RecordId>> {
        self.live()?;
        Ok(self
            .state
            .records
            .iter()
            .filter(|(_, r)| r.hash == hash)
            .map(|(&id, _)| id)
            .collect())
    }

    fn load_all_hashes(&mut self) -> StoreResult<Vec<(ContentHash, RecordId)>> {
        self.live()?;
        Ok(self
            .state
            .records
            .iter()
            .map(|(&id, r)| (r.hash, id))
            .collect())
    }

    fn record_count(&mut self) -> StoreResult<u64> {
        self.live()?;
        Ok(self.state.records.len() as u64)
    }

    fn summary(&mut self) -> StoreResult<StoreSummary> {
        self.live()?;
        let mut summary = StoreSummary {
            records: self.state.records.len() as u64,
            ..StoreSummary::default()
        };
        let mut hashes = HashSet::new();
        for record in self.state.records.values() {
            hashes.insert(record.hash);
            summary.derived_records += record.derived.len() as u64;
            for derived in record.derived.values() {
                for (&feature_type, &count) in &derived.features {
                    *summary.feature_totals.entry(feature_type).or_insert(0) += u64::from(count);
                }
            }
        }
        summary.distinct_hashes = hashes.len() as u64;
        Ok(summary)
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.live()?;
        self.state.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn metadata(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.live()?;
        Ok(self.state.metadata.get(key).cloned())
    }

    fn close(&mut self) -> StoreResult<()> {
        if let Some(snapshot) = self.snapshot.take() {
            self.state = snapshot;
        }
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Committed records in id order, so a memory store can be merged directly
impl RecordAccessor for MemoryStore {
    fn num_records(&self) -> usize {
        self.state.records.len()
    }

    fn content_hash(&mut self, idx: usize) -> StoreResult<ContentHash> {
        Ok(self.record_at(idx)?.hash)
    }

    fn get_encoded(&mut self, idx: usize) -> StoreResult<Vec<u8>> {
        Ok(self.record_at(idx)?.encoded.clone())
    }

    fn get_derived_records(&mut self, idx: usize) -> StoreResult<Vec<DerivedRecord>> {
        Ok(self.record_at(idx)?.derived.values().cloned().collect())
    }
}
