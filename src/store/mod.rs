//! Transactional record storage
//!
//! This module defines the interface the database creator writes through and
//! its implementations:
//! - [`SqliteStore`]: the production engine, one SQLite file per database
//! - [`MemoryStore`]: an in-memory double with failure injection for tests
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 DatabaseCreator                     │
//! │  - dedup decision (HashIndex, seen set)             │
//! │  - one TransactionGuard per record                  │
//! └─────────────────────┬───────────────────────────────┘
//!                       │ RecordStoreEngine
//!                       ▼
//! ┌─────────────────────────────────────────────────────┐
//! │       SqliteStore            MemoryStore            │
//! │  records / derived /      snapshot-on-begin         │
//! │  derived_features / db_info                         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Transactions do not nest. Writes are only valid inside a transaction,
//! and every transaction ends in exactly one commit or rollback; the
//! [`TransactionGuard`] rolls back on drop unless committed.

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::{FailPoint, MemoryStore};
pub use sqlite::{SqliteAccessor, SqliteStore};

use crate::error::StoreResult;
use crate::hash::{ContentHash, RecordId};
use crate::record::DerivedRecord;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use tracing::warn;

/// Conflict policy of a database, chosen at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CreationMode {
    /// Drop any existing schema and start empty
    Create,
    /// Add to an existing database
    Append,
    /// Replace existing records that share the incoming content hash
    Update,
}

impl CreationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreationMode::Create => "create",
            CreationMode::Append => "append",
            CreationMode::Update => "update",
        }
    }
}

impl fmt::Display for CreationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(CreationMode::Create),
            "append" => Ok(CreationMode::Append),
            "update" => Ok(CreationMode::Update),
            other => Err(format!("unknown creation mode '{}'", other)),
        }
    }
}

/// Feature counts summed over many derived records
///
/// Wider than a single record's counts so totals over a large store cannot
/// overflow.
pub type FeatureTotals = BTreeMap<u16, u64>;

/// Index-level statistics of a store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub records: u64,
    pub derived_records: u64,
    pub distinct_hashes: u64,
    /// Sum of feature counts per feature type over all derived records
    pub feature_totals: FeatureTotals,
}

/// Transactional key/blob store behind a database creator
pub trait RecordStoreEngine {
    /// Start a transaction
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already open. Transactions do not nest.
    fn begin_transaction(&mut self) -> StoreResult<()>;

    fn commit(&mut self) -> StoreResult<()>;

    fn rollback(&mut self) -> StoreResult<()>;

    fn in_transaction(&self) -> bool;

    /// Append a record; uniqueness is the caller's policy, not the store's
    fn insert_record(
        &mut self,
        encoded: &[u8],
        hash: ContentHash,
        derived_count: usize,
    ) -> StoreResult<RecordId>;

    /// Append a derived record for `id` under `derived_index`
    fn insert_derived(
        &mut self,
        id: RecordId,
        derived_index: usize,
        derived: &DerivedRecord,
    ) -> StoreResult<()>;

    /// Delete a record and, by cascade, all of its derived records
    fn delete_record(&mut self, id: RecordId) -> StoreResult<()>;

    fn lookup_ids_by_hash(&mut self, hash: ContentHash) -> StoreResult<Vec<RecordId>>;

    /// Every persisted `(hash, id)` pair, used to rebuild the hash index
    fn load_all_hashes(&mut self) -> StoreResult<Vec<(ContentHash, RecordId)>>;

    fn record_count(&mut self) -> StoreResult<u64>;

    fn summary(&mut self) -> StoreResult<StoreSummary>;

    fn set_metadata(&mut self, key: &str, value: &str) -> StoreResult<()>;

    fn metadata(&mut self, key: &str) -> StoreResult<Option<String>>;

    /// Finalize the store; calling it again is a no-op
    fn close(&mut self) -> StoreResult<()>;

    fn is_closed(&self) -> bool;
}

/// Commit-or-rollback scope around one transaction
///
/// Dereferences to the store so writes go through the guard. Dropping the
/// guard without calling [`TransactionGuard::commit`] rolls back.
pub struct TransactionGuard<'a, S: RecordStoreEngine + ?Sized> {
    store: &'a mut S,
    finished: bool,
}

impl<'a, S: RecordStoreEngine + ?Sized> TransactionGuard<'a, S> {
    /// Begin a transaction on `store`
    pub fn begin(store: &'a mut S) -> StoreResult<Self> {
        store.begin_transaction()?;
        Ok(Self {
            store,
            finished: false,
        })
    }

    /// Commit the transaction; on failure the guard still rolls back on drop
    pub fn commit(mut self) -> StoreResult<()> {
        self.store.commit()?;
        self.finished = true;
        Ok(())
    }
}

impl<S: RecordStoreEngine + ?Sized> Deref for TransactionGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.store
    }
}

impl<S: RecordStoreEngine + ?Sized> DerefMut for TransactionGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.store
    }
}

impl<S: RecordStoreEngine + ?Sized> Drop for TransactionGuard<'_, S> {
    fn drop(&mut self) {
        if self.finished || !self.store.in_transaction() {
            return;
        }
        if let Err(e) = self.store.rollback() {
            warn!(error = %e, "Rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_roundtrip() {
        for mode in [CreationMode::Create, CreationMode::Append, CreationMode::Update] {
            assert_eq!(mode.as_str().parse::<CreationMode>().unwrap(), mode);
        }
        assert_eq!("UPDATE".parse::<CreationMode>().unwrap(), CreationMode::Update);
        assert!("merge".parse::<CreationMode>().is_err());
    }

    #[test]
    fn test_guard_rolls_back_on_drop() {
        let mut store = MemoryStore::new();
        {
            let mut tx = TransactionGuard::begin(&mut store).unwrap();
            tx.insert_record(b"a", 1, 0).unwrap();
        }
        assert!(!store.in_transaction());
        assert_eq!(store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_guard_commit() {
        let mut store = MemoryStore::new();
        let tx_result = {
            let mut tx = TransactionGuard::begin(&mut store).unwrap();
            tx.insert_record(b"a", 1, 0).unwrap();
            tx.commit()
        };
        assert!(tx_result.is_ok());
        assert_eq!(store.record_count().unwrap(), 1);
    }
}
