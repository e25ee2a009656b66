//! Record types and the read/write interfaces around them
//!
//! The engine never looks inside a record. Structure parsing, normalization
//! and feature generation happen upstream; what arrives here is already
//! encoded bytes plus zero or more derived payloads (one per conformation).

use crate::error::{SourceResult, StoreError, StoreResult};
use crate::hash::{content_hash, ContentHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Feature type code to number of features of that type
pub type FeatureCounts = BTreeMap<u16, u32>;

/// Data derived from a record for one sub-state (e.g. one conformation)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DerivedRecord {
    /// Encoded derived payload
    pub encoded: Vec<u8>,

    /// Per-feature-type counts used for index-level statistics
    #[serde(default)]
    pub features: FeatureCounts,
}

impl DerivedRecord {
    pub fn new(encoded: impl Into<Vec<u8>>, features: FeatureCounts) -> Self {
        Self {
            encoded: encoded.into(),
            features,
        }
    }
}

/// One normalized structural unit submitted for storage
#[derive(Debug, Clone)]
pub struct Record {
    /// Filled on first use unless supplied by the caller
    hash: OnceLock<ContentHash>,
    encoded: Vec<u8>,
    derived: Vec<DerivedRecord>,
}

impl Record {
    /// Create a record hashed from its encoded bytes
    ///
    /// The hash is computed on the first call to [`Record::content_hash`],
    /// on whichever thread processes the record.
    pub fn new(encoded: impl Into<Vec<u8>>, derived: Vec<DerivedRecord>) -> Self {
        Self {
            hash: OnceLock::new(),
            encoded: encoded.into(),
            derived,
        }
    }

    /// Create a record with a hash computed by the caller
    ///
    /// Normalizers that fingerprint a canonical form rather than the encoded
    /// bytes supply their hash here.
    pub fn with_hash(
        hash: ContentHash,
        encoded: impl Into<Vec<u8>>,
        derived: Vec<DerivedRecord>,
    ) -> Self {
        Self {
            hash: OnceLock::from(hash),
            encoded: encoded.into(),
            derived,
        }
    }

    pub fn content_hash(&self) -> ContentHash {
        *self.hash.get_or_init(|| content_hash(&self.encoded))
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn derived(&self) -> &[DerivedRecord] {
        &self.derived
    }

    pub fn derived_count(&self) -> usize {
        self.derived.len()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.content_hash() == other.content_hash()
            && self.encoded == other.encoded
            && self.derived == other.derived
    }
}

impl Eq for Record {}

/// Producer of records for ingestion
///
/// Reading is split in two stages. [`RecordSource::next_raw`] advances the
/// cursor and must be cheap; the ingestion controller calls it under its
/// lock. [`RecordSource::decode`] turns the raw item into a record and runs
/// on the worker after the lock is released.
pub trait RecordSource: Send {
    /// Undecoded item as read from the underlying stream
    type Raw;

    /// Read the next raw item, or `None` at end of stream
    fn next_raw(&mut self) -> SourceResult<Option<Self::Raw>>;

    /// Decode a raw item; needs no access to the source
    fn decode(raw: Self::Raw) -> SourceResult<Record>;

    /// Read and decode the next record, or `None` at end of stream
    fn next_record(&mut self) -> SourceResult<Option<Record>> {
        self.next_raw()?.map(Self::decode).transpose()
    }

    /// Total number of records, if known up front (0 when unknown)
    fn record_count(&self) -> usize;

    /// Number of records handed out so far
    fn current_index(&self) -> usize;
}

/// Read-only view of a store, consumed by merge
///
/// Indices run from `0` to `num_records() - 1` in the store's insertion
/// order. Accessors are iterated sequentially from a single thread.
pub trait RecordAccessor {
    fn num_records(&self) -> usize;

    fn content_hash(&mut self, idx: usize) -> StoreResult<ContentHash>;

    fn get_encoded(&mut self, idx: usize) -> StoreResult<Vec<u8>>;

    /// Derived records of record `idx`, ordered by derived index
    fn get_derived_records(&mut self, idx: usize) -> StoreResult<Vec<DerivedRecord>>;

    /// Reassemble record `idx` with its persisted hash
    fn get_record(&mut self, idx: usize) -> StoreResult<Record> {
        let hash = self.content_hash(idx)?;
        let encoded = self.get_encoded(idx)?;
        let derived = self.get_derived_records(idx)?;
        Ok(Record::with_hash(hash, encoded, derived))
    }
}

/// In-memory record source
#[derive(Debug, Default)]
pub struct VecSource {
    records: std::vec::IntoIter<Record>,
    total: usize,
    position: usize,
}

impl VecSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            total: records.len(),
            records: records.into_iter(),
            position: 0,
        }
    }
}

impl RecordSource for VecSource {
    type Raw = Record;

    fn next_raw(&mut self) -> SourceResult<Option<Record>> {
        let next = self.records.next();
        if next.is_some() {
            self.position += 1;
        }
        Ok(next)
    }

    fn decode(raw: Record) -> SourceResult<Record> {
        Ok(raw)
    }

    fn record_count(&self) -> usize {
        self.total
    }

    fn current_index(&self) -> usize {
        self.position
    }
}

/// In-memory accessor, mostly useful for feeding merge directly
impl RecordAccessor for Vec<Record> {
    fn num_records(&self) -> usize {
        self.len()
    }

    fn content_hash(&mut self, idx: usize) -> StoreResult<ContentHash> {
        Ok(record_at(self, idx)?.content_hash())
    }

    fn get_encoded(&mut self, idx: usize) -> StoreResult<Vec<u8>> {
        Ok(record_at(self, idx)?.encoded.clone())
    }

    fn get_derived_records(&mut self, idx: usize) -> StoreResult<Vec<DerivedRecord>> {
        Ok(record_at(self, idx)?.derived.clone())
    }

    fn get_record(&mut self, idx: usize) -> StoreResult<Record> {
        record_at(self, idx).cloned()
    }
}

fn record_at(records: &[Record], idx: usize) -> StoreResult<&Record> {
    records.get(idx).ok_or(StoreError::IndexOutOfRange {
        idx,
        len: records.len(),
    })
}
