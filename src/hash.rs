//! Content hashing and the in-memory hash index
//!
//! Records are deduplicated by a stable 64-bit fingerprint of their encoded
//! bytes. The fingerprint is the first 8 bytes of a SHA-256 digest, read as
//! a big-endian integer, so it is identical across runs, platforms and
//! compiler versions and can be persisted alongside the record.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Stable 64-bit content fingerprint
pub type ContentHash = u64;

/// Row id of a record inside a store
pub type RecordId = i64;

/// Compute the content hash of an encoded record
///
/// # Example
///
/// ```
/// use screendb::hash::content_hash;
///
/// let a = content_hash(b"c1ccccc1");
/// assert_eq!(a, content_hash(b"c1ccccc1"));
/// assert_ne!(a, content_hash(b"c1ccncc1"));
/// ```
pub fn content_hash(encoded: &[u8]) -> ContentHash {
    let digest = Sha256::digest(encoded);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Multimap from content hash to the record ids carrying it
///
/// Built once from the persisted `(hash, id)` pairs when a database is
/// opened, then kept in step with committed inserts and deletes.
#[derive(Debug, Default, Clone)]
pub struct HashIndex {
    ids: HashMap<ContentHash, Vec<RecordId>>,
    len: usize,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from persisted pairs
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (ContentHash, RecordId)>,
    {
        let mut index = Self::new();
        for (hash, id) in pairs {
            index.insert(hash, id);
        }
        index
    }

    pub fn contains(&self, hash: ContentHash) -> bool {
        self.ids.contains_key(&hash)
    }

    /// Ids sharing `hash`, in insertion order
    pub fn ids(&self, hash: ContentHash) -> &[RecordId] {
        self.ids.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn insert(&mut self, hash: ContentHash, id: RecordId) {
        self.ids.entry(hash).or_default().push(id);
        self.len += 1;
    }

    /// Remove a single `(hash, id)` pair; returns whether it was present
    pub fn remove(&mut self, hash: ContentHash, id: RecordId) -> bool {
        let Some(ids) = self.ids.get_mut(&hash) else {
            return false;
        };
        let Some(pos) = ids.iter().position(|&existing| existing == id) else {
            return false;
        };
        ids.remove(pos);
        if ids.is_empty() {
            self.ids.remove(&hash);
        }
        self.len -= 1;
        true
    }

    /// Number of `(hash, id)` pairs
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct hashes
    pub fn distinct_hashes(&self) -> usize {
        self.ids.len()
    }
}
