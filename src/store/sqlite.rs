//! SQLite record store
//!
//! One database file per store. Every write happens inside an explicit
//! `BEGIN IMMEDIATE` / `COMMIT` pair driven by the creator, and statements
//! are prepared once and cached on the connection.
//!
//! [`SqliteAccessor`] is the read side used by merge: it opens a finished
//! store without creating anything, switches the connection to query-only,
//! and walks records in id order.

use crate::error::{StoreError, StoreResult};
use crate::hash::{ContentHash, RecordId};
use crate::record::{DerivedRecord, RecordAccessor};
use crate::store::schema::{self, keys};
use crate::store::{CreationMode, RecordStoreEngine, StoreSummary};
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Production record store backed by a SQLite file
pub struct SqliteStore {
    /// `None` once closed
    conn: Option<Connection>,

    /// Database path (":memory:" for in-memory stores)
    path: PathBuf,
}

impl SqliteStore {
    /// Open a store at `path`
    ///
    /// `Create` drops any existing schema and creates a fresh one. Other
    /// modes attach to an existing database and refuse files that do not
    /// carry this engine's schema.
    pub fn open(path: &Path, mode: CreationMode) -> StoreResult<Self> {
        let open_failed = |e: StoreError| StoreError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let conn = Connection::open(path).map_err(|e| open_failed(e.into()))?;
        schema::apply_write_pragmas(&conn).map_err(open_failed)?;

        let store = Self {
            conn: Some(conn),
            path: path.to_path_buf(),
        };
        store.prepare_schema(mode)?;

        debug!(path = %path.display(), mode = %mode, "Store opened");
        Ok(store)
    }

    /// Open a fresh in-memory store (tests and benchmarks)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let store = Self {
            conn: Some(conn),
            path: PathBuf::from(":memory:"),
        };
        store.prepare_schema(CreationMode::Create)?;
        Ok(store)
    }

    /// Database path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> StoreResult<&Connection> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    fn prepare_schema(&self, mode: CreationMode) -> StoreResult<()> {
        let conn = self.conn()?;

        if mode == CreationMode::Create {
            let tx = conn.unchecked_transaction()?;
            schema::drop_schema(&tx)?;
            schema::create_schema(&tx)?;
            schema::set_db_info(&tx, keys::CREATED_AT, &chrono::Utc::now().to_rfc3339())?;
            tx.commit()?;
            return Ok(());
        }

        match schema::check_schema(conn)? {
            Ok(()) => Ok(()),
            Err(reason) => Err(StoreError::IncompatibleSchema {
                path: self.path.clone(),
                reason,
            }),
        }
    }
}

impl RecordStoreEngine for SqliteStore {
    fn begin_transaction(&mut self) -> StoreResult<()> {
        let conn = self.conn()?;
        assert!(
            conn.is_autocommit(),
            "begin_transaction called while a transaction is open"
        );
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let conn = self.conn()?;
        if conn.is_autocommit() {
            return Err(StoreError::NoTransaction);
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let conn = self.conn()?;
        if conn.is_autocommit() {
            return Err(StoreError::NoTransaction);
        }
        conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.is_autocommit())
    }

    fn insert_record(
        &mut self,
        encoded: &[u8],
        hash: ContentHash,
        derived_count: usize,
    ) -> StoreResult<RecordId> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "INSERT INTO records (content_hash, encoded, derived_count) VALUES (?1, ?2, ?3)",
        )?;
        stmt.execute(params![hash as i64, encoded, derived_count as i64])?;
        Ok(conn.last_insert_rowid())
    }

    fn insert_derived(
        &mut self,
        id: RecordId,
        derived_index: usize,
        derived: &DerivedRecord,
    ) -> StoreResult<()> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare_cached(
            "INSERT INTO derived (record_id, derived_index, encoded) VALUES (?1, ?2, ?3)",
        )?;
        stmt.execute(params![id, derived_index as i64, derived.encoded])?;

        let mut feature_stmt = conn.prepare_cached(
            "INSERT INTO derived_features (record_id, derived_index, feature_type, count)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (feature_type, count) in &derived.features {
            feature_stmt.execute(params![id, derived_index as i64, feature_type, count])?;
        }
        Ok(())
    }

    fn delete_record(&mut self, id: RecordId) -> StoreResult<()> {
        let conn = self.conn()?;
        // derived and derived_features rows go with it via ON DELETE CASCADE
        let mut stmt = conn.prepare_cached("DELETE FROM records WHERE id = ?1")?;
        stmt.execute(params![id])?;
        Ok(())
    }

    fn lookup_ids_by_hash(&mut self, hash: ContentHash) -> StoreResult<Vec<RecordId>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT id FROM records WHERE content_hash = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![hash as i64], |row| row.get(0))?
            .collect::<Result<Vec<RecordId>, _>>()?;
        Ok(ids)
    }

    fn load_all_hashes(&mut self) -> StoreResult<Vec<(ContentHash, RecordId)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT content_hash, id FROM records ORDER BY id")?;
        let pairs = stmt
            .query_map([], |row| {
                let hash: i64 = row.get(0)?;
                Ok((hash as u64, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    fn record_count(&mut self) -> StoreResult<u64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn summary(&mut self) -> StoreResult<StoreSummary> {
        query_summary(self.conn()?)
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> StoreResult<()> {
        schema::set_db_info(self.conn()?, key, value)
    }

    fn metadata(&mut self, key: &str) -> StoreResult<Option<String>> {
        schema::get_db_info(self.conn()?, key)
    }

    fn close(&mut self) -> StoreResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        if !conn.is_autocommit() {
            warn!(path = %self.path.display(), "Closing store with an open transaction, rolling back");
            conn.execute_batch("ROLLBACK")?;
        }
        conn.execute_batch("PRAGMA optimize;")?;
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;

        debug!(path = %self.path.display(), "Store closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}

/// Compute index-level statistics for a connection
fn query_summary(conn: &Connection) -> StoreResult<StoreSummary> {
    let count = |sql: &str| -> StoreResult<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    };

    let mut summary = StoreSummary {
        records: count("SELECT COUNT(*) FROM records")?,
        derived_records: count("SELECT COUNT(*) FROM derived")?,
        distinct_hashes: count("SELECT COUNT(DISTINCT content_hash) FROM records")?,
        feature_totals: Default::default(),
    };

    let mut stmt = conn.prepare(
        "SELECT feature_type, SUM(count) FROM derived_features
         GROUP BY feature_type ORDER BY feature_type",
    )?;
    let rows = stmt.query_map([], |row| {
        let feature_type: u16 = row.get(0)?;
        let total: i64 = row.get(1)?;
        Ok((feature_type, total))
    })?;
    for row in rows {
        let (feature_type, total) = row?;
        let total = u64::try_from(total)
            .map_err(|_| StoreError::Backend(format!("negative feature total {}", total)))?;
        summary.feature_totals.insert(feature_type, total);
    }

    Ok(summary)
}

/// Read-only sequential view over a finished SQLite store
pub struct SqliteAccessor {
    conn: Connection,

    /// Record ids in insertion order; accessor index `i` maps to `ids[i]`
    ids: Vec<RecordId>,

    path: PathBuf,
}

impl SqliteAccessor {
    /// Open an existing store for reading
    ///
    /// Fails if the file does not exist or does not carry this engine's
    /// schema. The store must not be open for writing elsewhere.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        conn.execute_batch("PRAGMA query_only = ON;")?;

        if let Err(reason) = schema::check_schema(&conn)? {
            return Err(StoreError::IncompatibleSchema {
                path: path.to_path_buf(),
                reason,
            });
        }

        let ids = {
            let mut stmt = conn.prepare("SELECT id FROM records ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<RecordId>, _>>()?;
            ids
        };

        debug!(path = %path.display(), records = ids.len(), "Accessor opened");
        Ok(Self {
            conn,
            ids,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index-level statistics of the store
    pub fn summary(&self) -> StoreResult<StoreSummary> {
        query_summary(&self.conn)
    }

    pub fn metadata(&self, key: &str) -> StoreResult<Option<String>> {
        schema::get_db_info(&self.conn, key)
    }

    /// All metadata pairs, ordered by key
    pub fn all_metadata(&self) -> StoreResult<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, COALESCE(value, '') FROM db_info ORDER BY key")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    fn id_at(&self, idx: usize) -> StoreResult<RecordId> {
        self.ids
            .get(idx)
            .copied()
            .ok_or(StoreError::IndexOutOfRange {
                idx,
                len: self.ids.len(),
            })
    }
}

impl RecordAccessor for SqliteAccessor {
    fn num_records(&self) -> usize {
        self.ids.len()
    }

    fn content_hash(&mut self, idx: usize) -> StoreResult<ContentHash> {
        let id = self.id_at(idx)?;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT content_hash FROM records WHERE id = ?1")?;
        let hash: i64 = stmt.query_row(params![id], |row| row.get(0))?;
        Ok(hash as u64)
    }

    fn get_encoded(&mut self, idx: usize) -> StoreResult<Vec<u8>> {
        let id = self.id_at(idx)?;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT encoded FROM records WHERE id = ?1")?;
        let encoded = stmt.query_row(params![id], |row| row.get(0))?;
        Ok(encoded)
    }

    fn get_derived_records(&mut self, idx: usize) -> StoreResult<Vec<DerivedRecord>> {
        let id = self.id_at(idx)?;

        let mut derived: Vec<(i64, DerivedRecord)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT derived_index, encoded FROM derived
                 WHERE record_id = ?1 ORDER BY derived_index",
            )?;
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((row.get(0)?, DerivedRecord::new(row.get::<_, Vec<u8>>(1)?, Default::default())))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut stmt = self.conn.prepare_cached(
            "SELECT derived_index, feature_type, count FROM derived_features
             WHERE record_id = ?1 ORDER BY derived_index, feature_type",
        )?;
        let features = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, u16>(1)?, row.get::<_, u32>(2)?))
        })?;
        for row in features {
            let (derived_index, feature_type, count) = row?;
            if let Some((_, record)) = derived.iter_mut().find(|(i, _)| *i == derived_index) {
                record.features.insert(feature_type, count);
            }
        }

        Ok(derived.into_iter().map(|(_, record)| record).collect())
    }
}
