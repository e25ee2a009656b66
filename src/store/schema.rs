//! Database schema definitions and creation
//!
//! This module defines the SQLite schema for storing records and their
//! derived data, and provides functions to create, drop and check it.

use crate::error::StoreResult;
use rusqlite::Connection;

/// Current schema version; opens of any other version are refused
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the records table
/// Note: INTEGER PRIMARY KEY without AUTOINCREMENT. Ids of deleted records
/// may be reused, which is fine since nothing outside the file refers to them.
const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY,
    content_hash INTEGER NOT NULL,   -- u64 stored bit-for-bit as i64
    encoded BLOB NOT NULL,
    derived_count INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL to create the derived records table (one row per conformation)
const CREATE_DERIVED_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS derived (
    record_id INTEGER NOT NULL,
    derived_index INTEGER NOT NULL,
    encoded BLOB NOT NULL,

    PRIMARY KEY (record_id, derived_index),
    FOREIGN KEY (record_id) REFERENCES records(id) ON DELETE CASCADE
)
"#;

/// SQL to create the per-derived-record feature counts table
const CREATE_FEATURES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS derived_features (
    record_id INTEGER NOT NULL,
    derived_index INTEGER NOT NULL,
    feature_type INTEGER NOT NULL,
    count INTEGER NOT NULL,

    PRIMARY KEY (record_id, derived_index, feature_type),
    FOREIGN KEY (record_id, derived_index)
        REFERENCES derived(record_id, derived_index) ON DELETE CASCADE
)
"#;

/// SQL to create database metadata table
const CREATE_DB_INFO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS db_info (
    key TEXT PRIMARY KEY,
    value TEXT
)
"#;

/// Hash lookups happen on every UPDATE-mode insert, so the index exists
/// from the start rather than being built after loading
const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_records_hash ON records(content_hash)",
];

const DROP_TABLES: &str = r#"
DROP TABLE IF EXISTS derived_features;
DROP TABLE IF EXISTS derived;
DROP TABLE IF EXISTS records;
DROP TABLE IF EXISTS db_info;
"#;

/// Tables a compatible database must contain
pub const REQUIRED_TABLES: &[&str] = &["records", "derived", "derived_features", "db_info"];

/// SQLite pragmas applied to every connection that writes
const WRITE_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA cache_size = -64000;      -- 64MB cache
PRAGMA temp_store = MEMORY;
PRAGMA wal_autocheckpoint = 10000;
"#;

/// Configure a connection for writing
pub fn apply_write_pragmas(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(WRITE_PRAGMAS)?;
    Ok(())
}

/// Create tables and indexes if they do not exist
pub fn create_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute(CREATE_RECORDS_TABLE, [])?;
    conn.execute(CREATE_DERIVED_TABLE, [])?;
    conn.execute(CREATE_FEATURES_TABLE, [])?;
    conn.execute(CREATE_DB_INFO_TABLE, [])?;

    for sql in CREATE_INDEXES {
        conn.execute(sql, [])?;
    }

    set_db_info(conn, keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
    Ok(())
}

/// Drop every table this engine owns
pub fn drop_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(DROP_TABLES)?;
    Ok(())
}

/// Check that an existing database carries this engine's schema
///
/// Returns a human-readable reason on mismatch.
pub fn check_schema(conn: &Connection) -> StoreResult<Result<(), String>> {
    for table in REQUIRED_TABLES {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        if count == 0 {
            return Ok(Err(format!("missing table '{}'", table)));
        }
    }

    match get_db_info(conn, keys::SCHEMA_VERSION)? {
        Some(v) if v == SCHEMA_VERSION.to_string() => Ok(Ok(())),
        Some(v) => Ok(Err(format!(
            "schema version {} (expected {})",
            v, SCHEMA_VERSION
        ))),
        None => Ok(Err("missing schema version".to_string())),
    }
}

/// Store database metadata
pub fn set_db_info(conn: &Connection, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO db_info (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Get database metadata
pub fn get_db_info(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    let result = conn.query_row(
        "SELECT value FROM db_info WHERE key = ?1",
        [key],
        |row| row.get(0),
    );

    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Metadata keys used by the engine
pub mod keys {
    /// Schema version
    pub const SCHEMA_VERSION: &str = "schema_version";

    /// Engine version that last wrote the file
    pub const ENGINE_VERSION: &str = "engine_version";

    /// Creation mode of the last build: "create", "append", "update"
    pub const MODE: &str = "mode";

    /// Timestamp the schema was created (RFC 3339)
    pub const CREATED_AT: &str = "created_at";

    /// Timestamp of the last completed build (RFC 3339)
    pub const UPDATED_AT: &str = "updated_at";

    /// Build status: "building", "completed", "interrupted"
    pub const STATUS: &str = "status";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_schema() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='records'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(check_schema(&conn).unwrap(), Ok(()));
    }

    #[test]
    fn test_check_schema_empty_database() {
        let conn = Connection::open_in_memory().unwrap();
        let verdict = check_schema(&conn).unwrap();
        assert_eq!(verdict, Err("missing table 'records'".to_string()));
    }

    #[test]
    fn test_check_schema_version_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        set_db_info(&conn, keys::SCHEMA_VERSION, "99").unwrap();

        let verdict = check_schema(&conn).unwrap();
        assert!(verdict.unwrap_err().contains("99"));
    }

    #[test]
    fn test_drop_schema() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        drop_schema(&conn).unwrap();

        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type='table'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_db_info() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();

        set_db_info(&conn, "test_key", "test_value").unwrap();
        assert_eq!(get_db_info(&conn, "test_key").unwrap(), Some("test_value".to_string()));
        assert_eq!(get_db_info(&conn, "nonexistent").unwrap(), None);
    }
}
