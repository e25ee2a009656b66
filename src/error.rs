//! Error types for screendb
//!
//! This module defines the error hierarchy for the engine:
//! - Persistence errors from the record store (open, schema, SQLite)
//! - Record source errors (reading and parsing input)
//! - Configuration and CLI errors
//! - Worker thread errors (spawn, panic, first-error aggregation)
//!
//! Dedup rejections are not errors. They are reported as
//! [`crate::creator::ProcessOutcome::Rejected`].

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for screendb
#[derive(Error, Debug)]
pub enum ScreenDbError {
    /// Record store errors (open, schema, persistence)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A per-record transaction failed during a merge; the merge is aborted
    #[error("Transaction failed for record {record}: {source}")]
    Transaction {
        record: usize,
        #[source]
        source: StoreError,
    },

    /// Record source errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors (temporary files, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted on a creator that is not open
    #[error("Database '{name}' is not open")]
    NotOpen { name: String },
}

/// Record store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to open or create the database file
    #[error("Failed to open database at '{path}': {reason}")]
    Open { path: PathBuf, reason: String },

    /// Existing file does not carry a compatible schema
    #[error("Incompatible schema in '{path}': {reason}")]
    IncompatibleSchema { path: PathBuf, reason: String },

    /// Store has already been closed
    #[error("Store has been closed")]
    Closed,

    /// Commit or rollback without an open transaction
    #[error("No transaction is active")]
    NoTransaction,

    /// Accessor index past the end of the store
    #[error("Record index {idx} out of range (store holds {len})")]
    IndexOutOfRange { idx: usize, len: usize },

    /// Failure reported by a non-SQLite backend
    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Record source errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// Failed to read the input
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line could not be decoded into a record
    #[error("Malformed record on line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid thread count
    #[error("Invalid thread count {count}: must be at most {max}")]
    InvalidThreadCount { count: usize, max: usize },

    /// Output path error
    #[error("Invalid output path '{path}': {reason}")]
    InvalidOutputPath { path: PathBuf, reason: String },

    /// Temporary directory error
    #[error("Invalid temporary directory '{path}': {reason}")]
    InvalidTmpDir { path: PathBuf, reason: String },

    /// Input file error
    #[error("Invalid input '{path}': {reason}")]
    InvalidInput { path: PathBuf, reason: String },
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },

    /// Thread could not be created
    #[error("Failed to spawn worker {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },

    /// First error recorded by any worker during ingestion
    #[error("Ingestion failed: {message}")]
    Failed { message: String },
}

/// Result type alias for ScreenDbError
pub type Result<T> = std::result::Result<T, ScreenDbError>;

/// Result type alias for StoreError
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for SourceError
pub type SourceResult<T> = std::result::Result<T, SourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let store_err = StoreError::Closed;
        let err: ScreenDbError = store_err.into();
        assert!(matches!(err, ScreenDbError::Store(StoreError::Closed)));
    }

    #[test]
    fn test_transaction_error_message() {
        let err = ScreenDbError::Transaction {
            record: 4,
            source: StoreError::Backend("disk full".into()),
        };
        assert_eq!(
            err.to_string(),
            "Transaction failed for record 4: Backend failure: disk full"
        );
    }
}
