//! screendb - Concurrent Screening-Database Builder
//!
//! Builds deduplicated screening databases from a stream of pre-encoded
//! records. Each record carries encoded bytes and zero or more derived
//! payloads (for example one per conformation, with per-feature-type
//! counts). Records are stored in SQLite, keyed by a 64-bit content hash.
//!
//! # Features
//!
//! - **Content-hash dedup**: reject records already present in this session
//!   or, in APPEND mode, already persisted.
//!
//! - **UPDATE mode**: an incoming record replaces every stored record with
//!   the same hash in one transaction.
//!
//! - **Per-record atomicity**: a record and all its derived rows commit or
//!   roll back together.
//!
//! - **Parallel ingestion**: N threads share one source cursor. Thread 0
//!   writes the output database, the rest write temporary stores that are
//!   merged at the end under the same dedup policy.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────┐
//!                  │   RecordSource (JSONL)   │
//!                  └────────────┬─────────────┘
//!                               │ mutex-guarded cursor
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//!   ┌─────────────┐      ┌─────────────┐      ┌─────────────┐
//!   │  Worker 0   │      │  Worker 1   │ ...  │ Worker N-1  │
//!   │  Creator    │      │  Creator    │      │  Creator    │
//!   └──────┬──────┘      └──────┬──────┘      └──────┬──────┘
//!          │                    │                    │
//!          ▼                    ▼                    ▼
//!   ┌─────────────┐      ┌─────────────┐      ┌─────────────┐
//!   │ output.db   │◄─────│ temp store  │      │ temp store  │
//!   │             │◄─────┼─────────────┼──────│             │
//!   └─────────────┘merge └─────────────┘      └─────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Build with dedup on 8 threads
//! screendb build records.jsonl -o screen.db --drop-duplicates -j 8
//!
//! # Replace stored records with newer versions
//! screendb build fixes.jsonl -o screen.db --mode update
//!
//! # Inspect
//! screendb info screen.db
//! ```

pub mod config;
pub mod creator;
pub mod error;
pub mod hash;
pub mod ingest;
pub mod progress;
pub mod record;
pub mod source;
pub mod store;

pub use config::{BuildConfig, CliArgs};
pub use creator::{DatabaseCreator, MergeOutcome, ProcessOutcome, StatsSnapshot, Statistics};
pub use error::{Result, ScreenDbError};
pub use ingest::{BuildSummary, DatabaseBuilder};
pub use record::{DerivedRecord, Record, RecordAccessor, RecordSource};
pub use store::{CreationMode, RecordStoreEngine};
