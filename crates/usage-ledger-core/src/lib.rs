//! usage-ledger-core: append-only usage event ledgers with point-in-time
//! snapshots and consumer-aware retention.
//!
//! # Architecture
//!
//! ```text
//! producers → Ledger (process / service events) ← consumers (watermarks)
//!                 │                                       │
//!                 ├── Snapshot engine: checkpoint + chunked active resources
//!                 └── Retention engine: cutoff, pairing, watermarks → batched delete
//! ```
//!
//! # Modules
//!
//! - `schema`: SQLite schema, connection setup, database clock
//! - `ledger`: ledger kinds, models, event append and polling
//! - `consumers`: consumer registrations and watermarks
//! - `active_resources`: paged active-resource views over the inventory tables
//! - `chunk_generator`: streaming rows into fixed-size per-space chunks
//! - `snapshot_store`: snapshot and chunk persistence
//! - `snapshot_engine`: one-transaction snapshot generation
//! - `retention`: retention policies, modes, and row estimation
//! - `batch_delete`: keyset batched deletion
//! - `jobs`: scheduler-facing entry points
//! - `telemetry`: metrics sink and in-process registry
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `error`: error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod active_resources;
pub mod batch_delete;
pub mod chunk_generator;
pub mod config;
pub mod consumers;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod logging;
pub mod retention;
pub mod schema;
pub mod snapshot_engine;
pub mod snapshot_store;
pub mod telemetry;

pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{EventState, LedgerEvent, LedgerKind, NewLedgerEvent};
pub use retention::{CleanupMode, CleanupReport, RetentionEngine, RetentionPolicy};
pub use snapshot_engine::{GenerationSettings, SnapshotEngine};
pub use snapshot_store::{Snapshot, SnapshotState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
