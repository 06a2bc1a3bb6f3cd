//! Scheduler-facing jobs.
//!
//! Each job runs once per invocation (`max_attempts() == 1`) and reports
//! failure to its caller; a job runner decides whether to schedule another.
//! The `*_async` variants open their own connection on the blocking pool.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StorageConfig;
use crate::error::{Error, Result, SnapshotError};
use crate::ledger::LedgerKind;
use crate::retention::{CleanupReport, RetentionEngine, RetentionPolicy};
use crate::schema::{MS_PER_DAY, MS_PER_MINUTE, db_now_ms};
use crate::snapshot_engine::SnapshotEngine;
use crate::snapshot_store::{self, Snapshot};

const MAX_ATTEMPTS: u32 = 1;

async fn on_blocking_pool<T, F>(storage: StorageConfig, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = storage.open()?;
        work(&conn)
    })
    .await
    .map_err(|e| Error::Runtime(format!("blocking job task failed: {e}")))?
}

// =============================================================================
// Snapshot generation
// =============================================================================

/// Fill in a previously requested snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotGeneratorJob {
    pub snapshot_guid: String,
}

impl SnapshotGeneratorJob {
    #[must_use]
    pub fn new(snapshot_guid: impl Into<String>) -> Self {
        Self {
            snapshot_guid: snapshot_guid.into(),
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        MAX_ATTEMPTS
    }

    pub fn perform(&self, conn: &Connection, engine: &SnapshotEngine) -> Result<Snapshot> {
        let snapshot = snapshot_store::find_snapshot(conn, &self.snapshot_guid)?
            .ok_or_else(|| SnapshotError::NotFound(self.snapshot_guid.clone()))?;

        info!(kind = %snapshot.kind, snapshot_guid = %snapshot.guid, "Starting usage snapshot generation");
        let completed = engine.populate(conn, &snapshot)?;
        info!(
            kind = %completed.kind,
            snapshot_guid = %completed.guid,
            chunks = completed.summary.chunk_count,
            "Completed usage snapshot generation"
        );
        Ok(completed)
    }

    pub async fn perform_async(self, storage: StorageConfig, engine: Arc<SnapshotEngine>) -> Result<Snapshot> {
        on_blocking_pool(storage, move |conn| self.perform(conn, &engine)).await
    }
}

// =============================================================================
// Snapshot cleanup
// =============================================================================

/// Counts removed by one [`SnapshotCleanupJob`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCleanupReport {
    pub completed_deleted: u64,
    pub stale_deleted: u64,
}

/// Delete old completed snapshots and abandoned placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCleanupJob {
    pub kind: LedgerKind,
    pub cutoff_age_days: u32,
    pub stale_after_minutes: u32,
}

impl SnapshotCleanupJob {
    #[must_use]
    pub fn new(kind: LedgerKind, cutoff_age_days: u32) -> Self {
        Self {
            kind,
            cutoff_age_days,
            stale_after_minutes: 60,
        }
    }

    #[must_use]
    pub fn with_stale_after_minutes(mut self, minutes: u32) -> Self {
        self.stale_after_minutes = minutes;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        MAX_ATTEMPTS
    }

    pub fn perform(&self, conn: &Connection) -> Result<SnapshotCleanupReport> {
        let now = db_now_ms(conn)?;
        let completed_cutoff = now.saturating_sub(i64::from(self.cutoff_age_days).saturating_mul(MS_PER_DAY));
        let stale_cutoff = now.saturating_sub(i64::from(self.stale_after_minutes).saturating_mul(MS_PER_MINUTE));

        let report = SnapshotCleanupReport {
            completed_deleted: snapshot_store::delete_completed_before(conn, self.kind, completed_cutoff)? as u64,
            stale_deleted: snapshot_store::delete_in_progress_before(conn, self.kind, stale_cutoff)? as u64,
        };
        info!(
            kind = %self.kind,
            completed_deleted = report.completed_deleted,
            stale_deleted = report.stale_deleted,
            "Usage snapshot cleanup finished"
        );
        Ok(report)
    }

    pub async fn perform_async(self, storage: StorageConfig) -> Result<SnapshotCleanupReport> {
        on_blocking_pool(storage, move |conn| self.perform(conn)).await
    }
}

// =============================================================================
// Ledger cleanup
// =============================================================================

/// Run retention for one ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCleanupJob {
    pub kind: LedgerKind,
    pub policy: RetentionPolicy,
}

impl LedgerCleanupJob {
    #[must_use]
    pub fn new(kind: LedgerKind, policy: RetentionPolicy) -> Self {
        Self { kind, policy }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        MAX_ATTEMPTS
    }

    pub fn perform(&self, conn: &Connection) -> Result<CleanupReport> {
        RetentionEngine::for_kind(self.kind, self.policy.clone()).run(conn)
    }

    pub async fn perform_async(self, storage: StorageConfig) -> Result<CleanupReport> {
        on_blocking_pool(storage, move |conn| self.perform(conn)).await
    }
}
