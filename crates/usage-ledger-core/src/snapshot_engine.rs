//! Snapshot orchestration: placeholder, one-transaction generation, completion.
//!
//! # Architecture
//!
//! ```text
//! SnapshotEngine::populate(snapshot)
//!   └── BEGIN
//!        ├── latest_event(kind)               → checkpoint
//!        ├── for_each_active_resource(source) → ChunkGenerator::push
//!        │      └── SqliteChunkSink           → usage_snapshot_chunks
//!        ├── ChunkGenerator::finish           → GenerationTotals
//!        └── complete_snapshot                → usage_snapshots
//!       COMMIT (or ROLLBACK on any error: no partial chunk set survives)
//! ```
//!
//! Success records `<kind>_usage_snapshot_generation_duration_seconds`;
//! failure increments `<kind>_usage_snapshot_generation_failures_total` and
//! returns the error to the caller. Nothing is retried here.

use std::sync::Arc;
use std::time::Instant;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::active_resources::{ActiveResourceSource, DEFAULT_PAGE_SIZE, for_each_active_resource, source_for};
use crate::chunk_generator::{CHUNK_LIMIT, ChunkGenerator, GenerationTotals, INSERT_BATCH_SIZE};
use crate::error::{Result, SnapshotError};
use crate::ledger::{LedgerKind, latest_event};
use crate::snapshot_store::{self, Snapshot, SqliteChunkSink};
use crate::telemetry::MetricsSink;

/// Sizes used by one generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub chunk_limit: usize,
    pub fetch_batch_size: usize,
    pub insert_batch_size: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            chunk_limit: CHUNK_LIMIT,
            fetch_batch_size: DEFAULT_PAGE_SIZE,
            insert_batch_size: INSERT_BATCH_SIZE,
        }
    }
}

#[must_use]
pub fn duration_metric_name(kind: LedgerKind) -> String {
    format!("{}_snapshot_generation_duration_seconds", kind.model().metric_prefix())
}

#[must_use]
pub fn failure_metric_name(kind: LedgerKind) -> String {
    format!("{}_snapshot_generation_failures_total", kind.model().metric_prefix())
}

/// Orchestrates snapshot creation and generation.
pub struct SnapshotEngine {
    settings: GenerationSettings,
    metrics: Arc<dyn MetricsSink>,
}

impl SnapshotEngine {
    pub fn new(settings: GenerationSettings, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { settings, metrics }
    }

    #[must_use]
    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Create the placeholder a generation job will fill in.
    pub fn request_snapshot(&self, conn: &Connection, kind: LedgerKind) -> Result<Snapshot> {
        snapshot_store::create_placeholder(conn, kind)
    }

    /// Populate `snapshot` from the built-in source for its kind.
    pub fn populate(&self, conn: &Connection, snapshot: &Snapshot) -> Result<Snapshot> {
        let source = source_for(snapshot.kind);
        self.populate_from(conn, snapshot, source.as_ref())
    }

    /// Populate `snapshot` from an explicit source.
    pub fn populate_from(
        &self,
        conn: &Connection,
        snapshot: &Snapshot,
        source: &dyn ActiveResourceSource,
    ) -> Result<Snapshot> {
        if snapshot.is_complete() {
            return Err(SnapshotError::AlreadyComplete(snapshot.guid.clone()).into());
        }

        let started = Instant::now();
        match self.generate(conn, snapshot, source) {
            Ok(totals) => {
                let elapsed = started.elapsed().as_secs_f64();
                let completed = snapshot_store::find_snapshot(conn, &snapshot.guid)?
                    .ok_or_else(|| SnapshotError::NotFound(snapshot.guid.clone()))?;
                info!(
                    kind = %snapshot.kind,
                    snapshot_guid = %snapshot.guid,
                    instances = totals.instance_count,
                    resources = totals.resource_count,
                    parents = totals.parent_count,
                    chunks = totals.chunk_count,
                    skipped = totals.skipped_rows,
                    duration_secs = elapsed,
                    "Usage snapshot generated"
                );
                self.metrics
                    .observe_duration(&duration_metric_name(snapshot.kind), elapsed);
                Ok(completed)
            }
            Err(e) => {
                error!(
                    kind = %snapshot.kind,
                    snapshot_guid = %snapshot.guid,
                    error = %e,
                    "Usage snapshot generation failed"
                );
                self.metrics
                    .increment_counter(&failure_metric_name(snapshot.kind));
                Err(SnapshotError::Generation {
                    snapshot_guid: snapshot.guid.clone(),
                    source: Box::new(e),
                }
                .into())
            }
        }
    }

    fn generate(
        &self,
        conn: &Connection,
        snapshot: &Snapshot,
        source: &dyn ActiveResourceSource,
    ) -> Result<GenerationTotals> {
        let tx = conn.unchecked_transaction()?;

        let checkpoint = latest_event(&tx, snapshot.kind)?;

        let totals = {
            let mut sink = SqliteChunkSink::new(&tx, snapshot.id);
            let mut generator = ChunkGenerator::new(
                &mut sink,
                self.settings.chunk_limit,
                self.settings.insert_batch_size,
            );
            for_each_active_resource(&tx, source, self.settings.fetch_batch_size, |row| {
                generator.push(row)
            })?;
            generator.finish()?
        };

        snapshot_store::complete_snapshot(
            &tx,
            snapshot,
            checkpoint.as_ref(),
            &totals,
            source.tracks_parents(),
        )?;

        tx.commit()?;
        Ok(totals)
    }
}

impl std::fmt::Debug for SnapshotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
