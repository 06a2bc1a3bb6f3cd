//! Ledger retention: decide which old events are safe to delete, then delete
//! them in bounded batches.
//!
//! # Modes
//!
//! 1. Estimate the ledger's row count (statistics first, exact count as a
//!    fallback).
//! 2. If `max_rows > 0` and the estimate exceeds it, run in
//!    [`CleanupMode::SizeExceeded`]; otherwise [`CleanupMode::Normal`].
//!
//! Normal mode composes the enabled policy flags conjunctively:
//!
//! - base: `created_at < cutoff`
//! - `keep_at_least_one_record`: the max-id row is never a candidate
//! - `keep_unprocessed_records`: only rows below the lowest live consumer
//!   watermark; consumers whose watermark row is gone are ignored
//! - `keep_running_records`: an opening row goes only when a closing row for
//!   the same resource, at or after it, is itself a candidate
//!
//! Size-exceeded mode keeps only the base predicate and
//! `keep_at_least_one_record`, and drops every consumer registration whose
//! watermark is about to be deleted.
//!
//! The cutoff is read once from the database clock. Candidates are
//! materialised into a temp table in one statement, then removed by
//! [`BatchDeleter`]. A real run finishes with a bounded `ANALYZE` of the
//! table, which keeps the statistics-based estimate one run behind at most.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch_delete::{BatchDeleter, CANDIDATES_TABLE, DEFAULT_BATCH_SIZE, candidate_count, reset_candidates};
use crate::error::{Error, Result, RetentionError};
use crate::ledger::{LedgerKind, LedgerModel};
use crate::schema::{MS_PER_DAY, db_now_ms, ms_to_datetime};

// =============================================================================
// Policy
// =============================================================================

fn default_cutoff_age_days() -> u32 {
    31
}

fn default_true() -> bool {
    true
}

fn default_max_rows() -> u64 {
    5_000_000
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Retention settings for one ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Events older than this many days are eligible.
    #[serde(default = "default_cutoff_age_days")]
    pub cutoff_age_days: u32,

    #[serde(default = "default_true")]
    pub keep_at_least_one_record: bool,

    #[serde(default = "default_true")]
    pub keep_running_records: bool,

    #[serde(default = "default_true")]
    pub keep_unprocessed_records: bool,

    /// Row ceiling that switches to size-exceeded mode. 0 disables it.
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            cutoff_age_days: default_cutoff_age_days(),
            keep_at_least_one_record: true,
            keep_running_records: true,
            keep_unprocessed_records: true,
            max_rows: default_max_rows(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    Normal,
    SizeExceeded,
}

impl std::fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::SizeExceeded => f.write_str("size_exceeded"),
        }
    }
}

/// What one retention run did (or, for a dry run, would do).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub table: String,
    pub mode: CleanupMode,
    /// Estimate used for mode selection; absent when the ceiling is disabled.
    pub estimated_rows: Option<u64>,
    pub cutoff: DateTime<Utc>,
    pub candidate_rows: u64,
    pub deleted_rows: u64,
    pub removed_consumers: u64,
    pub batches: u64,
    pub dry_run: bool,
}

impl CleanupReport {
    #[must_use]
    pub fn any_work_done(&self) -> bool {
        self.deleted_rows > 0 || self.removed_consumers > 0
    }
}

// =============================================================================
// Row count estimation
// =============================================================================

/// Cheap row count for mode selection.
pub trait RowCountEstimator: Send + Sync {
    fn estimate_rows(&self, conn: &Connection, table: &str) -> Result<u64>;
}

fn exact_count(conn: &Connection, table: &str) -> Result<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Reads the row estimate `ANALYZE` left in `sqlite_stat1`.
///
/// Every non-dry [`RetentionEngine`] run re-analyses its table on the way
/// out, so the estimate lags by the rows appended since the previous run.
/// Falls back to `COUNT(*)` for tables that were never analysed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteStatEstimator;

impl RowCountEstimator for SqliteStatEstimator {
    fn estimate_rows(&self, conn: &Connection, table: &str) -> Result<u64> {
        let has_stats: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_stat1')",
            [],
            |row| row.get(0),
        )?;

        if has_stats {
            let mut stmt = conn.prepare("SELECT stat FROM sqlite_stat1 WHERE tbl = ?1")?;
            let estimate = stmt
                .query_map([table], |row| row.get::<_, String>(0))?
                .filter_map(std::result::Result::ok)
                .filter_map(|stat| stat.split_whitespace().next()?.parse::<u64>().ok())
                .max();
            if let Some(rows) = estimate {
                return Ok(rows);
            }
        }

        debug!(table, "No statistics recorded; counting rows");
        exact_count(conn, table)
    }
}

/// Always `COUNT(*)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactCount;

impl RowCountEstimator for ExactCount {
    fn estimate_rows(&self, conn: &Connection, table: &str) -> Result<u64> {
        exact_count(conn, table)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Retention for one ledger model.
pub struct RetentionEngine {
    model: &'static LedgerModel,
    policy: RetentionPolicy,
    estimator: Box<dyn RowCountEstimator>,
}

impl RetentionEngine {
    #[must_use]
    pub fn new(model: &'static LedgerModel, policy: RetentionPolicy) -> Self {
        Self {
            model,
            policy,
            estimator: Box::new(SqliteStatEstimator),
        }
    }

    #[must_use]
    pub fn for_kind(kind: LedgerKind, policy: RetentionPolicy) -> Self {
        Self::new(kind.model(), policy)
    }

    #[must_use]
    pub fn with_estimator(mut self, estimator: impl RowCountEstimator + 'static) -> Self {
        self.estimator = Box::new(estimator);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Delete every eligible event.
    pub fn run(&self, conn: &Connection) -> Result<CleanupReport> {
        self.execute(conn, false)
    }

    /// Compute the mode and candidate set without deleting anything.
    pub fn dry_run(&self, conn: &Connection) -> Result<CleanupReport> {
        self.execute(conn, true)
    }

    fn execute(&self, conn: &Connection, dry_run: bool) -> Result<CleanupReport> {
        let table = self.model.table;
        let (mode, estimated_rows) = self.select_mode(conn)?;

        let now_ms = db_now_ms(conn)?;
        let window_ms = i64::from(self.policy.cutoff_age_days).saturating_mul(MS_PER_DAY);
        let cutoff_ms = now_ms.saturating_sub(window_ms);

        self.materialize_candidates(conn, mode, cutoff_ms)
            .map_err(|e| deletion_error(table, &e))?;
        let candidate_rows = candidate_count(conn).map_err(|e| deletion_error(table, &e))?;

        let mut report = CleanupReport {
            table: table.to_string(),
            mode,
            estimated_rows,
            cutoff: ms_to_datetime(cutoff_ms),
            candidate_rows,
            deleted_rows: 0,
            removed_consumers: 0,
            batches: 0,
            dry_run,
        };

        info!(
            table,
            mode = %mode,
            candidates = candidate_rows,
            cutoff_age_days = self.policy.cutoff_age_days,
            dry_run,
            "Usage event cleanup selected rows"
        );

        if mode == CleanupMode::SizeExceeded {
            report.removed_consumers = if dry_run {
                self.count_orphaned_consumers(conn)
            } else {
                self.remove_orphaned_consumers(conn)
            }
            .map_err(|e| deletion_error(table, &e))?;
        }

        if !dry_run && candidate_rows > 0 {
            let outcome = BatchDeleter::new(table, self.policy.batch_size)
                .run(conn)
                .map_err(|e| deletion_error(table, &e))?;
            report.deleted_rows = outcome.deleted;
            report.batches = outcome.batches;
        }

        reset_candidates(conn)?;

        if !dry_run {
            if let Err(e) = refresh_statistics(conn, table) {
                warn!(table, error = %e, "Statistics refresh failed; next row estimate may be stale");
            }
            if report.any_work_done() {
                info!(
                    table,
                    mode = %mode,
                    deleted = report.deleted_rows,
                    removed_consumers = report.removed_consumers,
                    batches = report.batches,
                    "Usage event cleanup finished"
                );
            }
        }

        Ok(report)
    }

    fn select_mode(&self, conn: &Connection) -> Result<(CleanupMode, Option<u64>)> {
        if self.policy.max_rows == 0 {
            return Ok((CleanupMode::Normal, None));
        }

        let table = self.model.table;
        let estimate = self
            .estimator
            .estimate_rows(conn, table)
            .map_err(|e| RetentionError::Estimation {
                table: table.to_string(),
                reason: e.to_string(),
            })?;

        let mode = if estimate > self.policy.max_rows {
            warn!(
                table,
                estimated_rows = estimate,
                max_rows = self.policy.max_rows,
                "Usage event table over its row ceiling; consumer and pairing protections bypassed"
            );
            CleanupMode::SizeExceeded
        } else {
            CleanupMode::Normal
        };
        Ok((mode, Some(estimate)))
    }

    /// Non-pairing clauses applied to the row aliased `alias`.
    fn row_clauses(&self, alias: &str, mode: CleanupMode) -> Vec<String> {
        let model = self.model;
        let table = model.table;

        let mut clauses = vec![format!("{alias}.created_at < ?1")];
        if self.policy.keep_at_least_one_record {
            clauses.push(format!("{alias}.id < (SELECT MAX(id) FROM {table})"));
        }
        if mode == CleanupMode::Normal && self.policy.keep_unprocessed_records {
            clauses.push(format!(
                "{alias}.id < COALESCE(
                    (SELECT MIN(w.id) FROM {consumers} r JOIN {table} w ON w.guid = r.last_processed_guid),
                    {max})",
                consumers = model.consumer_table,
                max = i64::MAX,
            ));
        }
        clauses
    }

    /// Candidate predicate for `mode`, with `?1` bound to the cutoff.
    ///
    /// An opening row qualifies only through a closing row that passes the
    /// same clauses, so a pair is never split.
    fn candidate_predicate(&self, mode: CleanupMode) -> String {
        let model = self.model;
        let mut clauses = self.row_clauses("e", mode);

        if mode == CleanupMode::Normal && self.policy.keep_running_records && model.has_pairing {
            clauses.push(format!(
                "(e.state <> '{opening}' OR EXISTS (
                    SELECT 1 FROM {table} closing
                    WHERE closing.{res} = e.{res}
                      AND closing.state = '{closing}'
                      AND closing.created_at >= e.created_at
                      AND {closing_clauses}))",
                table = model.table,
                opening = model.opening_state.as_db_str(),
                closing = model.closing_state.as_db_str(),
                res = model.resource_guid_column,
                closing_clauses = self.row_clauses("closing", mode).join("\n                      AND "),
            ));
        }

        clauses.join("\n  AND ")
    }

    fn materialize_candidates(&self, conn: &Connection, mode: CleanupMode, cutoff_ms: i64) -> Result<()> {
        reset_candidates(conn)?;
        let sql = format!(
            "INSERT INTO {CANDIDATES_TABLE} (id, guid)
             SELECT e.id, e.guid FROM {table} e
             WHERE {predicate}",
            table = self.model.table,
            predicate = self.candidate_predicate(mode),
        );
        conn.execute(&sql, [cutoff_ms])?;
        Ok(())
    }

    fn count_orphaned_consumers(&self, conn: &Connection) -> Result<u64> {
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE last_processed_guid IN (SELECT guid FROM {CANDIDATES_TABLE})",
                self.model.consumer_table
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn remove_orphaned_consumers(&self, conn: &Connection) -> Result<u64> {
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE last_processed_guid IN (SELECT guid FROM {CANDIDATES_TABLE})",
                self.model.consumer_table
            ),
            [],
        )?;
        if removed > 0 {
            warn!(
                table = self.model.consumer_table,
                removed, "Removed consumers whose watermark is being deleted"
            );
        }
        Ok(removed as u64)
    }
}

/// Rows `ANALYZE` samples per index when refreshing statistics.
pub const ANALYSIS_LIMIT: u32 = 1000;

/// Re-analyse `table` so the next [`SqliteStatEstimator`] read reflects this
/// run's deletions. `analysis_limit` keeps the cost independent of table size.
fn refresh_statistics(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!("PRAGMA analysis_limit = {ANALYSIS_LIMIT}; ANALYZE {table};"))?;
    debug!(table, "Refreshed table statistics");
    Ok(())
}

fn deletion_error(table: &str, e: &Error) -> Error {
    RetentionError::Deletion {
        table: table.to_string(),
        reason: e.to_string(),
    }
    .into()
}

impl std::fmt::Debug for RetentionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionEngine")
            .field("table", &self.model.table)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
