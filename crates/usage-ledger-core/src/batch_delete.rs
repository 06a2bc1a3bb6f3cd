//! Bounded-transaction deletion over a materialized candidate set.
//!
//! Retention first writes the ids it wants gone into
//! `temp.retention_candidates`, then hands the table name to a
//! [`BatchDeleter`]. Each batch is its own short transaction, so concurrent
//! writers wait for at most one batch, and a failure part-way through keeps
//! every batch committed before it.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, trace};

use crate::error::Result;

/// Default ids per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

pub(crate) const CANDIDATES_TABLE: &str = "temp.retention_candidates";

/// Create (or empty) the connection-local candidate table.
pub(crate) fn reset_candidates(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS retention_candidates (
            id INTEGER PRIMARY KEY,
            guid TEXT NOT NULL
         );
         DELETE FROM temp.retention_candidates;",
    )?;
    Ok(())
}

pub(crate) fn candidate_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {CANDIDATES_TABLE}"),
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Outcome of a batched delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub deleted: u64,
    pub batches: u64,
}

/// Deletes candidate ids from one table in keyset-ordered batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchDeleter<'t> {
    table: &'t str,
    batch_size: usize,
}

impl<'t> BatchDeleter<'t> {
    #[must_use]
    pub fn new(table: &'t str, batch_size: usize) -> Self {
        Self {
            table,
            batch_size: batch_size.max(1),
        }
    }

    /// Delete every id in the candidate table from `self.table`.
    pub fn run(&self, conn: &Connection) -> Result<BatchOutcome> {
        let upper_sql = format!(
            "SELECT MAX(id) FROM (
                SELECT id FROM {CANDIDATES_TABLE} WHERE id > ?1 ORDER BY id LIMIT ?2
             )"
        );
        let delete_sql = format!(
            "DELETE FROM {table} WHERE id IN (
                SELECT id FROM {CANDIDATES_TABLE} WHERE id > ?1 AND id <= ?2
             )",
            table = self.table
        );

        let mut outcome = BatchOutcome::default();
        let mut last_id = i64::MIN;

        loop {
            let tx = conn.unchecked_transaction()?;
            let upper: Option<i64> = tx
                .query_row(&upper_sql, params![last_id, self.batch_size as i64], |row| {
                    row.get(0)
                })
                .optional()?
                .flatten();
            let Some(upper) = upper else {
                tx.commit()?;
                break;
            };

            let deleted = tx.execute(&delete_sql, params![last_id, upper])?;
            tx.commit()?;

            outcome.deleted += deleted as u64;
            outcome.batches += 1;
            trace!(table = self.table, batch = outcome.batches, deleted, upper, "Deleted batch");
            last_id = upper;
        }

        debug!(
            table = self.table,
            deleted = outcome.deleted,
            batches = outcome.batches,
            "Batched delete finished"
        );
        Ok(outcome)
    }
}
