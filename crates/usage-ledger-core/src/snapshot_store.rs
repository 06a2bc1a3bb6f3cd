//! Persistence for usage snapshots and their chunks.
//!
//! A snapshot starts as a placeholder (`completed_at IS NULL`, counts zero)
//! and is completed exactly once. The partial unique index on
//! `usage_snapshots(kind) WHERE completed_at IS NULL` keeps at most one
//! placeholder per kind, regardless of how many callers race to create one.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::active_resources::UsageItem;
use crate::chunk_generator::{ChunkSink, GenerationTotals, PendingChunk};
use crate::error::{Result, SnapshotError};
use crate::ledger::{LedgerEvent, LedgerKind};
use crate::schema::{datetime_to_ms, db_now_ms, ms_to_datetime};

/// Lifecycle state derived from `completed_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Processing,
    Complete,
}

/// Summary counts recorded when generation completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Process instances, or service instances for service snapshots.
    pub instance_count: i64,
    pub organization_count: u64,
    pub space_count: u64,
    /// Distinct apps; absent for service snapshots.
    pub parent_count: Option<u64>,
    pub resource_count: u64,
    pub chunk_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(skip)]
    pub id: i64,
    pub guid: String,
    pub kind: LedgerKind,
    pub state: SnapshotState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checkpoint_event_guid: Option<String>,
    pub checkpoint_event_created_at: Option<DateTime<Utc>>,
    pub summary: SnapshotSummary,
}

impl Snapshot {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One stored chunk with its items decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub organization_guid: String,
    pub organization_name: Option<String>,
    pub space_guid: String,
    pub space_name: Option<String>,
    pub chunk_index: i64,
    pub items: Vec<UsageItem>,
}

/// A page of chunks plus the total across all pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPage {
    pub total: u64,
    pub offset: u64,
    pub chunks: Vec<SnapshotChunk>,
}

const SNAPSHOT_COLUMNS: &str = "id, guid, kind, created_at, completed_at, checkpoint_event_guid,
    checkpoint_event_created_at, instance_count, organization_count, space_count, parent_count,
    resource_count, chunk_count";

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let completed_at: Option<i64> = row.get(4)?;
    let checkpoint_created: Option<i64> = row.get(6)?;
    let parent_count: Option<i64> = row.get(10)?;
    Ok(Snapshot {
        id: row.get(0)?,
        guid: row.get(1)?,
        kind: row.get(2)?,
        state: if completed_at.is_some() {
            SnapshotState::Complete
        } else {
            SnapshotState::Processing
        },
        created_at: ms_to_datetime(row.get(3)?),
        completed_at: completed_at.map(ms_to_datetime),
        checkpoint_event_guid: row.get(5)?,
        checkpoint_event_created_at: checkpoint_created.map(ms_to_datetime),
        summary: SnapshotSummary {
            instance_count: row.get(7)?,
            organization_count: row.get::<_, i64>(8)? as u64,
            space_count: row.get::<_, i64>(9)? as u64,
            parent_count: parent_count.map(|c| c as u64),
            resource_count: row.get::<_, i64>(11)? as u64,
            chunk_count: row.get::<_, i64>(12)? as u64,
        },
    })
}

/// Insert a zero-count placeholder snapshot for `kind`.
///
/// Fails with [`SnapshotError::GenerationInProgress`] while another
/// placeholder of the same kind exists.
pub fn create_placeholder(conn: &Connection, kind: LedgerKind) -> Result<Snapshot> {
    if find_in_progress(conn, kind)?.is_some() {
        return Err(SnapshotError::GenerationInProgress {
            kind: kind.to_string(),
        }
        .into());
    }

    let guid = uuid::Uuid::new_v4().to_string();
    let now = db_now_ms(conn)?;
    let inserted = conn.execute(
        "INSERT INTO usage_snapshots (guid, kind, created_at) VALUES (?1, ?2, ?3)",
        params![guid, kind, now],
    );
    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            return Err(SnapshotError::GenerationInProgress {
                kind: kind.to_string(),
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    }

    info!(kind = %kind, snapshot_guid = %guid, "Created usage snapshot placeholder");
    find_snapshot(conn, &guid)?.ok_or_else(|| SnapshotError::NotFound(guid).into())
}

pub fn find_snapshot(conn: &Connection, guid: &str) -> Result<Option<Snapshot>> {
    let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM usage_snapshots WHERE guid = ?1");
    Ok(conn.query_row(&sql, [guid], snapshot_from_row).optional()?)
}

/// The placeholder currently being generated for `kind`, if any.
pub fn find_in_progress(conn: &Connection, kind: LedgerKind) -> Result<Option<Snapshot>> {
    let sql = format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM usage_snapshots WHERE kind = ?1 AND completed_at IS NULL"
    );
    Ok(conn.query_row(&sql, [kind], snapshot_from_row).optional()?)
}

/// Snapshots newest first, optionally restricted to one kind.
pub fn list_snapshots(
    conn: &Connection,
    kind: Option<LedgerKind>,
    offset: u64,
    limit: u64,
) -> Result<Vec<Snapshot>> {
    let sql = format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM usage_snapshots
         WHERE (?1 IS NULL OR kind = ?1)
         ORDER BY created_at DESC, id DESC
         LIMIT ?2 OFFSET ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![kind, limit as i64, offset as i64], snapshot_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Delete a snapshot; its chunks go with it. Returns whether a row existed.
pub fn delete_snapshot(conn: &Connection, guid: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM usage_snapshots WHERE guid = ?1", [guid])?;
    if deleted > 0 {
        info!(snapshot_guid = %guid, "Deleted usage snapshot");
    }
    Ok(deleted > 0)
}

/// Chunks ordered by `(space_guid, chunk_index)`.
///
/// Refused while the snapshot is still processing.
pub fn chunks_page(conn: &Connection, snapshot: &Snapshot, offset: u64, limit: u64) -> Result<ChunkPage> {
    if !snapshot.is_complete() {
        return Err(SnapshotError::StillProcessing(snapshot.guid.clone()).into());
    }

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM usage_snapshot_chunks WHERE snapshot_id = ?1",
        [snapshot.id],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare_cached(
        "SELECT organization_guid, organization_name, space_guid, space_name, chunk_index, items
         FROM usage_snapshot_chunks
         WHERE snapshot_id = ?1
         ORDER BY space_guid, chunk_index
         LIMIT ?2 OFFSET ?3",
    )?;
    let raw = stmt
        .query_map(params![snapshot.id, limit as i64, offset as i64], |row| {
            Ok((
                SnapshotChunk {
                    organization_guid: row.get(0)?,
                    organization_name: row.get(1)?,
                    space_guid: row.get(2)?,
                    space_name: row.get(3)?,
                    chunk_index: row.get(4)?,
                    items: Vec::new(),
                },
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let chunks = raw
        .into_iter()
        .map(|(mut chunk, items)| -> Result<SnapshotChunk> {
            chunk.items = serde_json::from_str(&items)?;
            Ok(chunk)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ChunkPage {
        total: total as u64,
        offset,
        chunks,
    })
}

/// Record checkpoint, counts, and completion on a placeholder.
///
/// Only a still-processing snapshot is updated.
pub fn complete_snapshot(
    conn: &Connection,
    snapshot: &Snapshot,
    checkpoint: Option<&LedgerEvent>,
    totals: &GenerationTotals,
    tracks_parents: bool,
) -> Result<()> {
    let now = db_now_ms(conn)?;
    let updated = conn.execute(
        "UPDATE usage_snapshots SET
            checkpoint_event_guid = ?2,
            checkpoint_event_created_at = ?3,
            instance_count = ?4,
            organization_count = ?5,
            space_count = ?6,
            parent_count = ?7,
            resource_count = ?8,
            chunk_count = ?9,
            completed_at = ?10
         WHERE id = ?1 AND completed_at IS NULL",
        params![
            snapshot.id,
            checkpoint.map(|e| e.guid.as_str()),
            checkpoint.map(|e| datetime_to_ms(&e.created_at)),
            totals.instance_count,
            totals.organization_count as i64,
            totals.space_count as i64,
            tracks_parents.then_some(totals.parent_count as i64),
            totals.resource_count as i64,
            totals.chunk_count as i64,
            now,
        ],
    )?;
    if updated == 0 {
        return Err(SnapshotError::AlreadyComplete(snapshot.guid.clone()).into());
    }
    Ok(())
}

/// Delete completed snapshots of `kind` created before `cutoff_ms`.
pub fn delete_completed_before(conn: &Connection, kind: LedgerKind, cutoff_ms: i64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM usage_snapshots
         WHERE kind = ?1 AND completed_at IS NOT NULL AND created_at < ?2",
        params![kind, cutoff_ms],
    )?;
    Ok(deleted)
}

/// Delete placeholders of `kind` created before `cutoff_ms`.
pub fn delete_in_progress_before(conn: &Connection, kind: LedgerKind, cutoff_ms: i64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM usage_snapshots
         WHERE kind = ?1 AND completed_at IS NULL AND created_at < ?2",
        params![kind, cutoff_ms],
    )?;
    Ok(deleted)
}

/// [`ChunkSink`] writing into `usage_snapshot_chunks` for one snapshot.
#[derive(Debug)]
pub struct SqliteChunkSink<'c> {
    conn: &'c Connection,
    snapshot_id: i64,
    inserted: u64,
}

impl<'c> SqliteChunkSink<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection, snapshot_id: i64) -> Self {
        Self {
            conn,
            snapshot_id,
            inserted: 0,
        }
    }

    #[must_use]
    pub fn inserted(&self) -> u64 {
        self.inserted
    }
}

impl ChunkSink for SqliteChunkSink<'_> {
    fn insert_chunks(&mut self, chunks: &[PendingChunk]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO usage_snapshot_chunks
             (snapshot_id, organization_guid, organization_name, space_guid, space_name,
              chunk_index, items)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for chunk in chunks {
            stmt.execute(params![
                self.snapshot_id,
                chunk.organization_guid,
                chunk.organization_name,
                chunk.space_guid,
                chunk.space_name,
                chunk.chunk_index,
                chunk.items,
            ])?;
        }
        self.inserted += chunks.len() as u64;
        debug!(snapshot_id = self.snapshot_id, batch = chunks.len(), "Inserted snapshot chunks");
        Ok(())
    }
}
