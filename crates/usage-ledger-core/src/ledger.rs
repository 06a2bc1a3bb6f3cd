//! Append-only usage event ledgers.
//!
//! There is one ledger table per [`LedgerKind`]. Rows are never updated after
//! insert; `id` order equals `created_at` order. Each kind is described by a
//! static [`LedgerModel`] record so retention and snapshots never branch on
//! the kind directly.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::schema::{datetime_to_ms, db_now_ms, ms_to_datetime};

// =============================================================================
// Kinds and models
// =============================================================================

/// Which usage ledger an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// Application process lifecycle events.
    Process,
    /// Service instance lifecycle events.
    Service,
}

impl LedgerKind {
    pub const ALL: [Self; 2] = [Self::Process, Self::Service];

    #[must_use]
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Service => "service",
        }
    }

    #[must_use]
    pub fn from_db_str(value: &str) -> Option<Self> {
        match value {
            "process" | "app" => Some(Self::Process),
            "service" => Some(Self::Service),
            _ => None,
        }
    }

    /// The static table/state description for this kind.
    #[must_use]
    pub fn model(self) -> &'static LedgerModel {
        match self {
            Self::Process => &PROCESS_USAGE,
            Self::Service => &SERVICE_USAGE,
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for LedgerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_db_str(s).ok_or_else(|| format!("unknown ledger kind {s:?} (expected process or service)"))
    }
}

impl ToSql for LedgerKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_db_str()))
    }
}

impl FromSql for LedgerKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::from_db_str(s).ok_or_else(|| FromSqlError::Other(format!("unknown ledger kind {s:?}").into()))
    }
}

/// Table, column, and pairing description of one ledger.
///
/// Retention reads this record instead of inspecting which ledger it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerModel {
    pub kind: LedgerKind,
    pub table: &'static str,
    pub consumer_table: &'static str,
    pub resource_guid_column: &'static str,
    pub opening_state: EventState,
    pub closing_state: EventState,
    pub has_pairing: bool,
}

impl LedgerModel {
    /// Metric name prefix, e.g. `process_usage`.
    #[must_use]
    pub fn metric_prefix(&self) -> &'static str {
        match self.kind {
            LedgerKind::Process => "process_usage",
            LedgerKind::Service => "service_usage",
        }
    }
}

pub const PROCESS_USAGE: LedgerModel = LedgerModel {
    kind: LedgerKind::Process,
    table: "process_usage_events",
    consumer_table: "process_usage_consumers",
    resource_guid_column: "app_guid",
    opening_state: EventState::Started,
    closing_state: EventState::Stopped,
    has_pairing: true,
};

pub const SERVICE_USAGE: LedgerModel = LedgerModel {
    kind: LedgerKind::Service,
    table: "service_usage_events",
    consumer_table: "service_usage_consumers",
    resource_guid_column: "service_instance_guid",
    opening_state: EventState::Created,
    closing_state: EventState::Deleted,
    has_pairing: true,
};

// =============================================================================
// Events
// =============================================================================

/// Lifecycle state recorded by a ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventState {
    Started,
    Stopped,
    BuildpackSet,
    TaskStarted,
    TaskStopped,
    Created,
    Updated,
    Deleted,
}

impl EventState {
    #[must_use]
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::BuildpackSet => "BUILDPACK_SET",
            Self::TaskStarted => "TASK_STARTED",
            Self::TaskStopped => "TASK_STOPPED",
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Deleted => "DELETED",
        }
    }

    #[must_use]
    pub fn from_db_str(value: &str) -> Option<Self> {
        Some(match value {
            "STARTED" => Self::Started,
            "STOPPED" => Self::Stopped,
            "BUILDPACK_SET" => Self::BuildpackSet,
            "TASK_STARTED" => Self::TaskStarted,
            "TASK_STOPPED" => Self::TaskStopped,
            "CREATED" => Self::Created,
            "UPDATED" => Self::Updated,
            "DELETED" => Self::Deleted,
            _ => return None,
        })
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for EventState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_db_str(&s.to_ascii_uppercase()).ok_or_else(|| format!("unknown event state {s:?}"))
    }
}

impl ToSql for EventState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_db_str()))
    }
}

impl FromSql for EventState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::from_db_str(s).ok_or_else(|| FromSqlError::Other(format!("unknown event state {s:?}").into()))
    }
}

/// One immutable ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: i64,
    pub guid: String,
    pub created_at: DateTime<Utc>,
    pub state: EventState,
    pub resource_guid: String,
    pub resource_name: Option<String>,
    pub org_guid: Option<String>,
    pub space_guid: Option<String>,
    pub space_name: Option<String>,
    pub payload: serde_json::Value,
}

/// A producer-side event awaiting append.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewLedgerEvent {
    /// Defaults to a fresh UUID v4.
    pub guid: Option<String>,
    /// Defaults to the database clock.
    pub created_at: Option<DateTime<Utc>>,
    pub state: Option<EventState>,
    pub resource_guid: String,
    pub resource_name: Option<String>,
    pub org_guid: Option<String>,
    pub space_guid: Option<String>,
    pub space_name: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl NewLedgerEvent {
    #[must_use]
    pub fn new(state: EventState, resource_guid: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            resource_guid: resource_guid.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    #[must_use]
    pub fn in_space(
        mut self,
        org_guid: impl Into<String>,
        space_guid: impl Into<String>,
        space_name: impl Into<String>,
    ) -> Self {
        self.org_guid = Some(org_guid.into());
        self.space_guid = Some(space_guid.into());
        self.space_name = Some(space_name.into());
        self
    }

    #[must_use]
    pub fn named(mut self, resource_name: impl Into<String>) -> Self {
        self.resource_name = Some(resource_name.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

fn select_columns(model: &LedgerModel) -> String {
    format!(
        "SELECT id, guid, created_at, state, {resource}, resource_name, org_guid, space_guid,
                space_name, payload
         FROM {table}",
        resource = model.resource_guid_column,
        table = model.table,
    )
}

struct RawEvent {
    event: LedgerEvent,
    payload: String,
}

fn raw_event(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        event: LedgerEvent {
            id: row.get(0)?,
            guid: row.get(1)?,
            created_at: ms_to_datetime(row.get(2)?),
            state: row.get(3)?,
            resource_guid: row.get(4)?,
            resource_name: row.get(5)?,
            org_guid: row.get(6)?,
            space_guid: row.get(7)?,
            space_name: row.get(8)?,
            payload: serde_json::Value::Null,
        },
        payload: row.get(9)?,
    })
}

impl RawEvent {
    fn decode(self) -> Result<LedgerEvent> {
        let mut event = self.event;
        event.payload = serde_json::from_str(&self.payload)?;
        Ok(event)
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Append one event to the ledger for `kind` and return the stored row.
pub fn append_event(conn: &Connection, kind: LedgerKind, event: &NewLedgerEvent) -> Result<LedgerEvent> {
    let model = kind.model();
    let state = event.state.unwrap_or(model.opening_state);
    let guid = event
        .guid
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let created_at_ms = match &event.created_at {
        Some(at) => datetime_to_ms(at),
        None => db_now_ms(conn)?,
    };
    let payload = serde_json::to_string(event.payload.as_ref().unwrap_or(&serde_json::json!({})))?;

    let sql = format!(
        "INSERT INTO {table}
         (guid, created_at, state, {resource}, resource_name, org_guid, space_guid, space_name, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        table = model.table,
        resource = model.resource_guid_column,
    );
    conn.prepare_cached(&sql)?.execute(params![
        guid,
        created_at_ms,
        state,
        event.resource_guid,
        event.resource_name,
        event.org_guid,
        event.space_guid,
        event.space_name,
        payload,
    ])?;
    let id = conn.last_insert_rowid();
    debug!(kind = %kind, id, guid = %guid, state = %state, "Appended usage event");

    find_event(conn, kind, &guid)?
        .ok_or_else(|| StorageError::NotFound(format!("{} event {guid}", kind)).into())
}

/// The checkpoint provider: the newest event by id, if any.
pub fn latest_event(conn: &Connection, kind: LedgerKind) -> Result<Option<LedgerEvent>> {
    let sql = format!("{} ORDER BY id DESC LIMIT 1", select_columns(kind.model()));
    conn.query_row(&sql, [], raw_event)
        .optional()?
        .map(RawEvent::decode)
        .transpose()
}

pub fn find_event(conn: &Connection, kind: LedgerKind, guid: &str) -> Result<Option<LedgerEvent>> {
    let sql = format!("{} WHERE guid = ?1", select_columns(kind.model()));
    conn.query_row(&sql, [guid], raw_event)
        .optional()?
        .map(RawEvent::decode)
        .transpose()
}

/// Events strictly after `after_guid` in id order, at most `limit` of them.
///
/// `None` reads from the start of the ledger. A guid that is no longer in the
/// ledger is reported as not found so the consumer re-establishes a watermark.
pub fn events_after(
    conn: &Connection,
    kind: LedgerKind,
    after_guid: Option<&str>,
    limit: usize,
) -> Result<Vec<LedgerEvent>> {
    let model = kind.model();
    let after_id = match after_guid {
        Some(guid) => {
            let sql = format!("SELECT id FROM {} WHERE guid = ?1", model.table);
            conn.query_row(&sql, [guid], |row| row.get::<_, i64>(0))
                .optional()?
                .ok_or_else(|| StorageError::NotFound(format!("{kind} event {guid}")))?
        }
        None => 0,
    };

    let sql = format!("{} WHERE id > ?1 ORDER BY id ASC LIMIT ?2", select_columns(model));
    let mut stmt = conn.prepare_cached(&sql)?;
    let raws = stmt
        .query_map(params![after_id, limit as i64], raw_event)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawEvent::decode).collect()
}

/// Exact row count of the ledger for `kind`.
pub fn count_events(conn: &Connection, kind: LedgerKind) -> Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", kind.model().table);
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count as u64)
}
