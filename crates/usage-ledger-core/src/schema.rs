//! SQLite schema, connection setup, and the database clock.
//!
//! All timestamps are INTEGER epoch milliseconds. "Now" for any
//! time-sensitive decision is read from SQLite itself via [`db_now_ms`], so
//! every process sharing a database file agrees on the cutoff.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tracing::debug;

use crate::error::{Result, StorageError};

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Ledger, consumer, and snapshot tables.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS process_usage_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    state TEXT NOT NULL,
    app_guid TEXT NOT NULL,
    resource_name TEXT,
    org_guid TEXT,
    space_guid TEXT,
    space_name TEXT,
    payload TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_process_usage_events_created_at
    ON process_usage_events(created_at);
CREATE INDEX IF NOT EXISTS idx_process_usage_events_resource_state
    ON process_usage_events(app_guid, state);

CREATE TABLE IF NOT EXISTS service_usage_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    state TEXT NOT NULL,
    service_instance_guid TEXT NOT NULL,
    resource_name TEXT,
    org_guid TEXT,
    space_guid TEXT,
    space_name TEXT,
    payload TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_service_usage_events_created_at
    ON service_usage_events(created_at);
CREATE INDEX IF NOT EXISTS idx_service_usage_events_resource_state
    ON service_usage_events(service_instance_guid, state);

CREATE TABLE IF NOT EXISTS process_usage_consumers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    consumer_guid TEXT NOT NULL UNIQUE,
    last_processed_guid TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_process_usage_consumers_watermark
    ON process_usage_consumers(last_processed_guid);

CREATE TABLE IF NOT EXISTS service_usage_consumers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    consumer_guid TEXT NOT NULL UNIQUE,
    last_processed_guid TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_service_usage_consumers_watermark
    ON service_usage_consumers(last_processed_guid);

CREATE TABLE IF NOT EXISTS usage_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL CHECK (kind IN ('process', 'service')),
    created_at INTEGER NOT NULL,
    completed_at INTEGER,
    checkpoint_event_guid TEXT,
    checkpoint_event_created_at INTEGER,
    instance_count INTEGER NOT NULL DEFAULT 0,
    organization_count INTEGER NOT NULL DEFAULT 0,
    space_count INTEGER NOT NULL DEFAULT 0,
    parent_count INTEGER,
    resource_count INTEGER NOT NULL DEFAULT 0,
    chunk_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_usage_snapshots_kind_created
    ON usage_snapshots(kind, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_snapshots_one_in_progress
    ON usage_snapshots(kind) WHERE completed_at IS NULL;

CREATE TABLE IF NOT EXISTS usage_snapshot_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES usage_snapshots(id) ON DELETE CASCADE,
    organization_guid TEXT NOT NULL,
    organization_name TEXT,
    space_guid TEXT NOT NULL,
    space_name TEXT,
    chunk_index INTEGER NOT NULL,
    items TEXT NOT NULL,
    UNIQUE (snapshot_id, space_guid, chunk_index)
);
";

/// Platform inventory tables read by the active-resource sources.
///
/// Owned by the platform; created here only so a standalone database is usable.
pub const INVENTORY_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS organizations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS spaces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    organization_id INTEGER NOT NULL REFERENCES organizations(id)
);

CREATE TABLE IF NOT EXISTS apps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    space_guid TEXT NOT NULL,
    droplet_guid TEXT
);

CREATE TABLE IF NOT EXISTS droplets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    app_guid TEXT NOT NULL,
    buildpack_receipt_buildpack_guid TEXT,
    buildpack_receipt_buildpack TEXT
);

CREATE TABLE IF NOT EXISTS processes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    app_guid TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'web',
    state TEXT NOT NULL DEFAULT 'STOPPED',
    instances INTEGER,
    memory INTEGER
);
CREATE INDEX IF NOT EXISTS idx_processes_state ON processes(state);

CREATE TABLE IF NOT EXISTS service_brokers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    label TEXT NOT NULL,
    service_broker_id INTEGER REFERENCES service_brokers(id)
);

CREATE TABLE IF NOT EXISTS service_plans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    service_id INTEGER REFERENCES services(id)
);

CREATE TABLE IF NOT EXISTS service_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    space_id INTEGER NOT NULL REFERENCES spaces(id),
    service_plan_id INTEGER REFERENCES service_plans(id),
    is_gateway_service INTEGER NOT NULL DEFAULT 1
);
";

/// Open a connection with the pragmas every usage-ledger connection needs.
pub fn open_connection(path: &Path, busy_timeout_ms: u64) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL; PRAGMA busy_timeout={busy_timeout_ms}; PRAGMA foreign_keys=ON;"
    ))?;
    Ok(conn)
}

/// Create all tables if missing and stamp the schema version.
///
/// Refuses to touch a database stamped by a newer version.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            current,
            supported: SCHEMA_VERSION,
        }
        .into());
    }

    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(INVENTORY_SCHEMA_SQL)?;

    if current < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        debug!(from = current, to = SCHEMA_VERSION, "Stamped schema version");
    }
    Ok(())
}

/// Current time according to the database, in epoch milliseconds.
pub fn db_now_ms(conn: &Connection) -> Result<i64> {
    let now = conn.query_row(
        "SELECT CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER)",
        [],
        |row| row.get(0),
    )?;
    Ok(now)
}

/// Convert stored epoch milliseconds into a UTC timestamp.
#[must_use]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Convert a UTC timestamp into stored epoch milliseconds.
#[must_use]
pub fn datetime_to_ms(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) const MS_PER_DAY: i64 = 86_400_000;
pub(crate) const MS_PER_MINUTE: i64 = 60_000;

#[cfg(test)]
pub(crate) fn test_connection() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    initialize_schema(&conn).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn initialize_creates_all_tables() {
        let conn = test_connection();
        let names = table_names(&conn);
        for expected in [
            "process_usage_events",
            "service_usage_events",
            "process_usage_consumers",
            "service_usage_consumers",
            "usage_snapshots",
            "usage_snapshot_chunks",
            "organizations",
            "spaces",
            "apps",
            "droplets",
            "processes",
            "service_brokers",
            "services",
            "service_plans",
            "service_instances",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn initialize_is_idempotent_and_stamps_version() {
        let conn = test_connection();
        initialize_schema(&conn).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 99").unwrap();
        let err = initialize_schema(&conn).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::SchemaTooNew { current: 99, .. })
        ));
    }

    #[test]
    fn db_clock_is_close_to_wall_clock() {
        let conn = test_connection();
        let db_now = db_now_ms(&conn).unwrap();
        let wall = Utc::now().timestamp_millis();
        assert!((db_now - wall).abs() < 5_000, "db={db_now} wall={wall}");
    }

    #[test]
    fn ms_datetime_conversion() {
        let at = ms_to_datetime(1_700_000_000_123);
        assert_eq!(datetime_to_ms(&at), 1_700_000_000_123);
    }

    #[test]
    fn only_one_in_progress_snapshot_per_kind() {
        let conn = test_connection();
        conn.execute(
            "INSERT INTO usage_snapshots (guid, kind, created_at) VALUES ('a', 'process', 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO usage_snapshots (guid, kind, created_at) VALUES ('b', 'service', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO usage_snapshots (guid, kind, created_at) VALUES ('c', 'process', 0)",
            [],
        );
        assert!(dup.is_err());
    }
}
