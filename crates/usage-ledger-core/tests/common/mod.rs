//! Shared fixtures for usage-ledger-core integration tests.
//!
//! ```ignore
//! mod common;
//! use common::TestDb;
//! ```

#![allow(dead_code)]

use chrono::{Duration, Utc};
use rusqlite::{Connection, params};
use tempfile::TempDir;

use usage_ledger_core::config::StorageConfig;
use usage_ledger_core::ledger::{EventState, LedgerEvent, LedgerKind, NewLedgerEvent, append_event};

/// A schema-initialised database in its own temp directory.
pub struct TestDb {
    pub storage: StorageConfig,
    pub conn: Connection,
    _dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            db_path: dir.path().join("usage-ledger.db"),
            ..StorageConfig::default()
        };
        let conn = storage.open().unwrap();
        Self {
            storage,
            conn,
            _dir: dir,
        }
    }

    // ---- inventory ----

    pub fn org(&self, guid: &str) -> i64 {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO organizations (guid, name) VALUES (?1, ?1 || '-name')",
                [guid],
            )
            .unwrap();
        self.conn
            .query_row("SELECT id FROM organizations WHERE guid = ?1", [guid], |r| r.get(0))
            .unwrap()
    }

    pub fn space(&self, org_guid: &str, space_guid: &str) -> i64 {
        let org_id = self.org(org_guid);
        self.conn
            .execute(
                "INSERT OR IGNORE INTO spaces (guid, name, organization_id) VALUES (?1, ?1 || '-name', ?2)",
                params![space_guid, org_id],
            )
            .unwrap();
        self.conn
            .query_row("SELECT id FROM spaces WHERE guid = ?1", [space_guid], |r| r.get(0))
            .unwrap()
    }

    /// A started web process with `instances` instances.
    pub fn process(&self, space_guid: &str, app_guid: &str, process_guid: &str, instances: i64) {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO apps (guid, name, space_guid) VALUES (?1, ?1 || '-name', ?2)",
                [app_guid, space_guid],
            )
            .unwrap();
        self.conn
            .execute(
                "INSERT INTO processes (guid, app_guid, type, state, instances, memory)
                 VALUES (?1, ?2, 'web', 'STARTED', ?3, 1024)",
                params![process_guid, app_guid, instances],
            )
            .unwrap();
    }

    pub fn service_instance(&self, space_guid: &str, guid: &str, managed: bool) {
        let space_id: i64 = self
            .conn
            .query_row("SELECT id FROM spaces WHERE guid = ?1", [space_guid], |r| r.get(0))
            .unwrap();
        self.conn
            .execute(
                "INSERT INTO service_instances (guid, name, space_id, is_gateway_service)
                 VALUES (?1, ?1 || '-name', ?2, ?3)",
                params![guid, space_id, managed],
            )
            .unwrap();
    }

    // ---- ledger ----

    /// Append an event `days_ago` days old.
    pub fn event(&self, kind: LedgerKind, guid: &str, state: EventState, resource: &str, days_ago: i64) -> LedgerEvent {
        append_event(
            &self.conn,
            kind,
            &NewLedgerEvent::new(state, resource)
                .with_guid(guid)
                .at(Utc::now() - Duration::days(days_ago)),
        )
        .unwrap()
    }

    pub fn event_guids(&self, kind: LedgerKind) -> Vec<String> {
        let table = kind.model().table;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT guid FROM {table} ORDER BY id"))
            .unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }
}
