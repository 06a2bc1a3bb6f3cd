//! Read-only "active resource" views over the platform inventory tables.
//!
//! Each source yields rows ordered by `(space_guid, resource_id)` in pages,
//! using keyset pagination so a page costs the same no matter how deep into
//! the listing it is.

use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Result;
use crate::ledger::LedgerKind;

/// Rows fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Per-process chunk item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessUsageItem {
    pub app_guid: String,
    pub app_name: String,
    pub process_guid: String,
    pub process_type: String,
    pub instance_count: Option<i64>,
    pub memory_in_mb_per_instance: Option<i64>,
    pub buildpack_guid: Option<String>,
    pub buildpack_name: Option<String>,
}

/// Per-service-instance chunk item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstanceUsageItem {
    pub service_instance_guid: String,
    pub service_instance_name: String,
    /// `managed` or `user_provided`.
    pub service_instance_type: String,
    pub service_plan_guid: Option<String>,
    pub service_plan_name: Option<String>,
    pub service_offering_guid: Option<String>,
    pub service_offering_name: Option<String>,
    pub service_broker_guid: Option<String>,
    pub service_broker_name: Option<String>,
}

/// One serialized record inside a snapshot chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UsageItem {
    Process(ProcessUsageItem),
    ServiceInstance(ServiceInstanceUsageItem),
}

/// A row of the active-resource view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveResourceRow {
    pub resource_id: i64,
    pub resource_guid: String,
    /// Owning app for processes; service instances have none.
    pub parent_guid: Option<String>,
    pub space_guid: Option<String>,
    pub space_name: Option<String>,
    pub organization_guid: Option<String>,
    pub organization_name: Option<String>,
    /// Contribution to the snapshot's instance total.
    pub instance_count: i64,
    pub item: UsageItem,
}

/// Position just past the last row of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub space_guid: String,
    pub resource_id: i64,
}

impl PageCursor {
    fn after(row: &ActiveResourceRow) -> Self {
        Self {
            space_guid: row.space_guid.clone().unwrap_or_default(),
            resource_id: row.resource_id,
        }
    }
}

/// Supplier of active-resource rows for one ledger kind.
pub trait ActiveResourceSource {
    fn kind(&self) -> LedgerKind;

    /// Whether rows carry a parent whose distinct count is reported.
    fn tracks_parents(&self) -> bool {
        true
    }

    /// Up to `limit` rows strictly after `after`, ordered by `(space_guid, resource_id)`.
    fn fetch_page(
        &self,
        conn: &Connection,
        after: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<ActiveResourceRow>>;
}

/// The built-in source for `kind`.
#[must_use]
pub fn source_for(kind: LedgerKind) -> Box<dyn ActiveResourceSource + Send + Sync> {
    match kind {
        LedgerKind::Process => Box::new(ProcessSource),
        LedgerKind::Service => Box::new(ServiceInstanceSource),
    }
}

/// Walk every row of `source` page by page, handing each to `visit`.
///
/// Returns the number of rows visited.
pub fn for_each_active_resource<F>(
    conn: &Connection,
    source: &dyn ActiveResourceSource,
    page_size: usize,
    mut visit: F,
) -> Result<u64>
where
    F: FnMut(ActiveResourceRow) -> Result<()>,
{
    let page_size = page_size.max(1);
    let mut cursor: Option<PageCursor> = None;
    let mut visited = 0u64;

    loop {
        let page = source.fetch_page(conn, cursor.as_ref(), page_size)?;
        let fetched = page.len();
        trace!(kind = %source.kind(), fetched, "Fetched active resource page");

        if let Some(last) = page.last() {
            cursor = Some(PageCursor::after(last));
        }
        for row in page {
            visit(row)?;
            visited += 1;
        }
        if fetched < page_size {
            return Ok(visited);
        }
    }
}

// =============================================================================
// Processes
// =============================================================================

/// Started, long-running processes with their app, space, org, and droplet.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSource;

const PROCESS_PAGE_SQL: &str = "
SELECT p.id, p.guid, p.type, p.instances, p.memory,
       a.guid, a.name,
       s.guid, s.name, o.guid, o.name,
       d.buildpack_receipt_buildpack_guid, d.buildpack_receipt_buildpack
FROM processes p
JOIN apps a ON a.guid = p.app_guid
JOIN spaces s ON s.guid = a.space_guid
JOIN organizations o ON o.id = s.organization_id
LEFT JOIN droplets d ON d.guid = a.droplet_guid
WHERE p.state = 'STARTED'
  AND p.type NOT IN ('TASK', 'build')
  AND (?1 IS NULL OR s.guid > ?1 OR (s.guid = ?1 AND p.id > ?2))
ORDER BY s.guid, p.id
LIMIT ?3";

fn process_row(row: &Row<'_>) -> rusqlite::Result<ActiveResourceRow> {
    let instances: Option<i64> = row.get(3)?;
    let app_guid: String = row.get(5)?;
    let process_guid: String = row.get(1)?;
    Ok(ActiveResourceRow {
        resource_id: row.get(0)?,
        resource_guid: process_guid.clone(),
        parent_guid: Some(app_guid.clone()),
        space_guid: row.get(7)?,
        space_name: row.get(8)?,
        organization_guid: row.get(9)?,
        organization_name: row.get(10)?,
        instance_count: instances.unwrap_or(0),
        item: UsageItem::Process(ProcessUsageItem {
            app_guid,
            app_name: row.get(6)?,
            process_guid,
            process_type: row.get(2)?,
            instance_count: instances,
            memory_in_mb_per_instance: row.get(4)?,
            buildpack_guid: row.get(11)?,
            buildpack_name: row.get(12)?,
        }),
    })
}

impl ActiveResourceSource for ProcessSource {
    fn kind(&self) -> LedgerKind {
        LedgerKind::Process
    }

    fn fetch_page(
        &self,
        conn: &Connection,
        after: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<ActiveResourceRow>> {
        let mut stmt = conn.prepare_cached(PROCESS_PAGE_SQL)?;
        let rows = stmt
            .query_map(
                params![
                    after.map(|c| c.space_guid.as_str()),
                    after.map_or(0, |c| c.resource_id),
                    limit as i64
                ],
                process_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// =============================================================================
// Service instances
// =============================================================================

/// Every service instance, managed or user-provided.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServiceInstanceSource;

const SERVICE_INSTANCE_PAGE_SQL: &str = "
SELECT si.id, si.guid, si.name, si.is_gateway_service,
       s.guid, s.name, o.guid, o.name,
       sp.guid, sp.name, sv.guid, sv.label, sb.guid, sb.name
FROM service_instances si
JOIN spaces s ON s.id = si.space_id
JOIN organizations o ON o.id = s.organization_id
LEFT JOIN service_plans sp ON sp.id = si.service_plan_id
LEFT JOIN services sv ON sv.id = sp.service_id
LEFT JOIN service_brokers sb ON sb.id = sv.service_broker_id
WHERE (?1 IS NULL OR s.guid > ?1 OR (s.guid = ?1 AND si.id > ?2))
ORDER BY s.guid, si.id
LIMIT ?3";

fn service_instance_row(row: &Row<'_>) -> rusqlite::Result<ActiveResourceRow> {
    let guid: String = row.get(1)?;
    let managed: bool = row.get(3)?;
    Ok(ActiveResourceRow {
        resource_id: row.get(0)?,
        resource_guid: guid.clone(),
        parent_guid: None,
        space_guid: row.get(4)?,
        space_name: row.get(5)?,
        organization_guid: row.get(6)?,
        organization_name: row.get(7)?,
        instance_count: 1,
        item: UsageItem::ServiceInstance(ServiceInstanceUsageItem {
            service_instance_guid: guid,
            service_instance_name: row.get(2)?,
            service_instance_type: if managed { "managed" } else { "user_provided" }.to_string(),
            service_plan_guid: row.get(8)?,
            service_plan_name: row.get(9)?,
            service_offering_guid: row.get(10)?,
            service_offering_name: row.get(11)?,
            service_broker_guid: row.get(12)?,
            service_broker_name: row.get(13)?,
        }),
    })
}

impl ActiveResourceSource for ServiceInstanceSource {
    fn kind(&self) -> LedgerKind {
        LedgerKind::Service
    }

    fn tracks_parents(&self) -> bool {
        false
    }

    fn fetch_page(
        &self,
        conn: &Connection,
        after: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<ActiveResourceRow>> {
        let mut stmt = conn.prepare_cached(SERVICE_INSTANCE_PAGE_SQL)?;
        let rows = stmt
            .query_map(
                params![
                    after.map(|c| c.space_guid.as_str()),
                    after.map_or(0, |c| c.resource_id),
                    limit as i64
                ],
                service_instance_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
