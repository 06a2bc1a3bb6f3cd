//! Consumer registry: named external readers and their watermarks.
//!
//! A watermark is a plain guid string. It may point at a ledger row that has
//! since been deleted; that is a normal state, reconciled only by
//! size-exceeded retention.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConsumerError, Error, Result};
use crate::ledger::LedgerKind;
use crate::schema::{db_now_ms, ms_to_datetime};

/// Maximum length of `consumer_guid` and `last_processed_guid`.
pub const MAX_GUID_LEN: usize = 255;

/// One registered consumer of a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRegistration {
    pub consumer_guid: String,
    pub last_processed_guid: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<ConsumerRegistration> {
    Ok(ConsumerRegistration {
        consumer_guid: row.get(0)?,
        last_processed_guid: row.get(1)?,
        created_at: ms_to_datetime(row.get(2)?),
        updated_at: ms_to_datetime(row.get(3)?),
    })
}

fn validate_guid(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConsumerError::ValidationFailure {
            field,
            message: "must be present".to_string(),
        }
        .into());
    }
    if value.chars().count() > MAX_GUID_LEN {
        return Err(ConsumerError::ValidationFailure {
            field,
            message: format!("must be at most {MAX_GUID_LEN} characters"),
        }
        .into());
    }
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Register a new consumer with an initial watermark.
pub fn register(
    conn: &Connection,
    kind: LedgerKind,
    consumer_guid: &str,
    last_processed_guid: &str,
) -> Result<ConsumerRegistration> {
    validate_guid("consumer_guid", consumer_guid)?;
    validate_guid("last_processed_guid", last_processed_guid)?;

    let now = db_now_ms(conn)?;
    let sql = format!(
        "INSERT INTO {} (consumer_guid, last_processed_guid, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        kind.model().consumer_table
    );
    match conn.execute(&sql, params![consumer_guid, last_processed_guid, now]) {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(ConsumerError::ValidationFailure {
                field: "consumer_guid",
                message: format!("{consumer_guid} is already registered"),
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    }

    info!(kind = %kind, consumer_guid, last_processed_guid, "Registered usage consumer");
    Ok(ConsumerRegistration {
        consumer_guid: consumer_guid.to_string(),
        last_processed_guid: last_processed_guid.to_string(),
        created_at: ms_to_datetime(now),
        updated_at: ms_to_datetime(now),
    })
}

pub fn find(conn: &Connection, kind: LedgerKind, consumer_guid: &str) -> Result<Option<ConsumerRegistration>> {
    let sql = format!(
        "SELECT consumer_guid, last_processed_guid, created_at, updated_at
         FROM {} WHERE consumer_guid = ?1",
        kind.model().consumer_table
    );
    Ok(conn.query_row(&sql, [consumer_guid], registration_from_row).optional()?)
}

/// Move a consumer's watermark.
pub fn update_watermark(
    conn: &Connection,
    kind: LedgerKind,
    consumer_guid: &str,
    last_processed_guid: &str,
) -> Result<ConsumerRegistration> {
    validate_guid("last_processed_guid", last_processed_guid)?;

    let now = db_now_ms(conn)?;
    let sql = format!(
        "UPDATE {} SET last_processed_guid = ?2, updated_at = ?3 WHERE consumer_guid = ?1",
        kind.model().consumer_table
    );
    let updated = conn.execute(&sql, params![consumer_guid, last_processed_guid, now])?;
    if updated == 0 {
        return Err(ConsumerError::NotFound(consumer_guid.to_string()).into());
    }

    find(conn, kind, consumer_guid)?
        .ok_or_else(|| Error::from(ConsumerError::NotFound(consumer_guid.to_string())))
}

/// Remove a registration at its owner's request.
pub fn deregister(conn: &Connection, kind: LedgerKind, consumer_guid: &str) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE consumer_guid = ?1", kind.model().consumer_table);
    if conn.execute(&sql, [consumer_guid])? == 0 {
        return Err(ConsumerError::NotFound(consumer_guid.to_string()).into());
    }
    info!(kind = %kind, consumer_guid, "Deregistered usage consumer");
    Ok(())
}

pub fn list(conn: &Connection, kind: LedgerKind) -> Result<Vec<ConsumerRegistration>> {
    let sql = format!(
        "SELECT consumer_guid, last_processed_guid, created_at, updated_at
         FROM {} ORDER BY id ASC",
        kind.model().consumer_table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], registration_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
