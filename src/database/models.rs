//! Row mapping between SQLite columns and chain types.
//!
//! Sequence numbers are `u64` in the domain and `INTEGER` (i64) in SQLite;
//! timestamps are stored as Unix microseconds so they round-trip exactly.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

use crate::audit::anchor::Anchor;
use crate::audit::entry::{AuditEvent, Payload, ResourceRef, TenantId};
use crate::audit::hash::ChainHash;
use crate::audit::verify::{
    Discrepancy, DiscrepancyKind, VerificationRecord, VerificationStatus,
};
use crate::error::{AuditError, AuditResult};

pub const EVENT_COLUMNS: &str = "event_id, tenant_id, sequence_number, event_type, actor_id, \
     resource_type, resource_id, payload_schema_version, payload, created_at, hash_format, \
     previous_hash, event_hash";

pub const ANCHOR_COLUMNS: &str =
    "anchor_id, tenant_id, start_seq, end_seq, root_hash, leaf_count, created_at";

pub const VERIFICATION_COLUMNS: &str = "record_id, tenant_id, status, start_seq, end_seq, \
     events_checked, anchors_checked, discrepancy_seq, discrepancy_kind, expected_value, \
     actual_value, discrepancy_anchor_id, checked_at";

pub fn to_db_int(value: u64) -> AuditResult<i64> {
    i64::try_from(value)
        .map_err(|_| AuditError::Storage(format!("Value {} exceeds SQLite INTEGER range", value)))
}

pub fn from_db_int(value: i64) -> AuditResult<u64> {
    u64::try_from(value)
        .map_err(|_| AuditError::Storage(format!("Negative value {} in unsigned column", value)))
}

pub fn to_db_time(time: &DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

pub fn from_db_time(micros: i64) -> AuditResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| AuditError::Storage(format!("Timestamp {} out of range", micros)))
}

fn uuid_column(row: &SqliteRow, column: &str) -> AuditResult<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw)
        .map_err(|e| AuditError::Storage(format!("Invalid UUID in {}: {}", column, e)))
}

fn hash_column(row: &SqliteRow, column: &str) -> AuditResult<ChainHash> {
    let raw: String = row.try_get(column)?;
    ChainHash::from_str(&raw)
}

fn u64_column(row: &SqliteRow, column: &str) -> AuditResult<u64> {
    from_db_int(row.try_get(column)?)
}

/// Decode failures past the key columns become `MalformedRow` at the row's
/// sequence number.
fn locate(row: &SqliteRow, seq_column: &str, err: AuditError) -> AuditError {
    let tenant: Result<String, _> = row.try_get("tenant_id");
    match (tenant, u64_column(row, seq_column)) {
        (Ok(tenant_id), Ok(sequence_number)) => AuditError::MalformedRow {
            tenant_id,
            sequence_number,
            reason: err.to_string(),
        },
        _ => err,
    }
}

pub fn event_from_row(row: &SqliteRow) -> AuditResult<AuditEvent> {
    decode_event(row).map_err(|e| locate(row, "sequence_number", e))
}

pub fn anchor_from_row(row: &SqliteRow) -> AuditResult<Anchor> {
    decode_anchor(row).map_err(|e| locate(row, "start_seq", e))
}

fn decode_event(row: &SqliteRow) -> AuditResult<AuditEvent> {
    let schema_version: i64 = row.try_get("payload_schema_version")?;
    let hash_format: i64 = row.try_get("hash_format")?;

    Ok(AuditEvent {
        event_id: uuid_column(row, "event_id")?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        sequence_number: u64_column(row, "sequence_number")?,
        event_type: row.try_get("event_type")?,
        actor_id: row.try_get("actor_id")?,
        resource: ResourceRef::new(
            row.try_get::<String, _>("resource_type")?,
            row.try_get::<String, _>("resource_id")?,
        ),
        payload: Payload::new(
            u16::try_from(schema_version).map_err(|_| {
                AuditError::Storage(format!("Invalid payload schema version {}", schema_version))
            })?,
            row.try_get::<Vec<u8>, _>("payload")?,
        ),
        created_at: from_db_time(row.try_get("created_at")?)?,
        hash_format: u8::try_from(hash_format)
            .map_err(|_| AuditError::Storage(format!("Invalid hash format {}", hash_format)))?,
        previous_hash: hash_column(row, "previous_hash")?,
        event_hash: hash_column(row, "event_hash")?,
    })
}

fn decode_anchor(row: &SqliteRow) -> AuditResult<Anchor> {
    Ok(Anchor {
        anchor_id: uuid_column(row, "anchor_id")?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        start_seq: u64_column(row, "start_seq")?,
        end_seq: u64_column(row, "end_seq")?,
        root_hash: hash_column(row, "root_hash")?,
        leaf_count: u64_column(row, "leaf_count")?,
        created_at: from_db_time(row.try_get("created_at")?)?,
    })
}

pub fn verification_from_row(row: &SqliteRow) -> AuditResult<VerificationRecord> {
    let status: String = row.try_get("status")?;
    let discrepancy_seq: Option<i64> = row.try_get("discrepancy_seq")?;
    let discrepancy_kind: Option<String> = row.try_get("discrepancy_kind")?;

    let discrepancy = match (discrepancy_seq, discrepancy_kind) {
        (Some(seq), Some(kind)) => {
            let anchor_id: Option<String> = row.try_get("discrepancy_anchor_id")?;
            Some(Discrepancy {
                sequence_number: from_db_int(seq)?,
                kind: DiscrepancyKind::from_str(&kind)?,
                expected: row.try_get::<Option<String>, _>("expected_value")?.unwrap_or_default(),
                actual: row.try_get::<Option<String>, _>("actual_value")?.unwrap_or_default(),
                anchor_id: anchor_id
                    .map(|id| Uuid::parse_str(&id))
                    .transpose()
                    .map_err(|e| AuditError::Storage(format!("Invalid anchor id: {}", e)))?,
            })
        }
        _ => None,
    };

    Ok(VerificationRecord {
        record_id: uuid_column(row, "record_id")?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        status: VerificationStatus::from_str(&status)?,
        start_seq: u64_column(row, "start_seq")?,
        end_seq: u64_column(row, "end_seq")?,
        events_checked: u64_column(row, "events_checked")?,
        anchors_checked: u64_column(row, "anchors_checked")?,
        discrepancy,
        checked_at: from_db_time(row.try_get("checked_at")?)?,
    })
}
