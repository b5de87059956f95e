//! `ChainStore` over SQLite.
//!
//! Appends and anchor inserts re-check the chain tail inside a transaction;
//! the unique `(tenant_id, sequence_number)` and `(tenant_id, start_seq)`
//! indexes reject whichever concurrent writer commits second.

use async_trait::async_trait;
use sqlx::Row;
use tracing::{debug, error};

use crate::audit::anchor::Anchor;
use crate::audit::entry::{AuditEvent, TenantId};
use crate::audit::hash::ChainHash;
use crate::audit::verify::VerificationRecord;
use crate::database::models::{
    anchor_from_row, event_from_row, from_db_int, to_db_int, to_db_time, verification_from_row,
    ANCHOR_COLUMNS, EVENT_COLUMNS, VERIFICATION_COLUMNS,
};
use crate::database::Database;
use crate::error::{AuditError, AuditResult};
use crate::store::{ChainHead, ChainStore};

/// Log storage failures as operational alerts before surfacing them
fn alert(err: AuditError) -> AuditError {
    if let AuditError::Storage(message) = &err {
        error!("Audit storage failure: {}", message);
    }
    err
}

#[async_trait]
impl ChainStore for Database {
    async fn head(&self, tenant: &TenantId) -> AuditResult<Option<ChainHead>> {
        let row = sqlx::query(
            r#"
            SELECT sequence_number, event_hash FROM audit_events
            WHERE tenant_id = ?
            ORDER BY sequence_number DESC
            LIMIT 1
            "#,
        )
        .bind(tenant.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| alert(e.into()))?;

        row.map(|row| -> AuditResult<ChainHead> {
            let event_hash: String = row.try_get("event_hash")?;
            Ok(ChainHead {
                sequence_number: from_db_int(row.try_get("sequence_number")?)?,
                event_hash: event_hash.parse()?,
            })
        })
        .transpose()
    }

    async fn append_event(&self, event: &AuditEvent) -> AuditResult<()> {
        let mut tx = self.pool().begin().await.map_err(|e| alert(e.into()))?;

        let head = sqlx::query(
            r#"
            SELECT sequence_number, event_hash FROM audit_events
            WHERE tenant_id = ?
            ORDER BY sequence_number DESC
            LIMIT 1
            "#,
        )
        .bind(event.tenant_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| alert(e.into()))?;

        let head = match head {
            Some(row) => {
                let event_hash: String = row.try_get("event_hash")?;
                Some(ChainHead {
                    sequence_number: from_db_int(row.try_get("sequence_number")?)?,
                    event_hash: event_hash.parse::<ChainHash>()?,
                })
            }
            None => None,
        };

        let (next_seq, prev_hash) = ChainHead::next_link(head);
        if event.sequence_number != next_seq || event.previous_hash != prev_hash {
            return Err(AuditError::conflict(
                event.tenant_id.as_str(),
                event.sequence_number,
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO audit_events (event_id, tenant_id, sequence_number, event_type, actor_id,
                                      resource_type, resource_id, payload_schema_version, payload,
                                      created_at, hash_format, previous_hash, event_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.tenant_id.as_str())
        .bind(to_db_int(event.sequence_number)?)
        .bind(&event.event_type)
        .bind(&event.actor_id)
        .bind(&event.resource.resource_type)
        .bind(&event.resource.resource_id)
        .bind(i64::from(event.payload.schema_version))
        .bind(&event.payload.bytes)
        .bind(to_db_time(&event.created_at))
        .bind(i64::from(event.hash_format))
        .bind(event.previous_hash.to_hex())
        .bind(event.event_hash.to_hex())
        .execute(&mut *tx)
        .await
        .map_err(|e| alert(e.into()))?;

        tx.commit().await.map_err(|e| alert(e.into()))?;
        debug!("Persisted event {}", event.summary());
        Ok(())
    }

    async fn get_event(
        &self,
        tenant: &TenantId,
        sequence_number: u64,
    ) -> AuditResult<Option<AuditEvent>> {
        let query = format!(
            "SELECT {} FROM audit_events WHERE tenant_id = ? AND sequence_number = ?",
            EVENT_COLUMNS
        );
        sqlx::query(&query)
            .bind(tenant.as_str())
            .bind(to_db_int(sequence_number)?)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| alert(e.into()))?
            .as_ref()
            .map(event_from_row)
            .transpose()
    }

    async fn read_range(
        &self,
        tenant: &TenantId,
        start: u64,
        end: u64,
    ) -> AuditResult<Vec<AuditEvent>> {
        if start > end {
            return Ok(vec![]);
        }
        let query = format!(
            "SELECT {} FROM audit_events \
             WHERE tenant_id = ? AND sequence_number BETWEEN ? AND ? \
             ORDER BY sequence_number ASC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(tenant.as_str())
            .bind(to_db_int(start)?)
            .bind(to_db_int(end.min(i64::MAX as u64))?)
            .fetch_all(self.pool())
            .await
            .map_err(|e| alert(e.into()))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn leaf_hashes(
        &self,
        tenant: &TenantId,
        start: u64,
        end: u64,
    ) -> AuditResult<Vec<ChainHash>> {
        if start > end {
            return Ok(vec![]);
        }
        let rows = sqlx::query(
            r#"
            SELECT sequence_number, event_hash FROM audit_events
            WHERE tenant_id = ? AND sequence_number BETWEEN ? AND ?
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant.as_str())
        .bind(to_db_int(start)?)
        .bind(to_db_int(end.min(i64::MAX as u64))?)
        .fetch_all(self.pool())
        .await
        .map_err(|e| alert(e.into()))?;

        rows.iter()
            .map(|row| -> AuditResult<ChainHash> {
                let sequence_number = from_db_int(row.try_get("sequence_number")?)?;
                row.try_get::<String, _>("event_hash")?
                    .parse()
                    .map_err(|e: AuditError| AuditError::MalformedRow {
                        tenant_id: tenant.as_str().to_string(),
                        sequence_number,
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    async fn tenants(&self) -> AuditResult<Vec<TenantId>> {
        let rows = sqlx::query("SELECT DISTINCT tenant_id FROM audit_events ORDER BY tenant_id")
            .fetch_all(self.pool())
            .await
            .map_err(|e| alert(e.into()))?;

        rows.iter()
            .map(|row| -> AuditResult<TenantId> {
                Ok(TenantId::new(row.try_get::<String, _>("tenant_id")?))
            })
            .collect()
    }

    async fn last_anchor(&self, tenant: &TenantId) -> AuditResult<Option<Anchor>> {
        let query = format!(
            "SELECT {} FROM audit_anchors WHERE tenant_id = ? ORDER BY end_seq DESC LIMIT 1",
            ANCHOR_COLUMNS
        );
        sqlx::query(&query)
            .bind(tenant.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| alert(e.into()))?
            .as_ref()
            .map(anchor_from_row)
            .transpose()
    }

    async fn insert_anchor(&self, anchor: &Anchor) -> AuditResult<()> {
        if anchor.start_seq > anchor.end_seq {
            return Err(AuditError::InvalidRange {
                start: anchor.start_seq,
                end: anchor.end_seq,
            });
        }

        let mut tx = self.pool().begin().await.map_err(|e| alert(e.into()))?;

        let last_end: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(end_seq) FROM audit_anchors WHERE tenant_id = ?",
        )
        .bind(anchor.tenant_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| alert(e.into()))?;
        let expected_start = match last_end {
            Some(end) => from_db_int(end)? + 1,
            None => 0,
        };
        if anchor.start_seq != expected_start {
            return Err(AuditError::conflict(anchor.tenant_id.as_str(), anchor.start_seq));
        }

        let head: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM audit_events WHERE tenant_id = ?",
        )
        .bind(anchor.tenant_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| alert(e.into()))?;
        if head.map_or(true, |h| to_db_int(anchor.end_seq).map_or(true, |end| end > h)) {
            return Err(AuditError::InvalidRange {
                start: anchor.start_seq,
                end: anchor.end_seq,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO audit_anchors (anchor_id, tenant_id, start_seq, end_seq, root_hash,
                                       leaf_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(anchor.anchor_id.to_string())
        .bind(anchor.tenant_id.as_str())
        .bind(to_db_int(anchor.start_seq)?)
        .bind(to_db_int(anchor.end_seq)?)
        .bind(anchor.root_hash.to_hex())
        .bind(to_db_int(anchor.leaf_count)?)
        .bind(to_db_time(&anchor.created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| alert(AuditError::from(e)).with_conflict_context(anchor.tenant_id.as_str(), anchor.start_seq))?;

        tx.commit().await.map_err(|e| alert(e.into()))?;
        Ok(())
    }

    async fn anchor_covering(
        &self,
        tenant: &TenantId,
        sequence_number: u64,
    ) -> AuditResult<Option<Anchor>> {
        let query = format!(
            "SELECT {} FROM audit_anchors \
             WHERE tenant_id = ? AND start_seq <= ? AND end_seq >= ? \
             ORDER BY start_seq LIMIT 1",
            ANCHOR_COLUMNS
        );
        let seq = to_db_int(sequence_number)?;
        sqlx::query(&query)
            .bind(tenant.as_str())
            .bind(seq)
            .bind(seq)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| alert(e.into()))?
            .as_ref()
            .map(anchor_from_row)
            .transpose()
    }

    async fn anchors_within(
        &self,
        tenant: &TenantId,
        start: u64,
        end: u64,
    ) -> AuditResult<Vec<Anchor>> {
        let query = format!(
            "SELECT {} FROM audit_anchors \
             WHERE tenant_id = ? AND start_seq >= ? AND end_seq <= ? \
             ORDER BY start_seq ASC",
            ANCHOR_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(tenant.as_str())
            .bind(to_db_int(start)?)
            .bind(to_db_int(end.min(i64::MAX as u64))?)
            .fetch_all(self.pool())
            .await
            .map_err(|e| alert(e.into()))?;

        rows.iter().map(anchor_from_row).collect()
    }

    async fn insert_verification(&self, record: &VerificationRecord) -> AuditResult<()> {
        let discrepancy = record.discrepancy.as_ref();
        let discrepancy_seq = discrepancy
            .map(|d| to_db_int(d.sequence_number))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO audit_verifications (record_id, tenant_id, status, start_seq, end_seq,
                                             events_checked, anchors_checked, discrepancy_seq,
                                             discrepancy_kind, expected_value, actual_value,
                                             discrepancy_anchor_id, checked_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.record_id.to_string())
        .bind(record.tenant_id.as_str())
        .bind(record.status.as_str())
        .bind(to_db_int(record.start_seq)?)
        .bind(to_db_int(record.end_seq.min(i64::MAX as u64))?)
        .bind(to_db_int(record.events_checked)?)
        .bind(to_db_int(record.anchors_checked)?)
        .bind(discrepancy_seq)
        .bind(discrepancy.map(|d| d.kind.as_str()))
        .bind(discrepancy.map(|d| d.expected.clone()))
        .bind(discrepancy.map(|d| d.actual.clone()))
        .bind(discrepancy.and_then(|d| d.anchor_id).map(|id| id.to_string()))
        .bind(to_db_time(&record.checked_at))
        .execute(self.pool())
        .await
        .map_err(|e| alert(e.into()))?;

        Ok(())
    }

    async fn verifications(&self, tenant: &TenantId) -> AuditResult<Vec<VerificationRecord>> {
        let query = format!(
            "SELECT {} FROM audit_verifications WHERE tenant_id = ? ORDER BY checked_at ASC, rowid ASC",
            VERIFICATION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(tenant.as_str())
            .fetch_all(self.pool())
            .await
            .map_err(|e| alert(e.into()))?;

        rows.iter().map(verification_from_row).collect()
    }
}
