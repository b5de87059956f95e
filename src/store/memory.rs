//! In-memory Chain Store
//!
//! Reference backend used by tests and embedded hosts. Each tenant's log sits
//! behind its own async `RwLock`, which is the serialization point for that
//! tenant's appends and anchors; the outer map lock is held only long enough
//! to find or create a tenant.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::audit::anchor::Anchor;
use crate::audit::entry::{AuditEvent, TenantId};
use crate::audit::verify::VerificationRecord;
use crate::error::{AuditError, AuditResult};
use crate::store::{ChainHead, ChainStore};

#[derive(Debug, Default)]
struct TenantLog {
    /// Index == sequence number
    events: Vec<AuditEvent>,
    anchors: Vec<Anchor>,
    verifications: Vec<VerificationRecord>,
}

impl TenantLog {
    fn head(&self) -> Option<ChainHead> {
        self.events.last().map(|e| ChainHead {
            sequence_number: e.sequence_number,
            event_hash: e.event_hash,
        })
    }
}

type SharedLog = Arc<RwLock<TenantLog>>;

#[derive(Debug, Clone, Default)]
pub struct InMemoryChainStore {
    tenants: Arc<RwLock<HashMap<TenantId, SharedLog>>>,
}

impl InMemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn log(&self, tenant: &TenantId) -> Option<SharedLog> {
        self.tenants.read().await.get(tenant).cloned()
    }

    async fn read_log<T>(&self, tenant: &TenantId, f: impl FnOnce(&TenantLog) -> T) -> Option<T> {
        let log = self.log(tenant).await?;
        let guard = log.read().await;
        Some(f(&guard))
    }

    async fn log_or_create(&self, tenant: &TenantId) -> SharedLog {
        if let Some(log) = self.log(tenant).await {
            return log;
        }
        self.tenants
            .write()
            .await
            .entry(tenant.clone())
            .or_default()
            .clone()
    }

    /// Overwrite a committed event in place, bypassing every append-only
    /// guard. Simulates an operator editing storage directly.
    #[cfg(test)]
    pub(crate) async fn tamper_with<F>(&self, tenant: &TenantId, sequence_number: u64, edit: F)
    where
        F: FnOnce(&mut AuditEvent),
    {
        if let Some(log) = self.log(tenant).await {
            let mut guard = log.write().await;
            if let Some(event) = guard.events.get_mut(sequence_number as usize) {
                edit(event);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn tamper_with_anchor<F>(&self, tenant: &TenantId, index: usize, edit: F)
    where
        F: FnOnce(&mut Anchor),
    {
        if let Some(log) = self.log(tenant).await {
            let mut guard = log.write().await;
            if let Some(anchor) = guard.anchors.get_mut(index) {
                edit(anchor);
            }
        }
    }

    /// Add an anchor row with no contiguity or head checks
    #[cfg(test)]
    pub(crate) async fn force_anchor(&self, anchor: Anchor) {
        let log = self.log_or_create(&anchor.tenant_id).await;
        log.write().await.anchors.push(anchor);
    }
}

#[async_trait]
impl ChainStore for InMemoryChainStore {
    async fn head(&self, tenant: &TenantId) -> AuditResult<Option<ChainHead>> {
        Ok(self.read_log(tenant, TenantLog::head).await.flatten())
    }

    async fn append_event(&self, event: &AuditEvent) -> AuditResult<()> {
        let log = self.log_or_create(&event.tenant_id).await;
        let mut log = log.write().await;

        let (next_seq, prev_hash) = ChainHead::next_link(log.head());
        if event.sequence_number != next_seq || event.previous_hash != prev_hash {
            return Err(AuditError::conflict(
                event.tenant_id.as_str(),
                event.sequence_number,
            ));
        }

        log.events.push(event.clone());
        debug!("Stored event {}", event.summary());
        Ok(())
    }

    async fn get_event(
        &self,
        tenant: &TenantId,
        sequence_number: u64,
    ) -> AuditResult<Option<AuditEvent>> {
        Ok(self
            .read_log(tenant, |log| log.events.get(sequence_number as usize).cloned())
            .await
            .flatten())
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
        Ok(self
            .read_log(tenant, |log| {
                let len = log.events.len() as u64;
                if start >= len {
                    return Vec::new();
                }
                let stop = end.min(len - 1);
                log.events[start as usize..=stop as usize].to_vec()
            })
            .await
            .unwrap_or_default())
    }

    async fn tenants(&self) -> AuditResult<Vec<TenantId>> {
        let logs: Vec<(TenantId, SharedLog)> = self
            .tenants
            .read()
            .await
            .iter()
            .map(|(id, log)| (id.clone(), Arc::clone(log)))
            .collect();

        let mut ids = Vec::with_capacity(logs.len());
        for (id, log) in logs {
            if !log.read().await.events.is_empty() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn last_anchor(&self, tenant: &TenantId) -> AuditResult<Option<Anchor>> {
        Ok(self
            .read_log(tenant, |log| log.anchors.last().cloned())
            .await
            .flatten())
    }

    async fn insert_anchor(&self, anchor: &Anchor) -> AuditResult<()> {
        let log = self.log_or_create(&anchor.tenant_id).await;
        let mut log = log.write().await;

        let expected_start = log.anchors.last().map_or(0, |a| a.end_seq + 1);
        if anchor.start_seq != expected_start {
            return Err(AuditError::conflict(anchor.tenant_id.as_str(), anchor.start_seq));
        }
        let head_seq = log.head().map(|h| h.sequence_number);
        if anchor.start_seq > anchor.end_seq || head_seq.map_or(true, |h| anchor.end_seq > h) {
            return Err(AuditError::InvalidRange {
                start: anchor.start_seq,
                end: anchor.end_seq,
            });
        }

        log.anchors.push(anchor.clone());
        Ok(())
    }

    async fn anchor_covering(
        &self,
        tenant: &TenantId,
        sequence_number: u64,
    ) -> AuditResult<Option<Anchor>> {
        Ok(self
            .read_log(tenant, |log| {
                log.anchors.iter().find(|a| a.covers(sequence_number)).cloned()
            })
            .await
            .flatten())
    }

    async fn anchors_within(
        &self,
        tenant: &TenantId,
        start: u64,
        end: u64,
    ) -> AuditResult<Vec<Anchor>> {
        let mut anchors = self
            .read_log(tenant, |log| {
                log.anchors
                    .iter()
                    .filter(|a| a.start_seq >= start && a.end_seq <= end)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap_or_default();
        anchors.sort_by_key(|a| a.start_seq);
        Ok(anchors)
    }

    async fn insert_verification(&self, record: &VerificationRecord) -> AuditResult<()> {
        let log = self.log_or_create(&record.tenant_id).await;
        log.write().await.verifications.push(record.clone());
        Ok(())
    }

    async fn verifications(&self, tenant: &TenantId) -> AuditResult<Vec<VerificationRecord>> {
        Ok(self
            .read_log(tenant, |log| log.verifications.clone())
            .await
            .unwrap_or_default())
    }
}
