//! Audit Trail
//!
//! The boundary the host talks to: record events, read chain status, verify
//! ranges and fetch inclusion proofs. Wires the appender, anchorer, proof
//! generator and verifier around one shared store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::anchor::{Anchor, AnchorOutcome, MerkleAnchorer};
use crate::audit::appender::EventAppender;
use crate::audit::entry::{AuditEvent, NewEvent, TenantId};
use crate::audit::hash::ChainHash;
use crate::audit::proof::{InclusionProof, ProofGenerator};
use crate::audit::verify::{CancelFlag, ChainVerifier, VerificationRecord};
use crate::config::AppConfig;
use crate::error::{AuditError, AuditResult};
use crate::scheduler::{ScheduleHandle, Scheduler};
use crate::store::ChainStore;

/// Receipt for a committed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub sequence_number: u64,
    pub event_hash: ChainHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub tenant_id: TenantId,
    pub last_sequence: Option<u64>,
    pub last_anchor_range: Option<(u64, u64)>,
    pub unanchored_count: u64,
}

#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn ChainStore>,
    appender: EventAppender,
    anchorer: MerkleAnchorer,
    proofs: ProofGenerator,
    verifier: ChainVerifier,
    config: AppConfig,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn ChainStore>, scheduler: Arc<dyn Scheduler>, config: AppConfig) -> Self {
        Self {
            appender: EventAppender::new(Arc::clone(&store)),
            anchorer: MerkleAnchorer::new(Arc::clone(&store), scheduler, config.anchor_policy()),
            proofs: ProofGenerator::new(Arc::clone(&store), config.proofs.tree_cache_capacity),
            verifier: ChainVerifier::new(Arc::clone(&store), config.verification.batch_size),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Append an event, retrying with fresh chain state while other writers
    /// win the race
    pub async fn record_event(
        &self,
        tenant: &TenantId,
        new_event: NewEvent,
    ) -> AuditResult<RecordedEvent> {
        let max_attempts = self.config.append.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.appender.append(tenant, new_event.clone()).await {
                Ok(event) => {
                    return Ok(RecordedEvent {
                        event_id: event.event_id,
                        sequence_number: event.sequence_number,
                        event_hash: event.event_hash,
                    })
                }
                Err(e) if e.is_conflict() && attempt < max_attempts => {
                    debug!("Append conflict for {} (attempt {}/{})", tenant, attempt, max_attempts);
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    if e.is_conflict() {
                        warn!("Giving up append for {} after {} attempts", tenant, attempt);
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn chain_status(&self, tenant: &TenantId) -> AuditResult<ChainStatus> {
        let last_sequence = self.store.head(tenant).await?.map(|h| h.sequence_number);
        let last_anchor_range = self.store.last_anchor(tenant).await?.map(|a| a.range());

        let next_unanchored = last_anchor_range.map_or(0, |(_, end)| end + 1);
        let unanchored_count = last_sequence.map_or(0, |last| (last + 1).saturating_sub(next_unanchored));

        Ok(ChainStatus {
            tenant_id: tenant.clone(),
            last_sequence,
            last_anchor_range,
            unanchored_count,
        })
    }

    pub async fn verify_range(
        &self,
        tenant: &TenantId,
        start: u64,
        end: u64,
    ) -> AuditResult<VerificationRecord> {
        self.verify_range_with_cancel(tenant, start, end, &CancelFlag::new())
            .await
    }

    pub async fn verify_range_with_cancel(
        &self,
        tenant: &TenantId,
        start: u64,
        end: u64,
        cancel: &CancelFlag,
    ) -> AuditResult<VerificationRecord> {
        self.verifier.verify_range(tenant, start, end, cancel).await
    }

    /// Verify the whole chain from genesis through the current head
    pub async fn verify_all(&self, tenant: &TenantId) -> AuditResult<VerificationRecord> {
        let end = match self.store.head(tenant).await? {
            Some(head) => head.sequence_number,
            None => 0,
        };
        self.verify_range(tenant, 0, end).await
    }

    pub async fn inclusion_proof(
        &self,
        tenant: &TenantId,
        sequence_number: u64,
    ) -> AuditResult<InclusionProof> {
        self.proofs.inclusion_proof(tenant, sequence_number).await
    }

    pub async fn anchor(&self, tenant: &TenantId) -> AuditResult<AnchorOutcome> {
        self.anchorer.anchor(tenant).await
    }

    pub async fn anchor_all(&self) -> AuditResult<Vec<Anchor>> {
        self.anchorer.anchor_all().await
    }

    /// Register recurring anchoring with the scheduler given at construction
    pub fn schedule_anchoring(&self) -> AuditResult<ScheduleHandle> {
        if !self.config.anchoring.enabled {
            return Err(AuditError::ConfigError(
                "anchoring is disabled in configuration".to_string(),
            ));
        }
        Ok(self.anchorer.schedule(self.config.anchoring_interval()))
    }

    pub async fn event(&self, tenant: &TenantId, sequence_number: u64) -> AuditResult<Option<AuditEvent>> {
        self.store.get_event(tenant, sequence_number).await
    }

    pub async fn events(&self, tenant: &TenantId, start: u64, end: u64) -> AuditResult<Vec<AuditEvent>> {
        if start > end {
            return Err(AuditError::InvalidRange { start, end });
        }
        self.store.read_range(tenant, start, end).await
    }

    pub async fn verifications(&self, tenant: &TenantId) -> AuditResult<Vec<VerificationRecord>> {
        self.store.verifications(tenant).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::ResourceRef;
    use crate::audit::verify::VerificationStatus;
    use crate::scheduler::ManualScheduler;
    use crate::store::InMemoryChainStore;

    fn trail() -> (AuditTrail, ManualScheduler) {
        let scheduler = ManualScheduler::new();
        let trail = AuditTrail::new(
            Arc::new(InMemoryChainStore::new()),
            Arc::new(scheduler.clone()),
            AppConfig::default(),
        );
        (trail, scheduler)
    }

    fn approval(i: usize) -> NewEvent {
        NewEvent::new("invoice.approved", "frank", ResourceRef::new("invoice", format!("inv-{}", i)))
    }

    #[tokio::test]
    async fn test_chain_status_tracks_anchoring() {
        let (trail, _) = trail();
        let tenant = TenantId::new("acme");

        let empty = trail.chain_status(&tenant).await.unwrap();
        assert_eq!(empty.last_sequence, None);
        assert_eq!(empty.unanchored_count, 0);

        for i in 0..4 {
            trail.record_event(&tenant, approval(i)).await.unwrap();
        }
        let status = trail.chain_status(&tenant).await.unwrap();
        assert_eq!(status.last_sequence, Some(3));
        assert_eq!(status.last_anchor_range, None);
        assert_eq!(status.unanchored_count, 4);

        trail.anchor(&tenant).await.unwrap();
        trail.record_event(&tenant, approval(4)).await.unwrap();
        let status = trail.chain_status(&tenant).await.unwrap();
        assert_eq!(status.last_anchor_range, Some((0, 3)));
        assert_eq!(status.unanchored_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_stay_gapless() {
        let mut config = AppConfig::default();
        config.append.max_attempts = 32;
        let trail = AuditTrail::new(
            Arc::new(InMemoryChainStore::new()),
            Arc::new(ManualScheduler::new()),
            config,
        );
        let tenant = TenantId::new("acme");

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let trail = trail.clone();
                let tenant = tenant.clone();
                tokio::spawn(async move { trail.record_event(&tenant, approval(i)).await })
            })
            .collect();

        let mut sequences = Vec::new();
        for handle in handles {
            sequences.push(handle.await.unwrap().unwrap().sequence_number);
        }
        sequences.sort_unstable();
        assert_eq!(sequences, (0..16).collect::<Vec<u64>>());

        let record = trail.verify_all(&tenant).await.unwrap();
        assert_eq!(record.status, VerificationStatus::Valid);
        assert_eq!(record.events_checked, 16);
    }

    #[tokio::test]
    async fn test_schedule_anchoring_respects_config() {
        let (trail, scheduler) = trail();
        trail.schedule_anchoring().unwrap();
        assert_eq!(scheduler.scheduled().len(), 1);

        let mut config = AppConfig::default();
        config.anchoring.enabled = false;
        let disabled = AuditTrail::new(
            Arc::new(InMemoryChainStore::new()),
            Arc::new(ManualScheduler::new()),
            config,
        );
        assert!(disabled.schedule_anchoring().is_err());
    }

    #[tokio::test]
    async fn test_events_rejects_inverted_range() {
        let (trail, _) = trail();
        let err = trail.events(&TenantId::new("acme"), 5, 1).await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidRange { start: 5, end: 1 }));
    }
}
