//! Merkle Anchorer
//!
//! Periodically seals the unanchored tail of each tenant's chain into a
//! Merkle root. Anchors are contiguous and non-overlapping per tenant, and a
//! re-run over the same leaves always yields the same root.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::entry::{now_micros, TenantId};
use crate::audit::hash::ChainHash;
use crate::audit::merkle::get_merkle_root;
use crate::error::{AuditError, AuditResult};
use crate::scheduler::{RecurringTask, ScheduleHandle, Scheduler};
use crate::store::ChainStore;

/// Persisted Merkle root over the closed range `[start_seq, end_seq]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub anchor_id: Uuid,
    pub tenant_id: TenantId,
    pub start_seq: u64,
    pub end_seq: u64,
    pub root_hash: ChainHash,
    pub leaf_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Anchor {
    pub fn new(tenant_id: TenantId, start_seq: u64, end_seq: u64, root_hash: ChainHash) -> Self {
        Self {
            anchor_id: Uuid::new_v4(),
            tenant_id,
            start_seq,
            end_seq,
            root_hash,
            leaf_count: end_seq.saturating_sub(start_seq).saturating_add(1),
            created_at: now_micros(),
        }
    }

    pub fn covers(&self, sequence_number: u64) -> bool {
        (self.start_seq..=self.end_seq).contains(&sequence_number)
    }

    pub fn range(&self) -> (u64, u64) {
        (self.start_seq, self.end_seq)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} [{}, {}]: {} leaves, root: {}",
            self.tenant_id, self.start_seq, self.end_seq, self.leaf_count, self.root_hash
        )
    }
}

/// Result of one anchoring run for one tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorOutcome {
    Anchored(Anchor),
    NoOp,
}

impl AnchorOutcome {
    pub fn anchor(&self) -> Option<&Anchor> {
        match self {
            AnchorOutcome::Anchored(anchor) => Some(anchor),
            AnchorOutcome::NoOp => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnchorPolicy {
    /// Upper bound on leaves per anchor; the rest waits for the next run
    pub max_leaves_per_anchor: Option<u64>,
}

impl AnchorPolicy {
    /// Last sequence of an anchor starting at `start` with the chain head at
    /// `head`. A cap of zero counts as no cap.
    pub fn end_for(&self, start: u64, head: u64) -> u64 {
        match self.max_leaves_per_anchor {
            Some(max) if max > 0 => head.min(start.saturating_add(max - 1)),
            _ => head,
        }
    }
}

/// Builds and persists anchors. Runs for the same tenant are serialized;
/// different tenants proceed independently.
#[derive(Clone)]
pub struct MerkleAnchorer {
    store: Arc<dyn ChainStore>,
    scheduler: Arc<dyn Scheduler>,
    policy: AnchorPolicy,
    tenant_locks: Arc<Mutex<HashMap<TenantId, Arc<Mutex<()>>>>>,
}

impl MerkleAnchorer {
    pub fn new(
        store: Arc<dyn ChainStore>,
        scheduler: Arc<dyn Scheduler>,
        policy: AnchorPolicy,
    ) -> Self {
        Self {
            store,
            scheduler,
            policy,
            tenant_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn tenant_lock(&self, tenant: &TenantId) -> Arc<Mutex<()>> {
        let mut locks = self.tenant_locks.lock().await;
        Arc::clone(locks.entry(tenant.clone()).or_default())
    }

    /// Anchor the tenant's unanchored range as of now
    pub async fn anchor(&self, tenant: &TenantId) -> AuditResult<AnchorOutcome> {
        let lock = self.tenant_lock(tenant).await;
        let _guard = lock.lock().await;

        let start = self
            .store
            .last_anchor(tenant)
            .await?
            .map_or(0, |a| a.end_seq + 1);

        // Snapshot of the head; later appends wait for the next run
        let Some(head) = self.store.head(tenant).await? else {
            debug!("Tenant {} has no events, nothing to anchor", tenant);
            return Ok(AnchorOutcome::NoOp);
        };
        if start > head.sequence_number {
            debug!("Tenant {} fully anchored through {}", tenant, head.sequence_number);
            return Ok(AnchorOutcome::NoOp);
        }

        let end = self.policy.end_for(start, head.sequence_number);

        let leaves = self.store.leaf_hashes(tenant, start, end).await?;
        let expected = (end - start).saturating_add(1);
        if leaves.len() as u64 != expected {
            error!(
                "Tenant {}: expected {} leaves in [{}, {}], store returned {}",
                tenant,
                expected,
                start,
                end,
                leaves.len()
            );
            return Err(AuditError::Storage(format!(
                "Incomplete leaf range [{}, {}] for tenant {}",
                start, end, tenant
            )));
        }

        let anchor = Anchor::new(tenant.clone(), start, end, get_merkle_root(&leaves));

        match self.store.insert_anchor(&anchor).await {
            Ok(()) => {
                info!("Anchored {}", anchor.summary());
                Ok(AnchorOutcome::Anchored(anchor))
            }
            Err(e) if e.is_conflict() => {
                // Another process anchored this range first
                warn!("Anchor for {} at {} already exists", tenant, start);
                Ok(AnchorOutcome::NoOp)
            }
            Err(e) => Err(e),
        }
    }

    /// Anchor every tenant. A failing tenant is logged and skipped.
    pub async fn anchor_all(&self) -> AuditResult<Vec<Anchor>> {
        let mut anchored = Vec::new();
        for tenant in self.store.tenants().await? {
            match self.anchor(&tenant).await {
                Ok(AnchorOutcome::Anchored(anchor)) => anchored.push(anchor),
                Ok(AnchorOutcome::NoOp) => {}
                Err(e) => error!("Anchoring failed for tenant {}: {}", tenant, e),
            }
        }
        Ok(anchored)
    }

    /// Register the recurring anchoring run with the injected scheduler
    pub fn schedule(&self, interval: Duration) -> ScheduleHandle {
        let task = Arc::new(AnchoringTask {
            anchorer: self.clone(),
        });
        self.scheduler.schedule(interval, task)
    }
}

/// One anchoring pass over all tenants
pub struct AnchoringTask {
    anchorer: MerkleAnchorer,
}

#[async_trait]
impl RecurringTask for AnchoringTask {
    fn name(&self) -> &str {
        "merkle-anchoring"
    }

    async fn run(&self) -> AuditResult<()> {
        let anchored = self.anchorer.anchor_all().await?;
        if !anchored.is_empty() {
            info!("Anchoring run sealed {} anchor(s)", anchored.len());
        }
        Ok(())
    }
}
