//! Chain Store
//!
//! The only component allowed to persist events, anchors and verification
//! records. Every backend is append-only: there is no update or delete
//! operation for committed rows.

pub mod memory;

use async_trait::async_trait;

use crate::audit::anchor::Anchor;
use crate::audit::entry::{AuditEvent, TenantId};
use crate::audit::hash::ChainHash;
use crate::audit::verify::VerificationRecord;
use crate::error::AuditResult;

pub use memory::InMemoryChainStore;

/// Last committed event of a tenant's chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    pub sequence_number: u64,
    pub event_hash: ChainHash,
}

impl ChainHead {
    /// Sequence number and previous hash the next event must carry
    pub fn next_link(head: Option<ChainHead>) -> (u64, ChainHash) {
        match head {
            Some(h) => (h.sequence_number + 1, h.event_hash),
            None => (0, ChainHash::SENTINEL),
        }
    }
}

/// Durable, append-only, per-tenant ordered record of audit events.
///
/// Implementations must uphold:
/// - `append_event` is atomic and succeeds only when the event is exactly the
///   tenant's next link (sequence `head + 1`, `previous_hash == head hash`);
///   otherwise it fails with `AuditError::Conflict` and stores nothing.
/// - `insert_anchor` succeeds only for the range starting right after the
///   tenant's last anchor and ending at or before the head.
/// - Reads return whatever was durably committed at read time.
#[async_trait]
pub trait ChainStore: Send + Sync {
    async fn head(&self, tenant: &TenantId) -> AuditResult<Option<ChainHead>>;

    async fn append_event(&self, event: &AuditEvent) -> AuditResult<()>;

    async fn get_event(&self, tenant: &TenantId, sequence_number: u64)
        -> AuditResult<Option<AuditEvent>>;

    /// Events with `start <= sequence_number <= end`, ordered by sequence.
    async fn read_range(&self, tenant: &TenantId, start: u64, end: u64)
        -> AuditResult<Vec<AuditEvent>>;

    /// Ordered `event_hash` values of `[start, end]`.
    async fn leaf_hashes(&self, tenant: &TenantId, start: u64, end: u64)
        -> AuditResult<Vec<ChainHash>> {
        Ok(self
            .read_range(tenant, start, end)
            .await?
            .into_iter()
            .map(|event| event.event_hash)
            .collect())
    }

    /// Every tenant with at least one committed event.
    async fn tenants(&self) -> AuditResult<Vec<TenantId>>;

    async fn last_anchor(&self, tenant: &TenantId) -> AuditResult<Option<Anchor>>;

    async fn insert_anchor(&self, anchor: &Anchor) -> AuditResult<()>;

    async fn anchor_covering(&self, tenant: &TenantId, sequence_number: u64)
        -> AuditResult<Option<Anchor>>;

    /// Anchors lying entirely inside `[start, end]`, ordered by `start_seq`.
    async fn anchors_within(&self, tenant: &TenantId, start: u64, end: u64)
        -> AuditResult<Vec<Anchor>>;

    async fn insert_verification(&self, record: &VerificationRecord) -> AuditResult<()>;

    async fn verifications(&self, tenant: &TenantId) -> AuditResult<Vec<VerificationRecord>>;
}
