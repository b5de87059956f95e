//! Event Appender
//!
//! Seals a new event onto the tail of a tenant's chain. One call is one
//! attempt: the store rejects the write with `Conflict` when another writer
//! advanced the chain in between, and the caller decides whether to retry.

use std::sync::Arc;
use tracing::debug;

use crate::audit::entry::{AuditEvent, NewEvent, TenantId};
use crate::error::AuditResult;
use crate::store::{ChainHead, ChainStore};

#[derive(Clone)]
pub struct EventAppender {
    store: Arc<dyn ChainStore>,
}

impl EventAppender {
    pub fn new(store: Arc<dyn ChainStore>) -> Self {
        Self { store }
    }

    /// Append `new_event` as the tenant's next link
    pub async fn append(&self, tenant: &TenantId, new_event: NewEvent) -> AuditResult<AuditEvent> {
        let head = self.store.head(tenant).await?;
        let (sequence_number, previous_hash) = ChainHead::next_link(head);

        let event = AuditEvent::seal(tenant.clone(), sequence_number, previous_hash, new_event);

        self.store
            .append_event(&event)
            .await
            .map_err(|e| e.with_conflict_context(tenant.as_str(), sequence_number))?;

        debug!("Appended {} -> {}", event.summary(), event.event_hash);
        Ok(event)
    }
}
