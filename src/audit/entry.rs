//! Audit Event
//!
//! Defines the immutable, hash-chained audit event and its canonical byte
//! encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::audit::hash::{sha256, CanonicalEncoder, ChainHash};
use crate::error::{AuditError, AuditResult};

/// Current canonical encoding tag. Changing the layout requires a new tag;
/// existing events keep hashing under the tag they were written with.
pub const HASH_FORMAT_V1: u8 = 1;

/// Tenant isolation boundary. Sequencing and hashing are scoped per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The resource an audited action touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

/// Opaque caller payload. Hashed, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub schema_version: u16,
    #[serde(with = "hex::serde")]
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn new(schema_version: u16, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            schema_version,
            bytes: bytes.into(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new(1, Vec::new())
    }
}

/// A fact a producer wants recorded. Sequencing and hashing are added by the
/// appender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub actor_id: String,
    pub resource: ResourceRef,
    pub payload: Payload,
}

impl NewEvent {
    pub fn new(
        event_type: impl Into<String>,
        actor_id: impl Into<String>,
        resource: ResourceRef,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            actor_id: actor_id.into(),
            resource,
            payload: Payload::default(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// Immutable audit event in a per-tenant hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub sequence_number: u64,
    pub event_type: String,
    pub actor_id: String,
    pub resource: ResourceRef,
    pub payload: Payload,
    /// Informational only; ordering comes from `sequence_number`.
    pub created_at: DateTime<Utc>,
    pub hash_format: u8,
    pub previous_hash: ChainHash,
    pub event_hash: ChainHash,
}

impl AuditEvent {
    /// Seal a new event at `sequence_number`, linked to `previous_hash`.
    pub fn seal(
        tenant_id: TenantId,
        sequence_number: u64,
        previous_hash: ChainHash,
        new_event: NewEvent,
    ) -> Self {
        let mut event = Self {
            event_id: Uuid::new_v4(),
            tenant_id,
            sequence_number,
            event_type: new_event.event_type,
            actor_id: new_event.actor_id,
            resource: new_event.resource,
            payload: new_event.payload,
            created_at: now_micros(),
            hash_format: HASH_FORMAT_V1,
            previous_hash,
            event_hash: ChainHash::SENTINEL,
        };

        event.event_hash = link_hash(event.canonical_bytes_v1(), &event.previous_hash);
        event
    }

    /// Canonical bytes of every field except the two hashes, chosen by the
    /// event's format tag.
    pub fn canonical_bytes(&self) -> AuditResult<Vec<u8>> {
        match self.hash_format {
            HASH_FORMAT_V1 => Ok(self.canonical_bytes_v1()),
            other => Err(AuditError::UnsupportedHashFormat(other)),
        }
    }

    fn canonical_bytes_v1(&self) -> Vec<u8> {
        CanonicalEncoder::new()
            .u8(HASH_FORMAT_V1)
            .str(&self.event_id.hyphenated().to_string())
            .str(self.tenant_id.as_str())
            .u64(self.sequence_number)
            .str(&self.event_type)
            .str(&self.actor_id)
            .str(&self.resource.resource_type)
            .str(&self.resource.resource_id)
            .u16(self.payload.schema_version)
            .bytes(&self.payload.bytes)
            .i64(self.created_at.timestamp_micros())
            .finish()
    }

    /// `SHA256(canonical_bytes || previous_hash)`
    pub fn calculate_hash(&self) -> AuditResult<ChainHash> {
        Ok(link_hash(self.canonical_bytes()?, &self.previous_hash))
    }

    /// Verify the stored hash against a recomputation from the stored fields
    pub fn verify_hash(&self) -> bool {
        matches!(self.calculate_hash(), Ok(hash) if hash == self.event_hash)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}#{} {} by {} on {}/{}",
            self.tenant_id,
            self.sequence_number,
            self.event_type,
            self.actor_id,
            self.resource.resource_type,
            self.resource.resource_id
        )
    }
}

fn link_hash(mut canonical: Vec<u8>, previous_hash: &ChainHash) -> ChainHash {
    canonical.extend_from_slice(previous_hash.as_bytes());
    sha256(&canonical)
}

/// Current time truncated to the microsecond precision that is hashed and stored
pub(crate) fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(n: u32) -> NewEvent {
        NewEvent::new(
            "document.viewed",
            format!("user-{}", n),
            ResourceRef::new("document", format!("doc-{}", n)),
        )
        .with_payload(Payload::new(1, format!("{{\"n\":{}}}", n).into_bytes()))
    }

    #[test]
    fn test_seal_produces_verifiable_hash() {
        let event = AuditEvent::seal(TenantId::new("acme"), 0, ChainHash::SENTINEL, new_event(1));

        assert_eq!(event.sequence_number, 0);
        assert_eq!(event.previous_hash, ChainHash::SENTINEL);
        assert_eq!(event.hash_format, HASH_FORMAT_V1);
        assert!(event.verify_hash());
        assert_eq!(event.created_at.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_hash_commits_to_previous_hash() {
        let a = AuditEvent::seal(TenantId::new("acme"), 1, ChainHash::SENTINEL, new_event(1));
        let mut b = a.clone();
        b.previous_hash = sha256(b"other");
        assert_ne!(a.calculate_hash().unwrap(), b.calculate_hash().unwrap());
    }

    #[test]
    fn test_payload_mutation_is_detected() {
        let mut event = AuditEvent::seal(TenantId::new("acme"), 0, ChainHash::SENTINEL, new_event(1));
        event.payload.bytes[0] ^= 0x01;
        assert!(!event.verify_hash());
    }

    #[test]
    fn test_every_field_is_committed() {
        let base = AuditEvent::seal(TenantId::new("acme"), 3, ChainHash::SENTINEL, new_event(7));
        let mutations: Vec<Box<dyn Fn(&mut AuditEvent)>> = vec![
            Box::new(|e: &mut AuditEvent| e.event_id = Uuid::new_v4()),
            Box::new(|e: &mut AuditEvent| e.tenant_id = TenantId::new("other")),
            Box::new(|e: &mut AuditEvent| e.sequence_number += 1),
            Box::new(|e: &mut AuditEvent| e.event_type.push('x')),
            Box::new(|e: &mut AuditEvent| e.actor_id.push('x')),
            Box::new(|e: &mut AuditEvent| e.resource.resource_type.push('x')),
            Box::new(|e: &mut AuditEvent| e.resource.resource_id.push('x')),
            Box::new(|e: &mut AuditEvent| e.payload.schema_version += 1),
            Box::new(|e: &mut AuditEvent| e.created_at += chrono::Duration::microseconds(1)),
        ];

        for (i, mutate) in mutations.iter().enumerate() {
            let mut event = base.clone();
            mutate(&mut event);
            assert!(!event.verify_hash(), "mutation {} was not detected", i);
        }
    }

    #[test]
    fn test_unknown_format_tag_is_rejected() {
        let mut event = AuditEvent::seal(TenantId::new("acme"), 0, ChainHash::SENTINEL, new_event(1));
        event.hash_format = 9;
        assert!(matches!(
            event.calculate_hash(),
            Err(AuditError::UnsupportedHashFormat(9))
        ));
        assert!(!event.verify_hash());
    }

    #[test]
    fn test_event_json_round_trip_keeps_hash_valid() {
        let event = AuditEvent::seal(TenantId::new("acme"), 0, ChainHash::SENTINEL, new_event(2));
        let json = serde_json::to_string(&event).unwrap();
        let back: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(back.verify_hash());
    }
}
