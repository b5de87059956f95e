//! Audit Chain
//!
//! Tamper-evident audit trail: per-tenant SHA-256 hash chains, periodic
//! Merkle anchoring, inclusion proofs and range verification.

pub mod anchor;
pub mod appender;
pub mod entry;
pub mod hash;
pub mod merkle;
pub mod proof;
pub mod trail;
pub mod verify;

pub use anchor::{Anchor, AnchorOutcome, AnchorPolicy, AnchoringTask, MerkleAnchorer};
pub use appender::EventAppender;
pub use entry::{AuditEvent, NewEvent, Payload, ResourceRef, TenantId, HASH_FORMAT_V1};
pub use hash::{hash_pair, sha256, ChainHash};
pub use merkle::{get_merkle_root, verify_merkle_root, verify_proof, MerkleTree, ProofStep, Side};
pub use proof::{InclusionProof, ProofGenerator};
pub use trail::{AuditTrail, ChainStatus, RecordedEvent};
pub use verify::{
    find_breaks, verify_chain, verify_chain_from, CancelFlag, ChainCheck, ChainVerifier,
    ChainWalker, Discrepancy, DiscrepancyKind, VerificationRecord, VerificationStatus,
};
