//! Audit Chain Verification
//!
//! Pure hash-chain checks over in-memory event slices, plus the composite
//! `ChainVerifier` that walks a stored range in batches and re-derives every
//! anchor root inside it.
//!
//! Discrepancies report `expected` as the value committed earlier (the
//! predecessor's hash, the stored event hash, the stored anchor root) and
//! `actual` as what the stored data produces now.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::anchor::Anchor;
use crate::audit::entry::{now_micros, AuditEvent, TenantId, HASH_FORMAT_V1};
use crate::audit::hash::ChainHash;
use crate::audit::merkle::get_merkle_root;
use crate::error::{AuditError, AuditResult};
use crate::store::ChainStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Valid,
    ChainBroken,
    RootMismatch,
    Incomplete,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Valid => "VALID",
            VerificationStatus::ChainBroken => "CHAIN_BROKEN",
            VerificationStatus::RootMismatch => "ROOT_MISMATCH",
            VerificationStatus::Incomplete => "INCOMPLETE",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VALID" => Ok(VerificationStatus::Valid),
            "CHAIN_BROKEN" => Ok(VerificationStatus::ChainBroken),
            "ROOT_MISMATCH" => Ok(VerificationStatus::RootMismatch),
            "INCOMPLETE" => Ok(VerificationStatus::Incomplete),
            other => Err(AuditError::Serialization(format!(
                "Unknown verification status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    PreviousHashMismatch,
    EventHashMismatch,
    SequenceGap,
    RootMismatch,
    LeafCountMismatch,
    UnsupportedHashFormat,
    MalformedRow,
    AnchorOverlap,
    AnchorGap,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::PreviousHashMismatch => "previous_hash_mismatch",
            DiscrepancyKind::EventHashMismatch => "event_hash_mismatch",
            DiscrepancyKind::SequenceGap => "sequence_gap",
            DiscrepancyKind::RootMismatch => "root_mismatch",
            DiscrepancyKind::LeafCountMismatch => "leaf_count_mismatch",
            DiscrepancyKind::UnsupportedHashFormat => "unsupported_hash_format",
            DiscrepancyKind::MalformedRow => "malformed_row",
            DiscrepancyKind::AnchorOverlap => "anchor_overlap",
            DiscrepancyKind::AnchorGap => "anchor_gap",
        }
    }
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscrepancyKind {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "previous_hash_mismatch" => Ok(DiscrepancyKind::PreviousHashMismatch),
            "event_hash_mismatch" => Ok(DiscrepancyKind::EventHashMismatch),
            "sequence_gap" => Ok(DiscrepancyKind::SequenceGap),
            "root_mismatch" => Ok(DiscrepancyKind::RootMismatch),
            "leaf_count_mismatch" => Ok(DiscrepancyKind::LeafCountMismatch),
            "unsupported_hash_format" => Ok(DiscrepancyKind::UnsupportedHashFormat),
            "malformed_row" => Ok(DiscrepancyKind::MalformedRow),
            "anchor_overlap" => Ok(DiscrepancyKind::AnchorOverlap),
            "anchor_gap" => Ok(DiscrepancyKind::AnchorGap),
            other => Err(AuditError::Serialization(format!(
                "Unknown discrepancy kind: {}",
                other
            ))),
        }
    }
}

/// Location and nature of the first integrity failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub sequence_number: u64,
    pub kind: DiscrepancyKind,
    pub expected: String,
    pub actual: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_id: Option<Uuid>,
}

impl Discrepancy {
    fn hashes(sequence_number: u64, kind: DiscrepancyKind, expected: &ChainHash, actual: &ChainHash) -> Self {
        Self {
            sequence_number,
            kind,
            expected: expected.to_hex(),
            actual: actual.to_hex(),
            anchor_id: None,
        }
    }

    fn gap(expected_seq: u64, found: Option<u64>) -> Self {
        Self {
            sequence_number: expected_seq,
            kind: DiscrepancyKind::SequenceGap,
            expected: expected_seq.to_string(),
            actual: found.map_or_else(|| "missing".to_string(), |seq| seq.to_string()),
            anchor_id: None,
        }
    }

    fn malformed(sequence_number: u64, reason: String) -> Self {
        Self {
            sequence_number,
            kind: DiscrepancyKind::MalformedRow,
            expected: "decodable row".to_string(),
            actual: reason,
            anchor_id: None,
        }
    }
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at sequence {}: expected {}, actual {}",
            self.kind, self.sequence_number, self.expected, self.actual
        )?;
        if let Some(anchor_id) = self.anchor_id {
            write!(f, " (anchor {})", anchor_id)?;
        }
        Ok(())
    }
}

/// Outcome of a pure chain check over a slice of events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCheck {
    Valid {
        events_checked: u64,
    },
    /// Everything from `discrepancy.sequence_number` onward is unverified
    Broken {
        discrepancy: Discrepancy,
        verified_through: Option<u64>,
    },
}

impl ChainCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainCheck::Valid { .. })
    }

    pub fn discrepancy(&self) -> Option<&Discrepancy> {
        match self {
            ChainCheck::Valid { .. } => None,
            ChainCheck::Broken { discrepancy, .. } => Some(discrepancy),
        }
    }
}

/// Incremental link checker. Feed events in order; the first failure is
/// final.
#[derive(Debug, Clone)]
pub struct ChainWalker {
    expected_prev: ChainHash,
    expected_seq: Option<u64>,
    last_verified: Option<u64>,
    checked: u64,
}

impl ChainWalker {
    /// Start from the sentinel; the first event's sequence is taken as given.
    pub fn new() -> Self {
        Self::from_hash(ChainHash::SENTINEL)
    }

    pub fn from_hash(expected_prev: ChainHash) -> Self {
        Self {
            expected_prev,
            expected_seq: None,
            last_verified: None,
            checked: 0,
        }
    }

    /// Continue a chain whose event `next_seq - 1` hashed to `prev_hash`
    pub fn resume(prev_hash: ChainHash, next_seq: u64) -> Self {
        Self {
            expected_prev: prev_hash,
            expected_seq: Some(next_seq),
            last_verified: next_seq.checked_sub(1),
            checked: 0,
        }
    }

    pub fn check(&mut self, event: &AuditEvent) -> Result<(), Discrepancy> {
        if let Some(expected_seq) = self.expected_seq {
            if event.sequence_number != expected_seq {
                return Err(Discrepancy::gap(expected_seq, Some(event.sequence_number)));
            }
        }

        if event.previous_hash != self.expected_prev {
            return Err(Discrepancy::hashes(
                event.sequence_number,
                DiscrepancyKind::PreviousHashMismatch,
                &self.expected_prev,
                &event.previous_hash,
            ));
        }

        check_event_hash(event)?;

        self.expected_prev = event.event_hash;
        self.expected_seq = Some(event.sequence_number + 1);
        self.last_verified = Some(event.sequence_number);
        self.checked += 1;
        Ok(())
    }

    /// Sequence number the next event must carry, once known
    pub fn next_seq(&self) -> Option<u64> {
        self.expected_seq
    }

    pub fn last_verified(&self) -> Option<u64> {
        self.last_verified
    }

    pub fn checked(&self) -> u64 {
        self.checked
    }
}

impl Default for ChainWalker {
    fn default() -> Self {
        Self::new()
    }
}

fn check_event_hash(event: &AuditEvent) -> Result<(), Discrepancy> {
    match event.calculate_hash() {
        Ok(actual) if actual == event.event_hash => Ok(()),
        Ok(actual) => Err(Discrepancy::hashes(
            event.sequence_number,
            DiscrepancyKind::EventHashMismatch,
            &event.event_hash,
            &actual,
        )),
        Err(_) => Err(Discrepancy {
            sequence_number: event.sequence_number,
            kind: DiscrepancyKind::UnsupportedHashFormat,
            expected: HASH_FORMAT_V1.to_string(),
            actual: event.hash_format.to_string(),
            anchor_id: None,
        }),
    }
}

/// Verify a chain that starts at the sentinel
pub fn verify_chain(events: &[AuditEvent]) -> ChainCheck {
    verify_chain_from(ChainHash::SENTINEL, events)
}

/// Verify a chain segment whose first event must link to `expected_prev`
pub fn verify_chain_from(expected_prev: ChainHash, events: &[AuditEvent]) -> ChainCheck {
    let mut walker = ChainWalker::from_hash(expected_prev);
    for event in events {
        if let Err(discrepancy) = walker.check(event) {
            return ChainCheck::Broken {
                discrepancy,
                verified_through: walker.last_verified(),
            };
        }
    }
    ChainCheck::Valid {
        events_checked: walker.checked(),
    }
}

/// Every event that fails on its own: bad hash, or a bad link to the event
/// right before it in the slice. Unlike `verify_chain` this keeps going.
pub fn find_breaks(events: &[AuditEvent]) -> Vec<Discrepancy> {
    let mut breaks = Vec::new();
    for (i, event) in events.iter().enumerate() {
        let link = match i.checked_sub(1).map(|p| &events[p]) {
            Some(prev) => Some((prev.sequence_number + 1, prev.event_hash)),
            None if event.sequence_number == 0 => Some((0, ChainHash::SENTINEL)),
            None => None,
        };

        if let Some((expected_seq, expected_prev)) = link {
            if event.sequence_number != expected_seq {
                breaks.push(Discrepancy::gap(expected_seq, Some(event.sequence_number)));
            } else if event.previous_hash != expected_prev {
                breaks.push(Discrepancy::hashes(
                    event.sequence_number,
                    DiscrepancyKind::PreviousHashMismatch,
                    &expected_prev,
                    &event.previous_hash,
                ));
            }
        }

        if let Err(discrepancy) = check_event_hash(event) {
            breaks.push(discrepancy);
        }
    }
    breaks
}

/// Cooperative cancellation for long verification runs
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Persisted result of one range verification run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub record_id: Uuid,
    pub tenant_id: TenantId,
    pub status: VerificationStatus,
    pub start_seq: u64,
    pub end_seq: u64,
    pub events_checked: u64,
    pub anchors_checked: u64,
    pub discrepancy: Option<Discrepancy>,
    pub checked_at: DateTime<Utc>,
}

impl VerificationRecord {
    pub fn is_valid(&self) -> bool {
        self.status == VerificationStatus::Valid
    }

    /// Turn integrity failures into errors; `VALID` and `INCOMPLETE` pass
    pub fn into_result(self) -> AuditResult<VerificationRecord> {
        match (self.status, &self.discrepancy) {
            (VerificationStatus::ChainBroken, Some(d)) => Err(AuditError::ChainBroken(d.clone())),
            (VerificationStatus::RootMismatch, Some(d)) => Err(AuditError::RootMismatch(d.clone())),
            _ => Ok(self),
        }
    }
}

/// Walks stored ranges and re-derives anchor roots
#[derive(Clone)]
pub struct ChainVerifier {
    store: Arc<dyn ChainStore>,
    batch_size: u64,
}

/// Anchor being re-derived, with the leaves seen so far
struct PendingAnchor {
    anchor: Anchor,
    leaves: Vec<ChainHash>,
}

impl PendingAnchor {
    fn new(anchor: Anchor) -> Self {
        Self {
            leaves: Vec::with_capacity(anchor.leaf_count.min(1 << 16) as usize),
            anchor,
        }
    }

    fn check(&self) -> Result<(), Discrepancy> {
        let span = self
            .anchor
            .end_seq
            .checked_sub(self.anchor.start_seq)
            .map(|d| d + 1);
        if span != Some(self.anchor.leaf_count) || self.leaves.len() as u64 != self.anchor.leaf_count {
            return Err(Discrepancy {
                sequence_number: self.anchor.start_seq,
                kind: DiscrepancyKind::LeafCountMismatch,
                expected: self.anchor.leaf_count.to_string(),
                actual: self.leaves.len().to_string(),
                anchor_id: Some(self.anchor.anchor_id),
            });
        }

        let actual = get_merkle_root(&self.leaves);
        if actual != self.anchor.root_hash {
            let mut discrepancy = Discrepancy::hashes(
                self.anchor.start_seq,
                DiscrepancyKind::RootMismatch,
                &self.anchor.root_hash,
                &actual,
            );
            discrepancy.anchor_id = Some(self.anchor.anchor_id);
            return Err(discrepancy);
        }
        Ok(())
    }
}

/// Consecutive anchors must tile their range with no overlap and no hole
fn check_anchor_layout(anchors: &[Anchor]) -> Result<(), Discrepancy> {
    for pair in anchors.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let expected = prev.end_seq.saturating_add(1);
        if next.start_seq != expected {
            let kind = if next.start_seq <= prev.end_seq {
                DiscrepancyKind::AnchorOverlap
            } else {
                DiscrepancyKind::AnchorGap
            };
            return Err(Discrepancy {
                sequence_number: next.start_seq,
                kind,
                expected: expected.to_string(),
                actual: next.start_seq.to_string(),
                anchor_id: Some(next.anchor_id),
            });
        }
    }
    Ok(())
}

/// Feeds walked events to every anchor that covers them. Each anchor is
/// checked on its own once its last event has been seen.
struct AnchorTracker {
    queued: std::iter::Peekable<std::vec::IntoIter<Anchor>>,
    active: Vec<PendingAnchor>,
    checked: u64,
    first_failure: Option<Discrepancy>,
}

impl AnchorTracker {
    fn new(mut anchors: Vec<Anchor>) -> Self {
        anchors.sort_by_key(|a| (a.start_seq, a.end_seq));
        let first_failure = check_anchor_layout(&anchors).err();
        Self {
            queued: anchors.into_iter().peekable(),
            active: Vec::new(),
            checked: 0,
            first_failure,
        }
    }

    fn failed(discrepancy: Discrepancy) -> Self {
        let mut tracker = Self::new(Vec::new());
        tracker.first_failure = Some(discrepancy);
        tracker
    }

    fn observe(&mut self, event: &AuditEvent) {
        let seq = event.sequence_number;
        while let Some(anchor) = self.queued.next_if(|a| a.start_seq <= seq) {
            self.active.push(PendingAnchor::new(anchor));
        }

        let mut finished = Vec::new();
        self.active.retain_mut(|pending| {
            if pending.anchor.covers(seq) {
                pending.leaves.push(event.event_hash);
            }
            if pending.anchor.end_seq > seq {
                return true;
            }
            finished.push(pending.check());
            false
        });

        for result in finished {
            self.checked += 1;
            if let Err(discrepancy) = result {
                self.first_failure.get_or_insert(discrepancy);
            }
        }
    }

    /// Feed `events` after the chain walker has accepted them; stops at the
    /// first chain failure.
    fn walk(&mut self, walker: &mut ChainWalker, events: &[AuditEvent]) -> Result<(), Discrepancy> {
        for event in events {
            walker.check(event)?;
            self.observe(event);
        }
        Ok(())
    }
}

impl ChainVerifier {
    pub fn new(store: Arc<dyn ChainStore>, batch_size: u64) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Verify `[start, end]` of a tenant's chain and every anchor inside it.
    /// The record is persisted before it is returned.
    pub async fn verify_range(
        &self,
        tenant: &TenantId,
        start: u64,
        end: u64,
        cancel: &CancelFlag,
    ) -> AuditResult<VerificationRecord> {
        if start > end {
            return Err(AuditError::InvalidRange { start, end });
        }

        let head_seq = self.store.head(tenant).await?.map(|h| h.sequence_number);
        let mut chain_break: Option<Discrepancy> = None;
        let mut root_mismatch: Option<Discrepancy> = None;
        let mut cancelled = false;
        let mut events_checked = 0;
        let mut anchors_checked = 0;

        match head_seq {
            Some(head) if start <= head => {
                let last = end.min(head);
                let walker = self.start_walker(tenant, start).await?;
                match walker {
                    Err(discrepancy) => chain_break = Some(discrepancy),
                    Ok(mut walker) => {
                        let mut tracker = match self.store.anchors_within(tenant, start, last).await {
                            Ok(anchors) => AnchorTracker::new(anchors),
                            Err(AuditError::MalformedRow { sequence_number, reason, .. }) => {
                                AnchorTracker::failed(Discrepancy::malformed(sequence_number, reason))
                            }
                            Err(err) => return Err(err),
                        };

                        let mut batch_start = start;
                        while batch_start <= last {
                            if cancel.is_cancelled() {
                                info!("Verification of {} cancelled at {}", tenant, batch_start);
                                cancelled = true;
                                break;
                            }

                            let batch_end = last.min(batch_start.saturating_add(self.batch_size - 1));
                            let (events, malformed) =
                                match self.store.read_range(tenant, batch_start, batch_end).await {
                                    Ok(events) => (events, None),
                                    Err(AuditError::MalformedRow { sequence_number, reason, .. }) => {
                                        // Rows before the undecodable one still get checked
                                        let prefix = match sequence_number.checked_sub(1) {
                                            Some(prev) if prev >= batch_start => {
                                                self.store.read_range(tenant, batch_start, prev).await?
                                            }
                                            _ => Vec::new(),
                                        };
                                        (prefix, Some(Discrepancy::malformed(sequence_number, reason)))
                                    }
                                    Err(err) => return Err(err),
                                };
                            debug!(
                                "Verifying {} [{}, {}]: {} events",
                                tenant,
                                batch_start,
                                batch_end,
                                events.len()
                            );

                            if let Err(discrepancy) = tracker.walk(&mut walker, &events) {
                                chain_break = Some(discrepancy);
                                break;
                            }

                            if let Some(malformed) = malformed {
                                let hole = walker
                                    .next_seq()
                                    .filter(|next| *next < malformed.sequence_number);
                                chain_break = Some(match hole {
                                    Some(next) => Discrepancy::gap(next, Some(malformed.sequence_number)),
                                    None => malformed,
                                });
                                break;
                            }

                            // Trailing events of the batch are missing
                            if let Some(next) = walker.next_seq().filter(|next| *next <= batch_end) {
                                chain_break = Some(Discrepancy::gap(next, None));
                                break;
                            }
                            batch_start = batch_end + 1;
                        }
                        anchors_checked = tracker.checked;
                        root_mismatch = tracker.first_failure;
                        events_checked = walker.checked();
                    }
                }
            }
            _ => debug!("Range [{}, {}] of {} is past the head", start, end, tenant),
        }

        let past_head = head_seq.map_or(true, |head| end > head);
        let (status, discrepancy) = match (chain_break, root_mismatch) {
            (Some(d), _) => (VerificationStatus::ChainBroken, Some(d)),
            (None, Some(d)) => (VerificationStatus::RootMismatch, Some(d)),
            (None, None) if cancelled || past_head => (VerificationStatus::Incomplete, None),
            (None, None) => (VerificationStatus::Valid, None),
        };

        let record = VerificationRecord {
            record_id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            status,
            start_seq: start,
            end_seq: end,
            events_checked,
            anchors_checked,
            discrepancy,
            checked_at: now_micros(),
        };

        match &record.discrepancy {
            Some(d) => warn!("Integrity failure in {} [{}, {}]: {}", tenant, start, end, d),
            None => info!(
                "Verified {} [{}, {}]: {} ({} events, {} anchors)",
                tenant, start, end, record.status, events_checked, anchors_checked
            ),
        }

        self.store.insert_verification(&record).await?;
        Ok(record)
    }

    /// Walker positioned so that `start` must link to the stored hash of
    /// `start - 1`
    async fn start_walker(
        &self,
        tenant: &TenantId,
        start: u64,
    ) -> AuditResult<Result<ChainWalker, Discrepancy>> {
        if start == 0 {
            return Ok(Ok(ChainWalker::resume(ChainHash::SENTINEL, 0)));
        }
        Ok(match self.store.get_event(tenant, start - 1).await {
            Ok(Some(prev)) => Ok(ChainWalker::resume(prev.event_hash, start)),
            Ok(None) => Err(Discrepancy::gap(start - 1, None)),
            Err(AuditError::MalformedRow { sequence_number, reason, .. }) => {
                Err(Discrepancy::malformed(sequence_number, reason))
            }
            Err(err) => return Err(err),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::anchor::{AnchorPolicy, MerkleAnchorer};
    use crate::audit::appender::EventAppender;
    use crate::audit::entry::{NewEvent, Payload, ResourceRef};
    use crate::scheduler::ManualScheduler;
    use crate::store::InMemoryChainStore;

    fn chain(count: u64) -> Vec<AuditEvent> {
        let tenant = TenantId::new("acme");
        let mut prev = ChainHash::SENTINEL;
        (0..count)
            .map(|seq| {
                let event = AuditEvent::seal(
                    tenant.clone(),
                    seq,
                    prev,
                    NewEvent::new("doc.viewed", "carol", ResourceRef::new("doc", format!("d-{}", seq))),
                );
                prev = event.event_hash;
                event
            })
            .collect()
    }

    async fn stored_chain(count: usize) -> (Arc<InMemoryChainStore>, TenantId) {
        let store = Arc::new(InMemoryChainStore::new());
        let appender = EventAppender::new(store.clone());
        let tenant = TenantId::new("acme");
        for i in 0..count {
            appender
                .append(
                    &tenant,
                    NewEvent::new("doc.viewed", "carol", ResourceRef::new("doc", format!("d-{}", i))),
                )
                .await
                .unwrap();
        }
        (store, tenant)
    }

    fn anchorer(store: &Arc<InMemoryChainStore>, max_leaves: Option<u64>) -> MerkleAnchorer {
        MerkleAnchorer::new(
            store.clone(),
            Arc::new(ManualScheduler::new()),
            AnchorPolicy { max_leaves_per_anchor: max_leaves },
        )
    }

    #[test]
    fn test_valid_chains_of_any_length() {
        for count in 0..8 {
            let check = verify_chain(&chain(count));
            assert_eq!(check, ChainCheck::Valid { events_checked: count });
        }
    }

    #[test]
    fn test_flipped_hash_breaks_at_that_sequence() {
        let mut events = chain(6);
        events[3].event_hash = events[3].event_hash.with_flipped_bit(5);

        match verify_chain(&events) {
            ChainCheck::Broken { discrepancy, verified_through } => {
                assert_eq!(discrepancy.sequence_number, 3);
                assert_eq!(discrepancy.kind, DiscrepancyKind::EventHashMismatch);
                assert_eq!(discrepancy.expected, events[3].event_hash.to_hex());
                assert_eq!(verified_through, Some(2));
            }
            other => panic!("expected broken chain, got {:?}", other),
        }
    }

    #[test]
    fn test_mutated_payload_breaks_at_that_sequence() {
        let mut events = chain(4);
        events[1].payload = Payload::new(1, b"rewritten".to_vec());

        let check = verify_chain(&events);
        let discrepancy = check.discrepancy().unwrap();
        assert_eq!(discrepancy.sequence_number, 1);
        assert_eq!(discrepancy.kind, DiscrepancyKind::EventHashMismatch);
    }

    #[test]
    fn test_first_event_must_link_to_sentinel() {
        let events = chain(3);
        let check = verify_chain(&events[1..]);
        let discrepancy = check.discrepancy().unwrap();
        assert_eq!(discrepancy.kind, DiscrepancyKind::PreviousHashMismatch);
        assert_eq!(discrepancy.expected, ChainHash::SENTINEL.to_hex());

        assert!(verify_chain_from(events[0].event_hash, &events[1..]).is_valid());
    }

    #[test]
    fn test_missing_event_is_sequence_gap() {
        let mut events = chain(5);
        events.remove(2);
        let discrepancy = verify_chain(&events).discrepancy().cloned().unwrap();
        assert_eq!(discrepancy.kind, DiscrepancyKind::SequenceGap);
        assert_eq!(discrepancy.sequence_number, 2);
        assert_eq!(discrepancy.actual, "3");
    }

    #[test]
    fn test_unknown_hash_format_is_reported() {
        let mut events = chain(2);
        events[1].hash_format = 9;
        let discrepancy = verify_chain(&events).discrepancy().cloned().unwrap();
        assert_eq!(discrepancy.kind, DiscrepancyKind::UnsupportedHashFormat);
        assert_eq!(discrepancy.actual, "9");
    }

    #[test]
    fn test_find_breaks_lists_independent_failures() {
        let mut events = chain(8);
        events[2].actor_id = "mallory".to_string();
        events[6].event_hash = events[6].event_hash.with_flipped_bit(0);

        let breaks = find_breaks(&events);
        let found: Vec<_> = breaks.iter().map(|d| (d.sequence_number, d.kind)).collect();
        assert_eq!(
            found,
            vec![
                (2, DiscrepancyKind::EventHashMismatch),
                (6, DiscrepancyKind::EventHashMismatch),
                (7, DiscrepancyKind::PreviousHashMismatch),
            ]
        );
    }

    #[test]
    fn test_status_strings() {
        for status in [
            VerificationStatus::Valid,
            VerificationStatus::ChainBroken,
            VerificationStatus::RootMismatch,
            VerificationStatus::Incomplete,
        ] {
            assert_eq!(status.as_str().parse::<VerificationStatus>().unwrap(), status);
            assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{}\"", status));
        }
        assert!("BROKEN".parse::<VerificationStatus>().is_err());
    }

    #[tokio::test]
    async fn test_verify_range_valid_with_anchors() {
        let (store, tenant) = stored_chain(10).await;
        let anchorer = anchorer(&store, Some(4));
        while anchorer.anchor(&tenant).await.unwrap().anchor().is_some() {}

        let verifier = ChainVerifier::new(store.clone(), 3);
        let record = verifier
            .verify_range(&tenant, 0, 9, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(record.status, VerificationStatus::Valid);
        assert_eq!(record.events_checked, 10);
        assert_eq!(record.anchors_checked, 3);
        assert!(record.discrepancy.is_none());
        assert_eq!(store.verifications(&tenant).await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_verify_range_from_middle_links_to_stored_predecessor() {
        let (store, tenant) = stored_chain(6).await;
        let verifier = ChainVerifier::new(store.clone(), 2);
        let record = verifier
            .verify_range(&tenant, 3, 5, &CancelFlag::new())
            .await
            .unwrap();
        assert!(record.is_valid());
        assert_eq!(record.events_checked, 3);
    }

    #[tokio::test]
    async fn test_tampered_event_is_chain_broken() {
        let (store, tenant) = stored_chain(6).await;
        store
            .tamper_with(&tenant, 2, |e| e.payload = Payload::new(1, b"forged".to_vec()))
            .await;

        let verifier = ChainVerifier::new(store.clone(), 100);
        let record = verifier
            .verify_range(&tenant, 0, 5, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(record.status, VerificationStatus::ChainBroken);
        assert_eq!(record.events_checked, 2);
        let discrepancy = record.discrepancy.clone().unwrap();
        assert_eq!(discrepancy.sequence_number, 2);

        match record.into_result() {
            Err(AuditError::ChainBroken(d)) => assert_eq!(d, discrepancy),
            other => panic!("expected ChainBroken, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tampered_anchor_is_root_mismatch() {
        let (store, tenant) = stored_chain(5).await;
        let anchor = anchorer(&store, None).anchor(&tenant).await.unwrap();
        let anchor = anchor.anchor().unwrap().clone();
        store
            .tamper_with_anchor(&tenant, 0, |a| a.root_hash = a.root_hash.with_flipped_bit(3))
            .await;

        let verifier = ChainVerifier::new(store.clone(), 100);
        let record = verifier
            .verify_range(&tenant, 0, 4, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(record.status, VerificationStatus::RootMismatch);
        let discrepancy = record.discrepancy.clone().unwrap();
        assert_eq!(discrepancy.kind, DiscrepancyKind::RootMismatch);
        assert_eq!(discrepancy.anchor_id, Some(anchor.anchor_id));
        assert_eq!(discrepancy.actual, anchor.root_hash.to_hex());
        assert!(record.into_result().unwrap_err().is_tamper_signal());
    }

    #[tokio::test]
    async fn test_range_past_head_is_incomplete() {
        let (store, tenant) = stored_chain(3).await;
        let verifier = ChainVerifier::new(store.clone(), 10);

        let record = verifier
            .verify_range(&tenant, 0, 10, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(record.status, VerificationStatus::Incomplete);
        assert_eq!(record.events_checked, 3);

        let empty = verifier
            .verify_range(&TenantId::new("nobody"), 0, 0, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(empty.status, VerificationStatus::Incomplete);
        assert_eq!(empty.events_checked, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_incomplete() {
        let (store, tenant) = stored_chain(4).await;
        let cancel = CancelFlag::new();
        cancel.cancel();

        let record = ChainVerifier::new(store, 2)
            .verify_range(&tenant, 0, 3, &cancel)
            .await
            .unwrap();
        assert_eq!(record.status, VerificationStatus::Incomplete);
        assert_eq!(record.events_checked, 0);
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected() {
        let (store, tenant) = stored_chain(2).await;
        let err = ChainVerifier::new(store, 10)
            .verify_range(&tenant, 2, 1, &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::InvalidRange { start: 2, end: 1 }));
    }

    #[tokio::test]
    async fn test_every_anchor_checked_when_rows_overlap() {
        let (store, tenant) = stored_chain(10).await;
        let anchorer = anchorer(&store, Some(5));
        while anchorer.anchor(&tenant).await.unwrap().anchor().is_some() {}

        let forged = Anchor::new(tenant.clone(), 2, 3, ChainHash::from_bytes([0xff; 32]));
        store.force_anchor(forged.clone()).await;
        store
            .tamper_with_anchor(&tenant, 1, |a| a.root_hash = a.root_hash.with_flipped_bit(7))
            .await;

        let verifier = ChainVerifier::new(store.clone(), 3);
        let record = verifier
            .verify_range(&tenant, 0, 9, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(record.status, VerificationStatus::RootMismatch);
        assert_eq!(record.anchors_checked, 3);
        let discrepancy = record.discrepancy.unwrap();
        assert_eq!(discrepancy.kind, DiscrepancyKind::AnchorOverlap);
        assert_eq!(discrepancy.sequence_number, 2);
        assert_eq!(discrepancy.anchor_id, Some(forged.anchor_id));

        // The rewritten [5, 9] root is found on its own
        let tail = verifier
            .verify_range(&tenant, 5, 9, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(tail.status, VerificationStatus::RootMismatch);
        assert_eq!(tail.discrepancy.unwrap().kind, DiscrepancyKind::RootMismatch);
    }

    #[tokio::test]
    async fn test_missing_anchor_row_is_anchor_gap() {
        let (store, tenant) = stored_chain(6).await;
        let leaves: Vec<ChainHash> = store
            .read_range(&tenant, 0, 5)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_hash)
            .collect();
        store
            .force_anchor(Anchor::new(tenant.clone(), 0, 1, get_merkle_root(&leaves[0..2])))
            .await;
        store
            .force_anchor(Anchor::new(tenant.clone(), 4, 5, get_merkle_root(&leaves[4..6])))
            .await;

        let record = ChainVerifier::new(store, 4)
            .verify_range(&tenant, 0, 5, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(record.status, VerificationStatus::RootMismatch);
        assert_eq!(record.anchors_checked, 2);
        let discrepancy = record.discrepancy.unwrap();
        assert_eq!(discrepancy.kind, DiscrepancyKind::AnchorGap);
        assert_eq!(discrepancy.expected, "2");
        assert_eq!(discrepancy.actual, "4");
    }

    #[test]
    fn test_discrepancy_kind_strings() {
        for kind in [
            DiscrepancyKind::MalformedRow,
            DiscrepancyKind::AnchorOverlap,
            DiscrepancyKind::AnchorGap,
            DiscrepancyKind::LeafCountMismatch,
        ] {
            assert_eq!(kind.as_str().parse::<DiscrepancyKind>().unwrap(), kind);
        }
    }
}
