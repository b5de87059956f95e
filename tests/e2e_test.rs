//! End-to-End Audit Chain Tests
//!
//! Record, anchor, prove and verify against the SQLite backend, including
//! proofs exported to disk and databases reopened from file.

mod common;

use audit_chain::audit::{
    get_merkle_root, verify_proof, AnchorOutcome, InclusionProof, Side, TenantId,
    VerificationStatus,
};
use audit_chain::error::AuditError;
use audit_chain::store::ChainStore;
use common::*;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_five_event_anchor_and_proof() -> Result<(), Box<dyn std::error::Error>> {
    println!("🧪 Testing five-event anchor and inclusion proof...");

    let db = setup_test_db().await;
    let trail = trail_over(&db, test_config());
    let tenant = TenantId::new("acme");

    let receipts = record_events(&trail, &tenant, 5).await;
    assert_eq!(
        receipts.iter().map(|r| r.sequence_number).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );

    let anchor = match trail.anchor(&tenant).await? {
        AnchorOutcome::Anchored(anchor) => anchor,
        AnchorOutcome::NoOp => panic!("expected an anchor"),
    };
    assert_eq!(anchor.range(), (0, 4));
    assert_eq!(anchor.leaf_count, 5);
    let leaves: Vec<_> = receipts.iter().map(|r| r.event_hash).collect();
    assert_eq!(anchor.root_hash, get_merkle_root(&leaves));
    println!("✅ Anchored [0, 4] with root {}", anchor.root_hash);

    let proof = trail.inclusion_proof(&tenant, 2).await?;
    assert_eq!(proof.leaf_hash, receipts[2].event_hash);
    assert_eq!(proof.path.len(), 3);
    assert_eq!(
        proof.path.iter().map(|s| s.side).collect::<Vec<_>>(),
        vec![Side::Right, Side::Left, Side::Right]
    );
    assert!(verify_proof(&proof.leaf_hash, &proof.path, &anchor.root_hash));
    assert!(!verify_proof(
        &proof.leaf_hash.with_flipped_bit(0),
        &proof.path,
        &anchor.root_hash
    ));
    println!("✅ Proof for sequence 2 verifies; flipped leaf fails");

    let record = trail.verify_range(&tenant, 0, 4).await?;
    assert_eq!(record.status, VerificationStatus::Valid);
    assert_eq!(record.events_checked, 5);
    assert_eq!(record.anchors_checked, 1);
    println!("✅ Range [0, 4] verified");

    Ok(())
}

#[tokio::test]
async fn test_empty_and_growing_chains_verify() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await;
    let trail = trail_over(&db, test_config());
    let tenant = TenantId::new("growing");

    for count in 1..=9 {
        record_events(&trail, &tenant, 1).await;
        let record = trail.verify_range(&tenant, 0, count - 1).await?;
        assert_eq!(record.status, VerificationStatus::Valid, "chain of {}", count);
        assert_eq!(record.events_checked, count);
    }

    let nothing = trail.verify_range(&TenantId::new("empty"), 0, 0).await?;
    assert_eq!(nothing.status, VerificationStatus::Incomplete);

    Ok(())
}

#[tokio::test]
async fn test_unanchored_event_has_no_proof() {
    let db = setup_test_db().await;
    let trail = trail_over(&db, test_config());
    let tenant = TenantId::new("acme");

    record_events(&trail, &tenant, 3).await;
    assert_ok!(trail.anchor(&tenant).await);
    record_events(&trail, &tenant, 2).await;

    assert_ok!(trail.inclusion_proof(&tenant, 2).await);
    match trail.inclusion_proof(&tenant, 4).await {
        Err(AuditError::NotAnchored { sequence_number, .. }) => assert_eq!(sequence_number, 4),
        other => panic!("expected NotAnchored, got {:?}", other),
    }

    let status = trail.chain_status(&tenant).await.unwrap();
    assert_eq!(status.last_sequence, Some(4));
    assert_eq!(status.last_anchor_range, Some((0, 2)));
    assert_eq!(status.unanchored_count, 2);
}

#[tokio::test]
async fn test_tenants_anchor_independently() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await;
    let trail = trail_over(&db, test_config());
    let a = TenantId::new("tenant-a");
    let b = TenantId::new("tenant-b");

    record_events(&trail, &a, 3).await;
    record_events(&trail, &b, 6).await;

    let anchors = trail.anchor_all().await?;
    assert_eq!(anchors.len(), 2);
    assert_eq!(db.last_anchor(&a).await?.map(|x| x.range()), Some((0, 2)));
    assert_eq!(db.last_anchor(&b).await?.map(|x| x.range()), Some((0, 5)));

    // Sequence numbers are per tenant
    assert_eq!(trail.event(&a, 0).await?.map(|e| e.tenant_id), Some(a.clone()));
    assert!(trail.event(&a, 5).await?.is_none());

    assert!(trail.anchor_all().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_exported_proof_checks_offline() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let db = setup_test_db().await;
    let trail = trail_over(&db, test_config());
    let tenant = TenantId::new("acme");

    record_events(&trail, &tenant, 7).await;
    trail.anchor(&tenant).await?;

    let proof = trail.inclusion_proof(&tenant, 6).await?;
    let path = dir.path().join("proof.json");
    std::fs::write(&path, serde_json::to_string_pretty(&proof)?)?;

    let loaded: InclusionProof = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(loaded, proof);
    assert!(loaded.verify());

    let mut forged = loaded.clone();
    forged.root_hash = forged.root_hash.with_flipped_bit(100);
    assert!(!forged.verify());

    Ok(())
}

#[tokio::test]
async fn test_file_database_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let tenant = TenantId::new("durable");

    let root = {
        let db = setup_file_db(dir.path()).await;
        let trail = trail_over(&db, test_config());
        record_events(&trail, &tenant, 10).await;
        let anchor = trail.anchor(&tenant).await?;
        let root = anchor.anchor().map(|a| a.root_hash);
        db.close().await;
        root
    };

    let db = setup_file_db(dir.path()).await;
    let trail = trail_over(&db, test_config());

    let receipt = trail.record_event(&tenant, test_event(10)).await?;
    assert_eq!(receipt.sequence_number, 10);

    let record = trail.verify_range(&tenant, 0, 10).await?;
    assert_eq!(record.status, VerificationStatus::Valid);
    assert_eq!(db.last_anchor(&tenant).await?.map(|a| a.root_hash), root);
    assert_eq!(trail.verifications(&tenant).await?, vec![record]);

    Ok(())
}
