#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use audit_chain::audit::{AuditTrail, NewEvent, RecordedEvent, ResourceRef, TenantId};
use audit_chain::config::AppConfig;
use audit_chain::database::Database;
use audit_chain::scheduler::ManualScheduler;

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory()
        .await
        .expect("Failed to create test database")
}

/// Setup a file-backed SQLite database under `dir`
pub async fn setup_file_db(dir: &Path) -> Database {
    let url = format!("sqlite://{}", dir.join("audit.db").display());
    let db = Database::new(&url).await.expect("Failed to open database file");
    db.run_migrations().await.expect("Failed to run migrations");
    db
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database_url = "sqlite::memory:".to_string();
    config.verification.batch_size = 4;
    config.append.max_attempts = 100;
    config
}

pub fn trail_over(db: &Database, config: AppConfig) -> AuditTrail {
    AuditTrail::new(Arc::new(db.clone()), Arc::new(ManualScheduler::new()), config)
}

pub fn test_event(i: usize) -> NewEvent {
    NewEvent::new(
        "document.signed",
        format!("user-{}", i % 3),
        ResourceRef::new("document", format!("doc-{}", i)),
    )
}

/// Record `count` events for `tenant` and return their receipts
pub async fn record_events(trail: &AuditTrail, tenant: &TenantId, count: usize) -> Vec<RecordedEvent> {
    let mut receipts = Vec::with_capacity(count);
    for i in 0..count {
        receipts.push(
            trail
                .record_event(tenant, test_event(i))
                .await
                .expect("Failed to record event"),
        );
    }
    receipts
}

/// Remove the append-only triggers, as an operator with file access could
pub async fn drop_append_only_triggers(db: &Database) {
    for trigger in [
        "audit_events_no_update",
        "audit_events_no_delete",
        "audit_anchors_no_update",
        "audit_anchors_no_delete",
    ] {
        sqlx::query(&format!("DROP TRIGGER IF EXISTS {}", trigger))
            .execute(db.pool())
            .await
            .expect("Failed to drop trigger");
    }
}
