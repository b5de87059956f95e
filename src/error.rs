use thiserror::Error;

use crate::audit::verify::Discrepancy;

/// SQLite primary result codes that signal a concurrent writer got there
/// first. Extended codes carry the primary code in the low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let contended = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map_or(false, |code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED));
            if db_err.is_unique_violation() || contended {
                return Self::Conflict {
                    tenant_id: String::new(),
                    sequence_number: None,
                };
            }
        }
        Self::Storage(format!("Database error: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for AuditError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Storage(format!("Migration error: {}", err))
    }
}

impl From<config::ConfigError> for AuditError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    /// Another writer advanced the chain first; retry with fresh chain state.
    #[error("Concurrent write conflict for tenant '{tenant_id}' at sequence {sequence_number:?}")]
    Conflict {
        tenant_id: String,
        sequence_number: Option<u64>,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Event {sequence_number} of tenant '{tenant_id}' is not covered by any anchor yet")]
    NotAnchored {
        tenant_id: String,
        sequence_number: u64,
    },

    #[error("Hash chain broken: {0}")]
    ChainBroken(Discrepancy),

    #[error("Merkle root mismatch: {0}")]
    RootMismatch(Discrepancy),

    /// A stored row no longer decodes; the location is the row's sequence
    /// number (an anchor's `start_seq` for anchor rows).
    #[error("Malformed stored row for tenant '{tenant_id}' at sequence {sequence_number}: {reason}")]
    MalformedRow {
        tenant_id: String,
        sequence_number: u64,
        reason: String,
    },

    #[error("Invalid sequence range: start={start}, end={end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("Unsupported hash format tag: {0}")]
    UnsupportedHashFormat(u8),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type AuditResult<T> = Result<T, AuditError>;

impl AuditError {
    pub fn conflict(tenant_id: impl Into<String>, sequence_number: u64) -> Self {
        Self::Conflict {
            tenant_id: tenant_id.into(),
            sequence_number: Some(sequence_number),
        }
    }

    /// Fill in the tenant/sequence of a conflict raised deep in a storage backend.
    pub fn with_conflict_context(self, tenant_id: &str, sequence_number: u64) -> Self {
        match self {
            Self::Conflict { .. } => Self::conflict(tenant_id, sequence_number),
            other => other,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Integrity failures are compliance signals, not operational faults.
    pub fn is_tamper_signal(&self) -> bool {
        matches!(
            self,
            Self::ChainBroken(_) | Self::RootMismatch(_) | Self::MalformedRow { .. }
        )
    }
}
