pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod scheduler;
pub mod store;

pub use audit::{AuditTrail, ChainHash, NewEvent, TenantId};
pub use config::AppConfig;
pub use database::Database;
pub use error::{AuditError, AuditResult};
pub use store::{ChainStore, InMemoryChainStore};
