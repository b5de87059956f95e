use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::audit::anchor::AnchorPolicy;
use crate::error::{AuditError, AuditResult};

const ENV_PREFIX: &str = "AUDIT_CHAIN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub append: AppendConfig,
    pub anchoring: AnchoringConfig,
    pub verification: VerificationConfig,
    pub proofs: ProofConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppendConfig {
    /// Attempts per `record_event` before a conflict is surfaced
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchoringConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_leaves_per_anchor: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub batch_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofConfig {
    pub tree_cache_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit-chain.db".to_string(),
            append: AppendConfig::default(),
            anchoring: AnchoringConfig::default(),
            verification: VerificationConfig::default(),
            proofs: ProofConfig::default(),
        }
    }
}

impl Default for AppendConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl Default for AnchoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            max_leaves_per_anchor: None,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            tree_cache_capacity: 64,
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional TOML file, then `AUDIT_CHAIN__*` variables
    /// (e.g. `AUDIT_CHAIN__ANCHORING__INTERVAL_SECS=60`).
    pub fn load(path: Option<&Path>) -> AuditResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let config: AppConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> AuditResult<Self> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AuditResult<()> {
        if self.database_url.trim().is_empty() {
            return Err(invalid("database_url must not be empty"));
        }
        if self.append.max_attempts == 0 {
            return Err(invalid("append.max_attempts must be at least 1"));
        }
        if self.anchoring.interval_secs == 0 {
            return Err(invalid("anchoring.interval_secs must be at least 1"));
        }
        if self.anchoring.max_leaves_per_anchor == Some(0) {
            return Err(invalid("anchoring.max_leaves_per_anchor must be at least 1"));
        }
        if self.verification.batch_size == 0 {
            return Err(invalid("verification.batch_size must be at least 1"));
        }
        Ok(())
    }

    pub fn anchoring_interval(&self) -> Duration {
        Duration::from_secs(self.anchoring.interval_secs)
    }

    pub fn anchor_policy(&self) -> AnchorPolicy {
        AnchorPolicy {
            max_leaves_per_anchor: self.anchoring.max_leaves_per_anchor,
        }
    }

    pub fn to_toml(&self) -> AuditResult<String> {
        toml::to_string_pretty(self).map_err(|e| AuditError::Serialization(e.to_string()))
    }
}

fn invalid(message: &str) -> AuditError {
    AuditError::ConfigError(message.to_string())
}
