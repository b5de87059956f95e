//! Audit Chain CLI
//!
//! Operator and auditor tool: chain status, range verification, anchoring,
//! and export / offline check of inclusion proofs.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use audit_chain::audit::{AnchorOutcome, AuditTrail, InclusionProof, TenantId, VerificationStatus};
use audit_chain::config::AppConfig;
use audit_chain::database::Database;
use audit_chain::scheduler::ManualScheduler;

#[derive(Parser)]
#[command(name = "verify-audit-log")]
#[command(about = "Verify audit chain integrity and inclusion proofs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL (overrides configuration)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show chain head and anchoring state for a tenant
    Status {
        #[arg(short, long)]
        tenant: String,
    },

    /// Verify a sequence range and record the result
    Verify {
        #[arg(short, long)]
        tenant: String,

        #[arg(long, default_value_t = 0)]
        start: u64,

        /// Defaults to the current head
        #[arg(long)]
        end: Option<u64>,
    },

    /// Produce an inclusion proof for one event
    Proof {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long)]
        sequence: u64,

        /// Write the proof as JSON instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check an exported proof without any database access
    CheckProof {
        #[arg(short, long)]
        file: PathBuf,

        /// Root the proof must resolve to, from a trusted source
        #[arg(long)]
        expected_root: Option<String>,
    },

    /// Anchor one tenant, or every tenant when none is given
    Anchor {
        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// Print the effective configuration
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }

    match cli.command {
        Commands::CheckProof { file, expected_root } => check_proof(&file, expected_root.as_deref()),
        Commands::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Status { tenant } => {
            let trail = open_trail(config).await?;
            let status = trail.chain_status(&TenantId::new(tenant)).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Verify { tenant, start, end } => {
            let trail = open_trail(config).await?;
            verify(&trail, TenantId::new(tenant), start, end).await
        }
        Commands::Proof { tenant, sequence, output } => {
            let trail = open_trail(config).await?;
            let proof = trail.inclusion_proof(&TenantId::new(tenant), sequence).await?;
            let json = serde_json::to_string_pretty(&proof)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write proof to {}", path.display()))?;
                    println!("Proof written to {}", path.display());
                }
                None => println!("{}", json),
            }
            Ok(())
        }
        Commands::Anchor { tenant } => {
            let trail = open_trail(config).await?;
            match tenant {
                Some(tenant) => match trail.anchor(&TenantId::new(tenant)).await? {
                    AnchorOutcome::Anchored(anchor) => println!("Anchored {}", anchor.summary()),
                    AnchorOutcome::NoOp => println!("Nothing to anchor"),
                },
                None => {
                    let anchors = trail.anchor_all().await?;
                    for anchor in &anchors {
                        println!("Anchored {}", anchor.summary());
                    }
                    println!("{} anchor(s) created", anchors.len());
                }
            }
            Ok(())
        }
    }
}

async fn open_trail(config: AppConfig) -> Result<AuditTrail> {
    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;
    Ok(AuditTrail::new(
        Arc::new(database),
        Arc::new(ManualScheduler::new()),
        config,
    ))
}

async fn verify(trail: &AuditTrail, tenant: TenantId, start: u64, end: Option<u64>) -> Result<()> {
    let end = match end {
        Some(end) => end,
        None => trail
            .chain_status(&tenant)
            .await?
            .last_sequence
            .ok_or_else(|| anyhow!("Tenant {} has no events", tenant))?,
    };

    let record = trail.verify_range(&tenant, start, end).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    match record.status {
        VerificationStatus::Valid => {
            info!("Range [{}, {}] verified", start, end);
            Ok(())
        }
        VerificationStatus::Incomplete => {
            Err(anyhow!("Verification incomplete for [{}, {}]", start, end))
        }
        VerificationStatus::ChainBroken | VerificationStatus::RootMismatch => {
            error!("Integrity failure detected");
            record.into_result()?;
            Ok(())
        }
    }
}

fn check_proof(path: &Path, expected_root: Option<&str>) -> Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read proof file {}", path.display()))?;
    let proof: InclusionProof = serde_json::from_str(&json).context("Failed to parse proof")?;

    if let Some(expected) = expected_root {
        if proof.root_hash.to_hex() != expected.to_lowercase() {
            return Err(anyhow!(
                "Proof root {} does not match expected root {}",
                proof.root_hash,
                expected
            ));
        }
    }

    if !proof.verify() {
        return Err(anyhow!(
            "Proof for {}#{} does not resolve to root {}",
            proof.tenant_id,
            proof.sequence_number,
            proof.root_hash
        ));
    }

    println!(
        "Event {}#{} ({}) is included under root {}",
        proof.tenant_id, proof.sequence_number, proof.leaf_hash, proof.root_hash
    );
    Ok(())
}
