use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_chain::audit::AuditTrail;
use audit_chain::config::AppConfig;
use audit_chain::database::Database;
use audit_chain::scheduler::TokioScheduler;

#[derive(Parser)]
#[command(name = "audit-chain")]
#[command(about = "Tamper-evident audit chain anchoring daemon")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_chain=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("Starting audit-chain daemon");

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!("Configuration loaded");

    let database = Database::new(&config.database_url)
        .await
        .context("Failed to connect to audit database")?;
    database.run_migrations().await?;
    info!("Database ready");

    let trail = AuditTrail::new(
        Arc::new(database.clone()),
        Arc::new(TokioScheduler),
        config.clone(),
    );

    let schedule = if config.anchoring.enabled {
        let handle = trail.schedule_anchoring()?;
        info!(
            "Merkle anchoring scheduled every {}s",
            config.anchoring.interval_secs
        );
        Some(handle)
    } else {
        warn!("Anchoring disabled; events will stay unanchored until anchored manually");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    if let Some(handle) = schedule {
        handle.cancel();
    }
    database.close().await;
    info!("audit-chain stopped");
    Ok(())
}
