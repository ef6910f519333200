//! dockfleet Fleet Manager
//!
//! Provisions container-backed nodes on demand and reconciles drift between
//! the node registry and the container runtimes.
//!
//! ## Background loops
//!
//! - **Watchdog**: sweeps every cloud for orphan containers and stale nodes
//! - **Client janitor**: closes runtime clients that have been idle too long

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dockfleet_manager::config::{Config, FleetSpec};
use dockfleet_manager::FleetManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_from_env("DOCKFLEET_LOG_LEVEL"))
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dockfleet fleet manager");

    // Load configuration
    let config = Config::from_env()?;
    let spec = FleetSpec::load(&config.fleet_path).context("failed to load fleet definition")?;
    info!(
        instance_id = %config.instance_id,
        fleet_path = %config.fleet_path.display(),
        clouds = spec.clouds.len(),
        dry_run = config.dry_run,
        "Configuration loaded"
    );

    let fleet = FleetManager::from_config(&config, &spec);
    match serde_json::to_string(&fleet.status()) {
        Ok(status) => info!(status = %status, "Fleet ready"),
        Err(e) => error!(error = %e, "Failed to render fleet status"),
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = fleet.spawn_background(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    // Signal shutdown to all loops
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }

    info!("Fleet manager shutdown complete");
    Ok(())
}
