//! Daemon command: runs the scheduler loops until Ctrl-C.

use std::sync::Arc;

use miette::Result;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{SchedulerArgs, ServiceArgs, build_scheduler};

/// Run the daemon.
pub async fn run(services: &ServiceArgs, tuning: &SchedulerArgs) -> Result<()> {
    info!(
        store = %services.store_path().display(),
        ledger = %services.ledger_url,
        webhook = services.webhook_url.is_some(),
        "starting Tally daemon"
    );

    let scheduler = Arc::new(build_scheduler(services, tuning).await?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    handle
        .await
        .map_err(|e| miette::miette!("scheduler task failed: {}", e))?;

    info!("Tally daemon stopped");
    Ok(())
}
