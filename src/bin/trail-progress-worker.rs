//! # Trail Progress Worker
//!
//! Drains pending activity/route work until SIGINT or SIGTERM. Exits non-zero
//! when a scheduler stops on a fatal error so the supervisor can restart it.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trail_progress_worker::bootstrap::bootstrap;
use trail_progress_worker::config::ConfigManager;
use trail_progress_worker::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let manager = ConfigManager::load().context("failed to load worker configuration")?;
    info!(environment = %manager.environment(), "Starting trail progress worker");

    let system = bootstrap(manager.into_config())
        .await
        .context("failed to start worker")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    system
        .run(cancel)
        .await
        .context("worker stopped on a fatal error")?;

    info!("Worker shutdown complete");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => warn!(error = %e, "Could not listen for Ctrl+C, shutting down"),
        },
        result = wait_for_sigterm() => match result {
            Ok(()) => info!("Received SIGTERM, shutting down"),
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler, waiting for Ctrl+C only");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, shutting down");
                }
            }
        },
    }
    cancel.cancel();
}

/// Wait for SIGTERM (container deployments)
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
