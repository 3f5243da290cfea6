//! Deployment worker command (`marketplace worker`).

use std::sync::Arc;

use anyhow::{Context, Result};
use marketplace::config::MarketConfig;
use marketplace::deploy::{DeployExecutor, DeployWorker, SshShell, server};
use marketplace::market::DbHandle;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use super::open_db;

/// Cancel the returned token on SIGTERM or SIGINT.
fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
        }
        cancel.cancel();
    });
    Ok(token)
}

pub async fn cmd_worker(config: &MarketConfig, once: bool) -> Result<()> {
    let db = DbHandle::new(open_db(config)?);
    let shell = Arc::new(SshShell::new(
        &config.worker.ssh_binary,
        config.worker.ssh_connect_timeout_secs,
    ));
    let executor = DeployExecutor::new(shell, config.worker.command_timeout);
    let worker = DeployWorker::new(db.clone(), executor, config.worker.poll_interval);

    if once {
        worker.recover_interrupted().await?;
        if worker.run_once().await? {
            println!("Processed one job.");
        } else {
            println!("No queued jobs.");
        }
        return Ok(());
    }

    let shutdown = install_shutdown_handler()?;
    let status_server = config.status_addr().map(|addr| {
        let db = db.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server::serve(addr, db, shutdown).await })
    });

    let result = worker.run(shutdown.clone()).await;
    shutdown.cancel();
    if let Some(handle) = status_server {
        handle.await.context("Status server task panicked")??;
    }
    result?;
    Ok(())
}
