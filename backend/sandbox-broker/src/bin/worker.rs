//! Worker process composition root
//!
//! Singleton (N=1) per deployment. Runs the four reconciliation loops with
//! one shared shutdown broadcast; on SIGTERM/ctrl-c each loop finishes its
//! current iteration and exits, and the process exits when all four have
//! returned.

use std::sync::Arc;

use anyhow::Context;
use sandbox_broker::clock::{Clock, SystemClock};
use sandbox_broker::config::Config;
use sandbox_broker::gateway::CspGateway;
use sandbox_broker::store::{DynamoStore, SandboxStore};
use sandbox_broker::worker::{self, WorkerContext};
use sandbox_broker::{csp, init_tracing};
use tokio::sync::broadcast;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()
        .map_err(anyhow::Error::msg)
        .context("Failed to load configuration")?;
    init_tracing(&config.log);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        sync_interval_sec = config.worker.sync_interval_sec,
        cleanup_interval_sec = config.worker.cleanup_interval_sec,
        auto_expiry_interval_sec = config.worker.auto_expiry_interval_sec,
        stale_delete_interval_sec = config.worker.stale_delete_interval_sec,
        "Starting sandbox-broker-worker"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn SandboxStore> = Arc::new(DynamoStore::connect(&config.store).await);
    let csp_client = csp::build_client(&config.csp)
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("Failed to build CSP client")?;
    let gateway = Arc::new(CspGateway::new(csp_client, &config.breaker));

    let ctx = Arc::new(WorkerContext {
        store,
        gateway,
        clock,
        config: Arc::new(config),
    });

    let (shutdown_tx, _) = broadcast::channel(1);

    let run = worker::run_all(ctx, shutdown_tx.clone());
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => {
            tracing::warn!("Worker loops exited without a shutdown signal");
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
            run.await;
        }
    }

    tracing::info!("sandbox-broker-worker shutting down");
    Ok(())
}
