//! Reconciliation worker
//!
//! Four cooperative loops share one shutdown broadcast: sync (CSP → pool),
//! cleanup (pool → CSP destroy), auto-expiry (reclaim unreleased holds) and
//! stale-delete (purge records whose CSP object vanished). Exactly one
//! worker process runs per deployment; the loops never block each other and
//! a per-record failure never kills an iteration.
//!
//! The iteration bodies (`run_once`) are shared with the `/admin` trigger
//! endpoints, so a manual sync and the timer-driven one are the same code.

pub mod auto_expiry;
pub mod cleanup;
pub mod stale_delete;
pub mod sync;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

use crate::clock::Clock;
use crate::config::Config;
use crate::gateway::CspGateway;
use crate::store::SandboxStore;

pub use cleanup::CleanupOutcome;
pub use sync::SyncOutcome;

/// Dependencies shared by every loop; constructed once in the composition
/// root and passed explicitly
pub struct WorkerContext {
    pub store: Arc<dyn SandboxStore>,
    pub gateway: Arc<CspGateway>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
}

/// Spawn all four loops; resolves when every loop has observed shutdown and
/// returned
pub async fn run_all(ctx: Arc<WorkerContext>, shutdown: broadcast::Sender<()>) {
    let mut tasks = JoinSet::new();

    tasks.spawn(sync::run_loop(ctx.clone(), shutdown.subscribe()));
    tasks.spawn(cleanup::run_loop(ctx.clone(), shutdown.subscribe()));
    tasks.spawn(auto_expiry::run_loop(ctx.clone(), shutdown.subscribe()));
    tasks.spawn(stale_delete::run_loop(ctx.clone(), shutdown.subscribe()));

    while tasks.join_next().await.is_some() {}
    info!("All worker loops stopped");
}

/// Sleep that wakes early on shutdown; returns false when shutting down
pub(crate) async fn sleep_interruptible(
    period: std::time::Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = shutdown.recv() => false,
    }
}
