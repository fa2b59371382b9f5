//! Cleanup loop: destroy CSP objects for records in `pending_deletion`
//!
//! Destroys run in throttled chunks (B per chunk, D seconds between chunks)
//! so the upstream sees at most ~B/D requests per second. A 404 from the
//! CSP means the object is already gone and counts as success. Destroy
//! failures bump the retry counter; at the cap the record parks in
//! `deletion_failed` for an operator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::clock::Clock as _;
use crate::gateway::GatewayError;
use crate::metrics;
use crate::models::SandboxStatus;
use crate::store::{DestroyFailure, SandboxStore as _, StoreError};
use crate::worker::{sleep_interruptible, WorkerContext};

/// One iteration drains up to this many chunks' worth of records
const QUERY_CHUNKS: usize = 10;

#[derive(Debug, serde::Serialize)]
pub struct CleanupOutcome {
    pub deleted: u64,
    pub failed: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Upstream(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub async fn run_once(ctx: &WorkerContext) -> Result<CleanupOutcome, CleanupError> {
    let started = Instant::now();
    let batch_size = ctx.config.worker.cleanup_batch_size.max(1);
    let batch_delay = Duration::from_secs(ctx.config.worker.cleanup_batch_delay_sec);
    let max_attempts = ctx.config.lifecycle.deletion_retry_max_attempts;

    let page = ctx
        .store
        .query_by_status(
            SandboxStatus::PendingDeletion,
            (batch_size * QUERY_CHUNKS) as u32,
            None,
        )
        .await?;

    let mut deleted = 0;
    let mut failed = 0;

    for (index, chunk) in page.items.chunks(batch_size).enumerate() {
        if index > 0 {
            tokio::time::sleep(batch_delay).await;
        }

        for record in chunk {
            match ctx.gateway.destroy(&record.external_id).await {
                Ok(outcome) => {
                    debug!(
                        sandbox_id = %record.sandbox_id,
                        external_id = %record.external_id,
                        ?outcome,
                        "Sandbox destroyed upstream"
                    );
                    ctx.store.delete(&record.sandbox_id).await?;
                    deleted += 1;
                    metrics::CLEANUP_DELETED_TOTAL.inc();
                }
                Err(GatewayError::UpstreamUnavailable { retry_after_secs }) => {
                    // Breaker is open; stop hammering and let the next
                    // iteration resume
                    warn!(retry_after_secs, "Cleanup paused, upstream unavailable");
                    return Err(CleanupError::Upstream(GatewayError::UpstreamUnavailable {
                        retry_after_secs,
                    }));
                }
                Err(GatewayError::Failed(message)) => {
                    failed += 1;
                    metrics::CLEANUP_FAILED_TOTAL.inc();
                    let now = ctx.clock.now();
                    match ctx
                        .store
                        .record_destroy_failure(&record.sandbox_id, now, max_attempts)
                        .await?
                    {
                        DestroyFailure::MarkedFailed => {
                            warn!(
                                sandbox_id = %record.sandbox_id,
                                error = %message,
                                "Destroy retries exhausted, parked in deletion_failed"
                            );
                        }
                        DestroyFailure::Retried { attempts } => {
                            warn!(
                                sandbox_id = %record.sandbox_id,
                                attempts,
                                error = %message,
                                "Destroy failed, will retry"
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(CleanupOutcome {
        deleted,
        failed,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

pub async fn run_loop(ctx: Arc<WorkerContext>, mut shutdown: broadcast::Receiver<()>) {
    let period = Duration::from_secs(ctx.config.worker.cleanup_interval_sec);
    info!(period_sec = period.as_secs(), "Cleanup loop started");

    loop {
        match run_once(&ctx).await {
            Ok(outcome) => {
                metrics::CLEANUP_TOTAL.with_label_values(&["success"]).inc();
                if outcome.deleted > 0 || outcome.failed > 0 {
                    info!(
                        deleted = outcome.deleted,
                        failed = outcome.failed,
                        duration_ms = outcome.duration_ms,
                        "Cleanup iteration completed"
                    );
                }
            }
            Err(e) => {
                metrics::CLEANUP_TOTAL.with_label_values(&["error"]).inc();
                error!(error = %e, "Cleanup iteration failed");
            }
        }

        if !sleep_interruptible(period, &mut shutdown).await {
            info!("Cleanup loop stopping");
            break;
        }
    }
}
