//! Auto-expiry loop: reclaim holds whose consumer never called release
//!
//! The only path by which an unreleased allocation becomes reclaimable.
//! Cutoff is the hold window plus the grace period; the transition is
//! conditional (still allocated, still overdue) so a racing release wins
//! cleanly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::clock::Clock as _;
use crate::metrics;
use crate::models::SandboxStatus;
use crate::store::{SandboxStore as _, StoreError};
use crate::worker::{sleep_interruptible, WorkerContext};

const PAGE_SIZE: u32 = 100;

pub async fn run_once(ctx: &WorkerContext) -> Result<u64, StoreError> {
    let now = ctx.clock.now();
    let cutoff = now - ctx.config.expiry_window_seconds();

    let mut marked = 0;
    let mut cursor: Option<String> = None;
    loop {
        let page = ctx
            .store
            .query_by_status_older_than(SandboxStatus::Allocated, cutoff, PAGE_SIZE, cursor.as_deref())
            .await?;
        for record in &page.items {
            if ctx
                .store
                .expire_allocation(&record.sandbox_id, cutoff, now)
                .await?
            {
                marked += 1;
                metrics::EXPIRY_MARKED_TOTAL.inc();
                info!(
                    sandbox_id = %record.sandbox_id,
                    consumer = record.allocated_to_sandbox_id.as_deref().unwrap_or(""),
                    allocated_at = record.allocated_at,
                    "Overdue allocation reclaimed"
                );
            }
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(marked)
}

pub async fn run_loop(ctx: Arc<WorkerContext>, mut shutdown: broadcast::Receiver<()>) {
    let period = Duration::from_secs(ctx.config.worker.auto_expiry_interval_sec);
    info!(period_sec = period.as_secs(), "Auto-expiry loop started");

    loop {
        match run_once(&ctx).await {
            Ok(marked) => {
                metrics::EXPIRY_TOTAL.with_label_values(&["success"]).inc();
                if marked > 0 {
                    info!(marked, "Auto-expiry iteration completed");
                }
            }
            Err(e) => {
                metrics::EXPIRY_TOTAL.with_label_values(&["error"]).inc();
                error!(error = %e, "Auto-expiry iteration failed");
            }
        }

        if !sleep_interruptible(period, &mut shutdown).await {
            info!("Auto-expiry loop stopping");
            break;
        }
    }
}
