//! Stale-delete loop: purge records whose CSP object disappeared
//!
//! A stale record keeps its `updated_at` from the moment sync noticed the
//! CSP object was gone; after the grace window an operator has had their
//! chance to investigate and the record is dropped. No CSP call is made:
//! the upstream object not existing is exactly why the record is stale.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::clock::Clock as _;
use crate::models::SandboxStatus;
use crate::store::{SandboxStore as _, StoreError};
use crate::worker::{sleep_interruptible, WorkerContext};

const PAGE_SIZE: u32 = 100;

pub async fn run_once(ctx: &WorkerContext, grace_seconds: i64) -> Result<u64, StoreError> {
    let now = ctx.clock.now();
    let cutoff = now - grace_seconds;

    let mut deleted = 0;
    let mut cursor: Option<String> = None;
    loop {
        let page = ctx
            .store
            .query_by_status(SandboxStatus::Stale, PAGE_SIZE, cursor.as_deref())
            .await?;
        for record in &page.items {
            // The status index sorts by allocated_at (0 for never-claimed
            // records), so the grace filter runs here on updated_at
            if record.updated_at < cutoff {
                ctx.store.delete(&record.sandbox_id).await?;
                deleted += 1;
                info!(
                    sandbox_id = %record.sandbox_id,
                    stale_since = record.updated_at,
                    "Stale record purged"
                );
            }
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(deleted)
}

pub async fn run_loop(ctx: Arc<WorkerContext>, mut shutdown: broadcast::Receiver<()>) {
    let period = Duration::from_secs(ctx.config.worker.stale_delete_interval_sec);
    let grace_seconds = ctx.config.worker.stale_grace_hours * 3600;
    info!(
        period_sec = period.as_secs(),
        grace_hours = ctx.config.worker.stale_grace_hours,
        "Stale-delete loop started"
    );

    loop {
        match run_once(&ctx, grace_seconds).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(deleted, "Stale-delete iteration completed");
                }
            }
            Err(e) => {
                error!(error = %e, "Stale-delete iteration failed");
            }
        }

        if !sleep_interruptible(period, &mut shutdown).await {
            info!("Stale-delete loop stopping");
            break;
        }
    }
}
