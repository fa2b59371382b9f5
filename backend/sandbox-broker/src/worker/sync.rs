//! Sync loop: reconcile the pool with the upstream CSP
//!
//! Fetched accounts are upserted only while the local record is absent or
//! still `available`; active holds, pending deletions and parked failures
//! are never overwritten. Available records missing from the fetch go
//! `stale` and wait for the stale-delete grace window. A deleted CSP record
//! is never resurrected into `available`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::clock::Clock as _;
use crate::gateway::GatewayError;
use crate::metrics;
use crate::models::{SandboxRecord, SandboxStatus};
use crate::store::{SandboxStore as _, StoreError};
use crate::worker::{sleep_interruptible, WorkerContext};

const PAGE_SIZE: u32 = 250;

#[derive(Debug, serde::Serialize)]
pub struct SyncOutcome {
    pub synced: u64,
    pub marked_stale: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Upstream(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub async fn run_once(ctx: &WorkerContext) -> Result<SyncOutcome, SyncError> {
    let started = Instant::now();
    let now = ctx.clock.now();

    let fetched = ctx.gateway.list_active_sandboxes().await?;
    let fetched_ids: HashSet<&str> = fetched.iter().map(|a| a.sandbox_id.as_str()).collect();

    let mut synced = 0;
    for account in &fetched {
        let record = SandboxRecord::available(
            account.sandbox_id.clone(),
            account.name.clone(),
            account.external_id.clone(),
            account.created_at,
            now,
            ctx.config.lifecycle.lab_duration_hours,
        );
        if ctx.store.sync_upsert(&record).await? {
            synced += 1;
            metrics::SYNC_SANDBOXES_SYNCED_TOTAL.inc();
        }
    }

    // Available records the CSP no longer reports go stale
    let mut marked_stale = 0;
    let mut cursor: Option<String> = None;
    loop {
        let page = ctx
            .store
            .query_by_status(SandboxStatus::Available, PAGE_SIZE, cursor.as_deref())
            .await?;
        for record in &page.items {
            if !fetched_ids.contains(record.sandbox_id.as_str())
                && ctx
                    .store
                    .mark_stale_if_available(&record.sandbox_id, now)
                    .await?
            {
                marked_stale += 1;
                metrics::SYNC_SANDBOXES_STALE_TOTAL.inc();
            }
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(SyncOutcome {
        synced,
        marked_stale,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

pub async fn run_loop(ctx: Arc<WorkerContext>, mut shutdown: broadcast::Receiver<()>) {
    let period = Duration::from_secs(ctx.config.worker.sync_interval_sec);
    info!(period_sec = period.as_secs(), "Sync loop started");

    loop {
        match run_once(&ctx).await {
            Ok(outcome) => {
                metrics::SYNC_TOTAL.with_label_values(&["success"]).inc();
                info!(
                    synced = outcome.synced,
                    marked_stale = outcome.marked_stale,
                    duration_ms = outcome.duration_ms,
                    "Sync iteration completed"
                );
            }
            Err(e) => {
                metrics::SYNC_TOTAL.with_label_values(&["error"]).inc();
                error!(error = %e, "Sync iteration failed");
            }
        }

        if !sleep_interruptible(period, &mut shutdown).await {
            info!("Sync loop stopping");
            break;
        }
    }
}
