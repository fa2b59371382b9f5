//! Pool statistics snapshot
//!
//! `/admin/stats` and the `pool_*` gauges both read from one cached
//! snapshot, refreshed from a streaming store scan at most once per TTL.
//! Readers never wait on a refresh: a stale snapshot is served while a
//! single background task recomputes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::metrics;
use crate::models::SandboxStatus;
use crate::store::{SandboxStore, StoreError};

const SCAN_PAGE_SIZE: u32 = 250;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: i64,
    pub available: i64,
    pub allocated: i64,
    pub pending_deletion: i64,
    pub stale: i64,
    pub deletion_failed: i64,
}

impl PoolStats {
    fn count(&mut self, status: SandboxStatus) {
        self.total += 1;
        match status {
            SandboxStatus::Available => self.available += 1,
            SandboxStatus::Allocated => self.allocated += 1,
            SandboxStatus::PendingDeletion => self.pending_deletion += 1,
            SandboxStatus::Stale => self.stale += 1,
            SandboxStatus::DeletionFailed => self.deletion_failed += 1,
        }
    }

    fn publish_gauges(&self) {
        metrics::POOL_AVAILABLE.set(self.available);
        metrics::POOL_ALLOCATED.set(self.allocated);
        metrics::POOL_PENDING_DELETION.set(self.pending_deletion);
        metrics::POOL_STALE.set(self.stale);
        metrics::POOL_DELETION_FAILED.set(self.deletion_failed);
        metrics::POOL_TOTAL.set(self.total);
    }
}

pub struct StatsService {
    store: Arc<dyn SandboxStore>,
    ttl: Duration,
    cached: RwLock<Option<(PoolStats, Instant)>>,
    refreshing: AtomicBool,
}

impl StatsService {
    pub fn new(store: Arc<dyn SandboxStore>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            ttl,
            cached: RwLock::new(None),
            refreshing: AtomicBool::new(false),
        })
    }

    /// Current snapshot. Fresh values are served from cache; a stale value
    /// is returned as-is while one background refresh runs; only the very
    /// first call pays for a scan inline.
    pub async fn snapshot(self: &Arc<Self>) -> Result<PoolStats, StoreError> {
        if let Some((stats, fetched_at)) = *self.cached.read() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(stats);
            }
            if !self.refreshing.swap(true, Ordering::SeqCst) {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    match compute(this.store.as_ref()).await {
                        Ok(fresh) => this.install(fresh),
                        Err(e) => warn!(error = %e, "Pool stats refresh failed"),
                    }
                    this.refreshing.store(false, Ordering::SeqCst);
                });
            }
            return Ok(stats);
        }

        // Cold cache: compute inline so the first caller gets real numbers
        let fresh = compute(self.store.as_ref()).await?;
        self.install(fresh);
        Ok(fresh)
    }

    fn install(&self, stats: PoolStats) {
        stats.publish_gauges();
        *self.cached.write() = Some((stats, Instant::now()));
    }
}

async fn compute(store: &dyn SandboxStore) -> Result<PoolStats, StoreError> {
    let mut stats = PoolStats::default();
    let mut cursor: Option<String> = None;

    loop {
        let page = store.scan(None, SCAN_PAGE_SIZE, cursor.as_deref()).await?;
        for record in &page.items {
            stats.count(record.status);
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SandboxRecord;
    use crate::store::MemoryStore;

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..4 {
            store
                .put(&SandboxRecord::available(
                    format!("s{}", i),
                    "x",
                    "y",
                    0,
                    0,
                    4,
                ))
                .await
                .unwrap();
        }
        store.atomic_claim("s0", "c1", None, 100).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_snapshot_counts_statuses() {
        let store = seeded_store().await;
        let stats = StatsService::new(store, Duration::from_secs(60));

        let snapshot = stats.snapshot().await.unwrap();
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.available, 3);
        assert_eq!(snapshot.allocated, 1);
        assert_eq!(snapshot.pending_deletion, 0);
    }

    #[tokio::test]
    async fn test_snapshot_is_cached_within_ttl() {
        let store = seeded_store().await;
        let stats = StatsService::new(store.clone(), Duration::from_secs(60));

        let first = stats.snapshot().await.unwrap();
        // Mutate the pool; the cached snapshot must not move within the TTL
        store.delete("s1").await.unwrap();
        let second = stats.snapshot().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_stale_snapshot_served_while_refreshing() {
        let store = seeded_store().await;
        let stats = StatsService::new(store.clone(), Duration::from_millis(10));

        let first = stats.snapshot().await.unwrap();
        store.delete("s1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Stale read triggers the background refresh but returns the old value
        let stale = stats.snapshot().await.unwrap();
        assert_eq!(stale, first);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = stats.snapshot().await.unwrap();
        assert_eq!(fresh.total, 3);
    }
}
