//! In-memory pool store
//!
//! Mirrors the DynamoDB adapter's conditional semantics under a single
//! process-local lock. Backs the test suites and local development runs
//! where no DynamoDB endpoint is available. Every conditional mutation is
//! evaluated atomically under the write lock, so the linearizability
//! contract of the trait holds here too.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::{SandboxRecord, SandboxStatus};
use crate::store::{
    ClaimOutcome, DestroyFailure, Page, ReleaseOutcome, SandboxStore, StoreError,
};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, SandboxRecord>>,
}

/// Cursor for paged reads: position of the last item returned
#[derive(Serialize, Deserialize)]
struct Cursor {
    allocated_at: i64,
    sandbox_id: String,
}

impl Cursor {
    fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_string(self).expect("cursor serializes"))
    }

    fn decode(cursor: &str) -> Result<Self, StoreError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|e| StoreError::Internal(format!("invalid cursor: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Internal(format!("invalid cursor: {}", e)))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: snapshot of a single record
    pub fn snapshot(&self, sandbox_id: &str) -> Option<SandboxRecord> {
        self.records.read().get(sandbox_id).cloned()
    }

    /// Test hook: total record count
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn page_of(
        mut matches: Vec<SandboxRecord>,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        matches.sort_by(|a, b| {
            (a.allocated_at, a.sandbox_id.as_str()).cmp(&(b.allocated_at, b.sandbox_id.as_str()))
        });

        let start = match cursor {
            Some(raw) => {
                let cursor = Cursor::decode(raw)?;
                matches
                    .iter()
                    .position(|r| {
                        (r.allocated_at, r.sandbox_id.as_str())
                            > (cursor.allocated_at, cursor.sandbox_id.as_str())
                    })
                    .unwrap_or(matches.len())
            }
            None => 0,
        };

        let items: Vec<SandboxRecord> =
            matches.into_iter().skip(start).take(limit as usize).collect();
        let next_cursor = if items.len() == limit as usize {
            items.last().map(|r| {
                Cursor {
                    allocated_at: r.allocated_at,
                    sandbox_id: r.sandbox_id.clone(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(Page { items, next_cursor })
    }
}

#[async_trait]
impl SandboxStore for MemoryStore {
    async fn get(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>, StoreError> {
        Ok(self.records.read().get(sandbox_id).cloned())
    }

    async fn put(&self, record: &SandboxRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(record.sandbox_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, sandbox_id: &str) -> Result<(), StoreError> {
        self.records.write().remove(sandbox_id);
        Ok(())
    }

    async fn atomic_claim(
        &self,
        sandbox_id: &str,
        consumer_id: &str,
        track_name: Option<&str>,
        now: i64,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut records = self.records.write();
        match records.get_mut(sandbox_id) {
            Some(rec) if rec.status == SandboxStatus::Available => {
                rec.status = SandboxStatus::Allocated;
                rec.allocated_to_sandbox_id = Some(consumer_id.to_string());
                rec.allocated_at = now;
                rec.idempotency_key = Some(consumer_id.to_string());
                if let Some(track) = track_name {
                    rec.track_name = Some(track.to_string());
                }
                rec.updated_at = now;
                Ok(ClaimOutcome::Claimed(rec.clone()))
            }
            _ => Ok(ClaimOutcome::Conflict),
        }
    }

    async fn atomic_release(
        &self,
        sandbox_id: &str,
        consumer_id: &str,
        now: i64,
        max_hold_seconds: i64,
    ) -> Result<ReleaseOutcome, StoreError> {
        let mut records = self.records.write();
        match records.get_mut(sandbox_id) {
            None => Ok(ReleaseOutcome::NotFound),
            Some(rec) => {
                let owned = rec.status == SandboxStatus::Allocated
                    && rec.allocated_to_sandbox_id.as_deref() == Some(consumer_id);
                if !owned {
                    return Ok(ReleaseOutcome::NotOwner);
                }
                if rec.allocated_at <= now - max_hold_seconds {
                    return Ok(ReleaseOutcome::Expired);
                }
                rec.status = SandboxStatus::PendingDeletion;
                rec.deletion_requested_at = Some(now);
                rec.updated_at = now;
                Ok(ReleaseOutcome::Released(rec.clone()))
            }
        }
    }

    async fn expire_allocation(
        &self,
        sandbox_id: &str,
        cutoff: i64,
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write();
        match records.get_mut(sandbox_id) {
            Some(rec)
                if rec.status == SandboxStatus::Allocated && rec.allocated_at < cutoff =>
            {
                rec.status = SandboxStatus::PendingDeletion;
                rec.deletion_requested_at = Some(now);
                rec.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_stale_if_available(
        &self,
        sandbox_id: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write();
        match records.get_mut(sandbox_id) {
            Some(rec) if rec.status == SandboxStatus::Available => {
                rec.status = SandboxStatus::Stale;
                rec.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sync_upsert(&self, record: &SandboxRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write();
        match records.get(&record.sandbox_id) {
            None => {
                records.insert(record.sandbox_id.clone(), record.clone());
                Ok(true)
            }
            Some(existing) if existing.status == SandboxStatus::Available => {
                records.insert(record.sandbox_id.clone(), record.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn record_destroy_failure(
        &self,
        sandbox_id: &str,
        now: i64,
        max_attempts: i64,
    ) -> Result<DestroyFailure, StoreError> {
        let mut records = self.records.write();
        match records.get_mut(sandbox_id) {
            Some(rec) if rec.status == SandboxStatus::PendingDeletion => {
                rec.deletion_retry_count += 1;
                rec.updated_at = now;
                if rec.deletion_retry_count >= max_attempts {
                    rec.status = SandboxStatus::DeletionFailed;
                    Ok(DestroyFailure::MarkedFailed)
                } else {
                    Ok(DestroyFailure::Retried {
                        attempts: rec.deletion_retry_count,
                    })
                }
            }
            _ => Ok(DestroyFailure::Retried { attempts: 0 }),
        }
    }

    async fn query_by_status(
        &self,
        status: SandboxStatus,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        let matches: Vec<SandboxRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        Self::page_of(matches, limit, cursor)
    }

    async fn query_by_status_older_than(
        &self,
        status: SandboxStatus,
        cutoff: i64,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        let matches: Vec<SandboxRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.status == status && r.allocated_at < cutoff)
            .cloned()
            .collect();
        Self::page_of(matches, limit, cursor)
    }

    async fn query_by_owner(
        &self,
        consumer_id: &str,
    ) -> Result<Option<SandboxRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.allocated_to_sandbox_id.as_deref() == Some(consumer_id))
            .min_by_key(|r| (r.allocated_at, r.sandbox_id.clone()))
            .cloned())
    }

    async fn query_by_idem(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<SandboxRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.idempotency_key.as_deref() == Some(idempotency_key))
            .min_by_key(|r| (r.allocated_at, r.sandbox_id.clone()))
            .cloned())
    }

    async fn scan(
        &self,
        status: Option<SandboxStatus>,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        let matches: Vec<SandboxRecord> = self
            .records
            .read()
            .values()
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect();
        Self::page_of(matches, limit, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available(id: &str, name: &str) -> SandboxRecord {
        SandboxRecord::available(id, name, format!("identity/accounts/{}", id), 100, 200, 4)
    }

    #[tokio::test]
    async fn test_claim_only_succeeds_once() {
        let store = MemoryStore::new();
        store.put(&available("s1", "one")).await.unwrap();

        let first = store.atomic_claim("s1", "c1", None, 1000).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));

        let second = store.atomic_claim("s1", "c2", None, 1001).await.unwrap();
        assert!(matches!(second, ClaimOutcome::Conflict));

        let rec = store.snapshot("s1").unwrap();
        assert_eq!(rec.allocated_to_sandbox_id.as_deref(), Some("c1"));
        assert_eq!(rec.idempotency_key.as_deref(), Some("c1"));
        assert_eq!(rec.allocated_at, 1000);
    }

    #[tokio::test]
    async fn test_release_outcomes() {
        let store = MemoryStore::new();
        store.put(&available("s1", "one")).await.unwrap();
        store.atomic_claim("s1", "c1", None, 1000).await.unwrap();

        // Wrong owner
        let not_owner = store.atomic_release("s1", "c2", 1100, 14400).await.unwrap();
        assert!(matches!(not_owner, ReleaseOutcome::NotOwner));

        // Unknown record
        let missing = store.atomic_release("nope", "c1", 1100, 14400).await.unwrap();
        assert!(matches!(missing, ReleaseOutcome::NotFound));

        // Outside the hold window
        let expired = store
            .atomic_release("s1", "c1", 1000 + 14400, 14400)
            .await
            .unwrap();
        assert!(matches!(expired, ReleaseOutcome::Expired));

        // Inside the window
        let released = store.atomic_release("s1", "c1", 1100, 14400).await.unwrap();
        match released {
            ReleaseOutcome::Released(rec) => {
                assert_eq!(rec.status, SandboxStatus::PendingDeletion);
                assert_eq!(rec.deletion_requested_at, Some(1100));
            }
            other => panic!("expected Released, got {:?}", other),
        }

        // Duplicate release: ownership is gone
        let duplicate = store.atomic_release("s1", "c1", 1200, 14400).await.unwrap();
        assert!(matches!(duplicate, ReleaseOutcome::NotOwner));
    }

    #[tokio::test]
    async fn test_sync_upsert_never_touches_active_holds() {
        let store = MemoryStore::new();
        store.put(&available("s1", "one")).await.unwrap();
        store.atomic_claim("s1", "c1", None, 1000).await.unwrap();

        let refreshed = available("s1", "renamed");
        assert!(!store.sync_upsert(&refreshed).await.unwrap());
        assert_eq!(store.snapshot("s1").unwrap().status, SandboxStatus::Allocated);

        // Available records are refreshed
        store.put(&available("s2", "two")).await.unwrap();
        assert!(store.sync_upsert(&available("s2", "two-renamed")).await.unwrap());
        assert_eq!(store.snapshot("s2").unwrap().name, "two-renamed");
    }

    #[tokio::test]
    async fn test_destroy_failure_parks_after_max_attempts() {
        let store = MemoryStore::new();
        let mut rec = available("s1", "one");
        rec.status = SandboxStatus::PendingDeletion;
        store.put(&rec).await.unwrap();

        assert_eq!(
            store.record_destroy_failure("s1", 10, 3).await.unwrap(),
            DestroyFailure::Retried { attempts: 1 }
        );
        assert_eq!(
            store.record_destroy_failure("s1", 20, 3).await.unwrap(),
            DestroyFailure::Retried { attempts: 2 }
        );
        assert_eq!(
            store.record_destroy_failure("s1", 30, 3).await.unwrap(),
            DestroyFailure::MarkedFailed
        );
        assert_eq!(
            store.snapshot("s1").unwrap().status,
            SandboxStatus::DeletionFailed
        );
    }

    #[tokio::test]
    async fn test_query_by_status_pages_in_allocated_at_order() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let mut rec = available(&format!("s{}", i), "x");
            rec.status = SandboxStatus::Allocated;
            rec.allocated_at = 100 - i as i64; // reverse insert order
            store.put(&rec).await.unwrap();
        }

        let first = store
            .query_by_status(SandboxStatus::Allocated, 2, None)
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].allocated_at, 96);
        assert_eq!(first.items[1].allocated_at, 97);
        let cursor = first.next_cursor.expect("more pages");

        let second = store
            .query_by_status(SandboxStatus::Allocated, 2, Some(&cursor))
            .await
            .unwrap();
        assert_eq!(second.items[0].allocated_at, 98);

        let older = store
            .query_by_status_older_than(SandboxStatus::Allocated, 98, 10, None)
            .await
            .unwrap();
        assert_eq!(older.items.len(), 2);
    }

    #[tokio::test]
    async fn test_owner_and_idem_lookups() {
        let store = MemoryStore::new();
        store.put(&available("s1", "one")).await.unwrap();
        store.atomic_claim("s1", "c1", Some("track-a"), 1000).await.unwrap();

        let by_owner = store.query_by_owner("c1").await.unwrap().unwrap();
        assert_eq!(by_owner.sandbox_id, "s1");
        let by_idem = store.query_by_idem("c1").await.unwrap().unwrap();
        assert_eq!(by_idem.sandbox_id, "s1");
        assert!(store.query_by_owner("c2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_filters_by_status() {
        let store = MemoryStore::new();
        store.put(&available("s1", "one")).await.unwrap();
        store.put(&available("s2", "two")).await.unwrap();
        store.atomic_claim("s2", "c1", None, 1000).await.unwrap();

        let all = store.scan(None, 10, None).await.unwrap();
        assert_eq!(all.items.len(), 2);

        let only_available = store
            .scan(Some(SandboxStatus::Available), 10, None)
            .await
            .unwrap();
        assert_eq!(only_available.items.len(), 1);
        assert_eq!(only_available.items[0].sandbox_id, "s1");
    }
}
