//! Operator-facing pool operations
//!
//! Listing pages straight off the store indexes; bulk-delete streams the
//! matching records and removes them without touching the CSP (it exists to
//! clear `deletion_failed` wreckage and test pools, not to destroy live
//! sandboxes).

use std::sync::Arc;

use tracing::info;

use crate::models::SandboxStatus;
use crate::store::{Page, SandboxStore, StoreError};

const BULK_PAGE_SIZE: u32 = 100;

pub struct AdminService {
    store: Arc<dyn SandboxStore>,
}

impl AdminService {
    pub fn new(store: Arc<dyn SandboxStore>) -> Self {
        Self { store }
    }

    /// One page of records, filtered by status when given
    pub async fn list(
        &self,
        status: Option<SandboxStatus>,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        match status {
            Some(status) => self.store.query_by_status(status, limit, cursor).await,
            None => self.store.scan(None, limit, cursor).await,
        }
    }

    /// Delete every record in `status`, streaming page by page. Each round
    /// re-queries from the front; deletions guarantee progress.
    pub async fn bulk_delete(&self, status: SandboxStatus) -> Result<u64, StoreError> {
        let mut deleted: u64 = 0;

        loop {
            let page = self
                .store
                .query_by_status(status, BULK_PAGE_SIZE, None)
                .await?;
            if page.items.is_empty() {
                break;
            }
            for record in &page.items {
                self.store.delete(&record.sandbox_id).await?;
                deleted += 1;
            }
            if page.next_cursor.is_none() {
                break;
            }
        }

        info!(status = %status, deleted, "Bulk delete completed");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SandboxRecord;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_bulk_delete_removes_only_matching_status() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            let mut rec = SandboxRecord::available(format!("s{}", i), "x", "y", 0, 0, 4);
            if i < 3 {
                rec.status = SandboxStatus::DeletionFailed;
            }
            store.put(&rec).await.unwrap();
        }

        let admin = AdminService::new(store.clone());
        let deleted = admin.bulk_delete(SandboxStatus::DeletionFailed).await.unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_list_with_and_without_filter() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            store
                .put(&SandboxRecord::available(format!("s{}", i), "x", "y", 0, 0, 4))
                .await
                .unwrap();
        }
        store.atomic_claim("s0", "c1", None, 50).await.unwrap();

        let admin = AdminService::new(store);
        let all = admin.list(None, 10, None).await.unwrap();
        assert_eq!(all.items.len(), 3);

        let available = admin
            .list(Some(SandboxStatus::Available), 10, None)
            .await
            .unwrap();
        assert_eq!(available.items.len(), 2);
    }
}
