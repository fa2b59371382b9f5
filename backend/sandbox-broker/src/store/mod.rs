//! Persistence contract for the sandbox pool
//!
//! The store is the only source of truth for pool records; exclusivity is
//! enforced entirely by conditional writes, so no caller may read-modify-write
//! around this interface. Condition failures are first-class outcomes, not
//! errors; only transport-level trouble surfaces as `StoreError`.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{SandboxRecord, SandboxStatus};

pub mod dynamo;
pub mod memory;

pub use dynamo::DynamoStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Throttling or connectivity trouble; callers retry with backoff
    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Result of a conditional claim
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(SandboxRecord),
    /// The record was not `available` at write time
    Conflict,
}

/// Result of a conditional release; the three failure reasons map to
/// distinct HTTP responses
#[derive(Debug)]
pub enum ReleaseOutcome {
    Released(SandboxRecord),
    NotFound,
    NotOwner,
    Expired,
}

/// Result of recording a failed CSP destroy
#[derive(Debug, PartialEq, Eq)]
pub enum DestroyFailure {
    /// Retry budget remains
    Retried { attempts: i64 },
    /// Budget exhausted; the record is parked in `deletion_failed`
    MarkedFailed,
}

/// One page of an indexed query or scan
#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<SandboxRecord>,
    pub next_cursor: Option<String>,
}

/// Durable, concurrency-safe record storage with conditional mutation.
///
/// `atomic_claim` and `atomic_release` are linearizable per `sandbox_id`:
/// concurrent callers see a total order with exactly one winner.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    async fn get(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>, StoreError>;

    /// Unconditional upsert; sync only
    async fn put(&self, record: &SandboxRecord) -> Result<(), StoreError>;

    async fn delete(&self, sandbox_id: &str) -> Result<(), StoreError>;

    /// Allocate iff the record is currently `available`
    async fn atomic_claim(
        &self,
        sandbox_id: &str,
        consumer_id: &str,
        track_name: Option<&str>,
        now: i64,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Transition to `pending_deletion` iff still allocated to `consumer_id`
    /// and inside the hold window
    async fn atomic_release(
        &self,
        sandbox_id: &str,
        consumer_id: &str,
        now: i64,
        max_hold_seconds: i64,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Auto-expiry transition: `allocated` with `allocated_at < cutoff`
    /// becomes `pending_deletion`. Returns whether the write happened.
    async fn expire_allocation(
        &self,
        sandbox_id: &str,
        cutoff: i64,
        now: i64,
    ) -> Result<bool, StoreError>;

    /// Sync transition for records missing from the CSP; only `available`
    /// records go stale. Returns whether the write happened.
    async fn mark_stale_if_available(&self, sandbox_id: &str, now: i64)
        -> Result<bool, StoreError>;

    /// Sync upsert: writes iff the record is absent or still `available`,
    /// never touching active holds. Returns whether the write happened.
    async fn sync_upsert(&self, record: &SandboxRecord) -> Result<bool, StoreError>;

    /// Bump `deletion_retry_count`; at `max_attempts` the record parks in
    /// `deletion_failed` for manual intervention
    async fn record_destroy_failure(
        &self,
        sandbox_id: &str,
        now: i64,
        max_attempts: i64,
    ) -> Result<DestroyFailure, StoreError>;

    /// Status index, ordered by `allocated_at` ascending
    async fn query_by_status(
        &self,
        status: SandboxStatus,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError>;

    /// Status index restricted to `allocated_at < cutoff`
    async fn query_by_status_older_than(
        &self,
        status: SandboxStatus,
        cutoff: i64,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError>;

    /// Owner index: what does this consumer hold
    async fn query_by_owner(&self, consumer_id: &str)
        -> Result<Option<SandboxRecord>, StoreError>;

    /// Idempotency index: re-claim lookup
    async fn query_by_idem(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<SandboxRecord>, StoreError>;

    /// Paged scan for admin stats and bulk-delete; streams, never
    /// materializes the full pool
    async fn scan(
        &self,
        status: Option<SandboxStatus>,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError>;
}
