//! Allocation engine
//!
//! Converts a claim request into exactly one durable allocation or a
//! well-defined rejection. Exclusivity comes entirely from the store's
//! conditional writes; this engine only decides which records to try and in
//! what order.
//!
//! The K-candidate shuffle bounds the number of conditional-write attempts
//! per claim and keeps concurrent allocators off the head of the available
//! index. When a `name_prefix` filter is set, only the K fetched candidates
//! are inspected; a matching sandbox deeper in the index still yields
//! `PoolExhausted`.

use std::sync::Arc;

use rand::seq::SliceRandom;
use resilience::{with_retry_if, RetryConfig};
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::metrics;
use crate::models::{SandboxRecord, SandboxStatus};
use crate::store::{ClaimOutcome, ReleaseOutcome, SandboxStore, StoreError};

#[derive(Debug)]
pub enum ClaimSuccess {
    Claimed(SandboxRecord),
    /// The consumer already holds this record; idempotent re-claim
    AlreadyHeld(SandboxRecord),
}

impl ClaimSuccess {
    pub fn record(&self) -> &SandboxRecord {
        match self {
            ClaimSuccess::Claimed(rec) | ClaimSuccess::AlreadyHeld(rec) => rec,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("no available sandbox in the pool")]
    PoolExhausted,

    /// Every candidate lost its conditional write; the caller retries
    #[error("all {0} candidates were claimed concurrently")]
    AllCandidatesConflicted(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("unknown sandbox")]
    NotFound,

    #[error("sandbox is not allocated to this consumer")]
    NotOwner,

    #[error("allocation hold window has expired")]
    Expired,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("unknown sandbox")]
    NotFound,

    #[error("sandbox is not allocated to this consumer")]
    NotOwner,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AllocationEngine {
    store: Arc<dyn SandboxStore>,
    clock: Arc<dyn Clock>,
    k_candidates: usize,
    max_hold_seconds: i64,
}

impl AllocationEngine {
    pub fn new(
        store: Arc<dyn SandboxStore>,
        clock: Arc<dyn Clock>,
        k_candidates: usize,
        lab_duration_hours: i64,
    ) -> Self {
        Self {
            store,
            clock,
            k_candidates,
            max_hold_seconds: lab_duration_hours * 3600,
        }
    }

    /// Claim one available sandbox for `consumer_id`.
    ///
    /// Fast path: the idempotency index answers re-claims while the hold is
    /// active. Otherwise up to K shuffled candidates are tried with
    /// conditional writes until one wins.
    pub async fn claim(
        &self,
        consumer_id: &str,
        track_name: Option<&str>,
        name_prefix: Option<&str>,
    ) -> Result<ClaimSuccess, ClaimError> {
        if let Some(held) = retried(|| self.store.query_by_idem(consumer_id)).await? {
            if held.status == SandboxStatus::Allocated
                && held.allocated_to_sandbox_id.as_deref() == Some(consumer_id)
            {
                metrics::ALLOCATE_IDEMPOTENT_HITS.inc();
                debug!(
                    consumer_id,
                    sandbox_id = %held.sandbox_id,
                    "Idempotent re-claim"
                );
                return Ok(ClaimSuccess::AlreadyHeld(held));
            }
        }

        let page = retried(|| {
            self.store
                .query_by_status(SandboxStatus::Available, self.k_candidates as u32, None)
        })
        .await?;

        let mut candidates: Vec<SandboxRecord> = match name_prefix {
            Some(prefix) => page
                .items
                .into_iter()
                .filter(|r| r.name.starts_with(prefix))
                .collect(),
            None => page.items,
        };

        if candidates.is_empty() {
            return Err(ClaimError::PoolExhausted);
        }

        // Spread contention: concurrent allocators try candidates in
        // different orders
        candidates.shuffle(&mut rand::thread_rng());

        let now = self.clock.now();
        let mut conflicts = 0;
        for candidate in &candidates {
            match self
                .store
                .atomic_claim(&candidate.sandbox_id, consumer_id, track_name, now)
                .await?
            {
                ClaimOutcome::Claimed(rec) => {
                    debug!(
                        consumer_id,
                        sandbox_id = %rec.sandbox_id,
                        conflicts,
                        "Claim won"
                    );
                    return Ok(ClaimSuccess::Claimed(rec));
                }
                ClaimOutcome::Conflict => {
                    conflicts += 1;
                    metrics::ALLOCATE_CONFLICTS.inc();
                }
            }
        }

        Err(ClaimError::AllCandidatesConflicted(conflicts))
    }

    /// Transition an active hold to `pending_deletion`
    pub async fn release(
        &self,
        sandbox_id: &str,
        consumer_id: &str,
    ) -> Result<SandboxRecord, ReleaseError> {
        let now = self.clock.now();
        let outcome = retried(|| {
            self.store
                .atomic_release(sandbox_id, consumer_id, now, self.max_hold_seconds)
        })
        .await?;

        match outcome {
            ReleaseOutcome::Released(rec) => Ok(rec),
            ReleaseOutcome::NotFound => Err(ReleaseError::NotFound),
            ReleaseOutcome::NotOwner => Err(ReleaseError::NotOwner),
            ReleaseOutcome::Expired => Err(ReleaseError::Expired),
        }
    }

    /// Read a record, denying consumers that do not hold it
    pub async fn get_owned(
        &self,
        sandbox_id: &str,
        consumer_id: &str,
    ) -> Result<SandboxRecord, ReadError> {
        let record = retried(|| self.store.get(sandbox_id))
            .await?
            .ok_or(ReadError::NotFound)?;

        if record.allocated_to_sandbox_id.as_deref() != Some(consumer_id) {
            return Err(ReadError::NotOwner);
        }
        Ok(record)
    }
}

/// Store reads and single conditional writes retried on transient trouble
/// only, jittered and capped at a couple of seconds
async fn retried<F, Fut, T>(f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    with_retry_if(RetryConfig::default(), StoreError::is_transient, f).await
}
