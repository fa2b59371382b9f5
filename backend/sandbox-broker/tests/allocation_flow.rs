//! Allocation engine properties under contention
//!
//! Exercised against the in-memory store, whose conditional writes carry
//! the same linearizable semantics as the DynamoDB adapter.

use std::collections::HashSet;
use std::sync::Arc;

use sandbox_broker::clock::{Clock as _, ManualClock};
use sandbox_broker::models::{SandboxRecord, SandboxStatus};
use sandbox_broker::services::{AllocationEngine, ClaimError, ClaimSuccess, ReleaseError};
use sandbox_broker::store::{MemoryStore, SandboxStore};

const T0: i64 = 1_700_000_000;

async fn seeded(
    pool_size: usize,
) -> (Arc<AllocationEngine>, Arc<MemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(T0);
    for i in 0..pool_size {
        store
            .put(&SandboxRecord::available(
                format!("s{:03}", i),
                format!("sandbox-{:03}", i),
                format!("identity/accounts/{:03}", i),
                T0 - 86_400,
                T0,
                4,
            ))
            .await
            .unwrap();
    }
    let engine = Arc::new(AllocationEngine::new(store.clone(), clock.clone(), 15, 4));
    (engine, store, clock)
}

/// Claim with the caller-side contract: `AllCandidatesConflicted` is
/// retryable immediately, everything else settles the attempt
async fn claim_until_settled(
    engine: &AllocationEngine,
    consumer: &str,
) -> Result<ClaimSuccess, ClaimError> {
    loop {
        match engine.claim(consumer, None, None).await {
            Err(ClaimError::AllCandidatesConflicted(_)) => continue,
            settled => return settled,
        }
    }
}

async fn available_count(store: &MemoryStore) -> usize {
    store
        .query_by_status(SandboxStatus::Available, 1000, None)
        .await
        .unwrap()
        .items
        .len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn contention_fifty_consumers_fifty_records() {
    let (engine, store, _clock) = seeded(50).await;

    let mut tasks = Vec::new();
    for i in 0..50 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            claim_until_settled(&engine, &format!("consumer-{:02}", i)).await
        }));
    }

    let mut claimed_ids = HashSet::new();
    for task in tasks {
        let result = task.await.unwrap().expect("every consumer should win");
        claimed_ids.insert(result.record().sandbox_id.clone());
    }

    // 50 successes, all distinct, pool drained
    assert_eq!(claimed_ids.len(), 50);
    assert_eq!(available_count(&store).await, 0);

    // No record has two owners
    let page = store
        .query_by_status(SandboxStatus::Allocated, 1000, None)
        .await
        .unwrap();
    let owners: HashSet<_> = page
        .items
        .iter()
        .map(|r| r.allocated_to_sandbox_id.clone().unwrap())
        .collect();
    assert_eq!(owners.len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn exhaustion_twenty_consumers_ten_records() {
    let (engine, store, _clock) = seeded(10).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            claim_until_settled(&engine, &format!("consumer-{:02}", i)).await
        }));
    }

    let mut successes = HashSet::new();
    let mut rejections = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(success) => {
                successes.insert(success.record().sandbox_id.clone());
            }
            Err(ClaimError::PoolExhausted) => {
                rejections += 1;
            }
            Err(other) => panic!("unexpected claim error: {:?}", other),
        }
    }

    assert_eq!(successes.len(), 10);
    assert_eq!(rejections, 10);
    assert_eq!(available_count(&store).await, 0);
}

#[tokio::test]
async fn idempotent_reclaim_window_is_the_active_hold() {
    let (engine, _store, clock) = seeded(2).await;

    let first = engine.claim("c1", None, None).await.unwrap();
    let held_id = first.record().sandbox_id.clone();
    assert!(matches!(first, ClaimSuccess::Claimed(_)));

    // Every re-claim during the hold returns the same record
    for _ in 0..3 {
        let again = engine.claim("c1", None, None).await.unwrap();
        assert!(matches!(again, ClaimSuccess::AlreadyHeld(_)));
        assert_eq!(again.record().sandbox_id, held_id);
    }

    // After release the key is free again; a new claim gets the other record
    clock.advance_secs(60);
    engine.release(&held_id, "c1").await.unwrap();
    let fresh = engine.claim("c1", None, None).await.unwrap();
    assert!(matches!(fresh, ClaimSuccess::Claimed(_)));
    assert_ne!(fresh.record().sandbox_id, held_id);
}

#[tokio::test]
async fn release_happens_exactly_once() {
    let (engine, store, clock) = seeded(1).await;
    let claimed = engine.claim("c1", None, None).await.unwrap();
    let id = claimed.record().sandbox_id.clone();

    clock.advance_secs(30);
    let released = engine.release(&id, "c1").await.unwrap();
    assert_eq!(released.status, SandboxStatus::PendingDeletion);
    assert_eq!(released.deletion_requested_at, Some(clock.now()));

    // Duplicate release: ownership is gone, 403 territory
    let duplicate = engine.release(&id, "c1").await.unwrap_err();
    assert!(matches!(duplicate, ReleaseError::NotOwner));

    // The record stayed in pending_deletion with the original timestamp
    let rec = store.snapshot(&id).unwrap();
    assert_eq!(rec.status, SandboxStatus::PendingDeletion);
    assert_eq!(rec.deletion_requested_at, Some(clock.now()));
}

#[tokio::test]
async fn track_name_is_stored_at_claim_time() {
    let (engine, store, _clock) = seeded(1).await;
    let claimed = engine.claim("c1", Some("kubernetes-101"), None).await.unwrap();
    let rec = store.snapshot(&claimed.record().sandbox_id).unwrap();
    assert_eq!(rec.track_name.as_deref(), Some("kubernetes-101"));
    assert_eq!(rec.idempotency_key.as_deref(), Some("c1"));
}
