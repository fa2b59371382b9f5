//! Prometheus collectors and the `/metrics` exposition handler
//!
//! Counters are labeled by outcome so dashboards can split success from
//! conflict and failure without separate metric names. The `pool_*` gauges
//! are fed by the cached stats snapshot, not by per-request scans.

use actix_web::HttpResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // Allocation path
    pub static ref ALLOCATE_TOTAL: IntCounterVec = register_int_counter_vec!(
        "allocate_total",
        "Claim requests segmented by outcome",
        &["outcome"]
    )
    .expect("failed to register allocate_total");

    pub static ref ALLOCATE_CONFLICTS: IntCounter = register_int_counter!(
        "allocate_conflicts",
        "Conditional claim attempts that lost the race"
    )
    .expect("failed to register allocate_conflicts");

    pub static ref ALLOCATE_IDEMPOTENT_HITS: IntCounter = register_int_counter!(
        "allocate_idempotent_hits",
        "Claims answered from the idempotency index"
    )
    .expect("failed to register allocate_idempotent_hits");

    pub static ref DELETION_MARKED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "deletion_marked_total",
        "Release requests segmented by outcome",
        &["outcome"]
    )
    .expect("failed to register deletion_marked_total");

    // Worker loops
    pub static ref SYNC_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_total",
        "Sync iterations segmented by outcome",
        &["outcome"]
    )
    .expect("failed to register sync_total");

    pub static ref SYNC_SANDBOXES_SYNCED_TOTAL: IntCounter = register_int_counter!(
        "sync_sandboxes_synced_total",
        "Sandbox records upserted from CSP sync"
    )
    .expect("failed to register sync_sandboxes_synced_total");

    pub static ref SYNC_SANDBOXES_STALE_TOTAL: IntCounter = register_int_counter!(
        "sync_sandboxes_stale_total",
        "Sandbox records marked stale by CSP sync"
    )
    .expect("failed to register sync_sandboxes_stale_total");

    pub static ref CLEANUP_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cleanup_total",
        "Cleanup iterations segmented by outcome",
        &["outcome"]
    )
    .expect("failed to register cleanup_total");

    pub static ref CLEANUP_DELETED_TOTAL: IntCounter = register_int_counter!(
        "cleanup_deleted_total",
        "Sandboxes destroyed upstream and removed from the pool"
    )
    .expect("failed to register cleanup_deleted_total");

    pub static ref CLEANUP_FAILED_TOTAL: IntCounter = register_int_counter!(
        "cleanup_failed_total",
        "Destroy attempts that failed"
    )
    .expect("failed to register cleanup_failed_total");

    pub static ref EXPIRY_TOTAL: IntCounterVec = register_int_counter_vec!(
        "expiry_total",
        "Auto-expiry iterations segmented by outcome",
        &["outcome"]
    )
    .expect("failed to register expiry_total");

    pub static ref EXPIRY_MARKED_TOTAL: IntCounter = register_int_counter!(
        "expiry_marked_total",
        "Overdue allocations reclaimed into pending_deletion"
    )
    .expect("failed to register expiry_marked_total");

    // HTTP surface
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total HTTP requests",
        &["method", "endpoint", "status"]
    )
    .expect("failed to register http_requests_total");

    pub static ref REQUEST_LATENCY_SECONDS: HistogramVec = register_histogram_vec!(
        "request_latency_seconds",
        "HTTP request latency",
        &["method", "endpoint"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("failed to register request_latency_seconds");

    pub static ref ALLOCATION_LATENCY_SECONDS: HistogramVec = register_histogram_vec!(
        "allocation_latency_seconds",
        "Claim latency segmented by outcome",
        &["outcome"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("failed to register allocation_latency_seconds");

    // Pool gauges, refreshed from the cached stats snapshot
    pub static ref POOL_AVAILABLE: IntGauge =
        register_int_gauge!("pool_available", "Records in status available")
            .expect("failed to register pool_available");
    pub static ref POOL_ALLOCATED: IntGauge =
        register_int_gauge!("pool_allocated", "Records in status allocated")
            .expect("failed to register pool_allocated");
    pub static ref POOL_PENDING_DELETION: IntGauge =
        register_int_gauge!("pool_pending_deletion", "Records in status pending_deletion")
            .expect("failed to register pool_pending_deletion");
    pub static ref POOL_STALE: IntGauge =
        register_int_gauge!("pool_stale", "Records in status stale")
            .expect("failed to register pool_stale");
    pub static ref POOL_DELETION_FAILED: IntGauge =
        register_int_gauge!("pool_deletion_failed", "Records in status deletion_failed")
            .expect("failed to register pool_deletion_failed");
    pub static ref POOL_TOTAL: IntGauge =
        register_int_gauge!("pool_total", "Total tracked records")
            .expect("failed to register pool_total");
}

/// Actix handler that renders Prometheus metrics in text format
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
