//! End-to-end HTTP scenarios through the full middleware stack

use std::collections::HashSet;
use std::sync::Arc;

use actix_web::{test, App};
use sandbox_broker::clock::ManualClock;
use sandbox_broker::config::Config;
use sandbox_broker::csp::MockCsp;
use sandbox_broker::middleware::{
    MetricsMiddleware, RateLimitMiddleware, RequestIdMiddleware, RequestLogging, SecurityHeaders,
    TokenBucketLimiter,
};
use sandbox_broker::models::{SandboxRecord, SandboxStatus};
use sandbox_broker::store::{MemoryStore, SandboxStore};
use sandbox_broker::{configure_routes, AppState};

const T0: i64 = 1_700_000_000;
const API_TOKEN: &str = "test-api-token";
const ADMIN_TOKEN: &str = "test-admin-token";

fn test_config(rate: f64, burst: f64) -> Config {
    let mut config = Config::from_env().unwrap();
    config.auth.api_token = API_TOKEN.to_string();
    config.auth.admin_token = ADMIN_TOKEN.to_string();
    config.rate_limit.requests_per_second = rate;
    config.rate_limit.burst = burst;
    config
}

struct Harness {
    state: actix_web::web::Data<AppState>,
    limiter: Arc<TokenBucketLimiter>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

async fn harness_with(pool_size: usize, config: Config) -> Harness {
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
    let limiter = TokenBucketLimiter::new(
        config.rate_limit.requests_per_second,
        config.rate_limit.burst,
        clock.clone(),
    );
    let state = AppState::build(
        config,
        store.clone(),
        Arc::new(MockCsp::with_fixture()),
        clock.clone(),
    );
    Harness {
        state,
        limiter,
        store,
        clock,
    }
}

async fn harness(pool_size: usize) -> Harness {
    harness_with(pool_size, test_config(100.0, 200.0)).await
}

macro_rules! test_app {
    ($h:expr) => {
        test::init_service(
            App::new()
                .configure(configure_routes($h.state.clone()))
                .wrap(RequestLogging)
                .wrap(MetricsMiddleware)
                .wrap(RateLimitMiddleware::new($h.limiter.clone()))
                .wrap(RequestIdMiddleware)
                .wrap(SecurityHeaders),
        )
        .await
    };
}

fn allocate_req(consumer: &str) -> actix_web::test::TestRequest {
    test::TestRequest::post()
        .uri("/v1/allocate")
        .insert_header(("Authorization", format!("Bearer {}", API_TOKEN)))
        .insert_header(("X-Instruqt-Sandbox-ID", consumer))
}

#[actix_web::test]
async fn single_claim_happy_path() {
    let h = harness(1).await;
    let app = test_app!(h);

    let res = test::call_service(&app, allocate_req("c1").to_request()).await;
    assert_eq!(res.status().as_u16(), 200);
    assert!(res.headers().contains_key("x-request-id"));
    assert_eq!(res.headers().get("x-frame-options").unwrap(), "DENY");
    assert!(res.headers().contains_key("x-ratelimit-limit"));

    let body: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(body["sandbox_id"], "s000");
    assert_eq!(body["allocated_at"], T0);
    assert_eq!(body["expires_at"], T0 + 4 * 3600);

    let rec = h.store.snapshot("s000").unwrap();
    assert_eq!(rec.status, SandboxStatus::Allocated);
    assert_eq!(rec.allocated_to_sandbox_id.as_deref(), Some("c1"));
}

#[actix_web::test]
async fn idempotent_reclaim_returns_same_sandbox() {
    let h = harness(3).await;
    let app = test_app!(h);

    let first: serde_json::Value =
        test::read_body_json(test::call_service(&app, allocate_req("c1").to_request()).await).await;
    let second: serde_json::Value =
        test::read_body_json(test::call_service(&app, allocate_req("c1").to_request()).await).await;

    assert_eq!(first["sandbox_id"], second["sandbox_id"]);

    let allocated = h
        .store
        .query_by_status(SandboxStatus::Allocated, 100, None)
        .await
        .unwrap();
    assert_eq!(allocated.items.len(), 1);
}

#[actix_web::test]
async fn contention_fifty_consumers_fifty_records() {
    let h = harness(50).await;
    let app = test_app!(h);

    let calls = (0..50).map(|i| {
        let app = &app;
        async move {
            // CLAIM_CONFLICT is retryable immediately, per the API contract
            loop {
                let res = test::call_service(
                    app,
                    allocate_req(&format!("consumer-{:02}", i)).to_request(),
                )
                .await;
                let status = res.status().as_u16();
                let body: serde_json::Value = test::read_body_json(res).await;
                if status == 200 {
                    return body["sandbox_id"].as_str().unwrap().to_string();
                }
                assert_eq!(status, 409);
                assert_eq!(body["error"]["code"], "CLAIM_CONFLICT");
            }
        }
    });
    let ids: HashSet<String> = futures::future::join_all(calls).await.into_iter().collect();

    assert_eq!(ids.len(), 50);
    let available = h
        .store
        .query_by_status(SandboxStatus::Available, 100, None)
        .await
        .unwrap();
    assert!(available.items.is_empty());
}

#[actix_web::test]
async fn exhaustion_returns_409_for_the_losers() {
    let h = harness(10).await;
    let app = test_app!(h);

    let mut winners = HashSet::new();
    let mut exhausted = 0;
    for i in 0..20 {
        loop {
            let res = test::call_service(
                &app,
                allocate_req(&format!("consumer-{:02}", i)).to_request(),
            )
            .await;
            let status = res.status().as_u16();
            let body: serde_json::Value = test::read_body_json(res).await;
            match status {
                200 => {
                    winners.insert(body["sandbox_id"].as_str().unwrap().to_string());
                    break;
                }
                409 if body["error"]["code"] == "CLAIM_CONFLICT" => continue,
                409 => {
                    assert_eq!(body["error"]["code"], "POOL_EXHAUSTED");
                    assert_eq!(body["error"]["request_id"].as_str().unwrap().len(), 36);
                    exhausted += 1;
                    break;
                }
                other => panic!("unexpected status {}", other),
            }
        }
    }

    assert_eq!(winners.len(), 10);
    assert_eq!(exhausted, 10);
}

#[actix_web::test]
async fn release_by_non_owner_is_403_and_record_unchanged() {
    let h = harness(1).await;
    let app = test_app!(h);

    test::call_service(&app, allocate_req("c1").to_request()).await;

    let res = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/sandboxes/s000/mark-for-deletion")
            .insert_header(("Authorization", format!("Bearer {}", API_TOKEN)))
            .insert_header(("X-Instruqt-Sandbox-ID", "c2"))
            .to_request(),
    )
    .await;

    assert_eq!(res.status().as_u16(), 403);
    let body: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(body["error"]["code"], "FORBIDDEN_NOT_OWNER");
    assert_eq!(h.store.snapshot("s000").unwrap().status, SandboxStatus::Allocated);
}

#[actix_web::test]
async fn release_by_owner_marks_pending_deletion() {
    let h = harness(1).await;
    let app = test_app!(h);

    test::call_service(&app, allocate_req("c1").to_request()).await;
    h.clock.advance_secs(120);

    let res = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/sandboxes/s000/mark-for-deletion")
            .insert_header(("Authorization", format!("Bearer {}", API_TOKEN)))
            .insert_header(("X-Track-ID", "c1"))
            .to_request(),
    )
    .await;

    assert_eq!(res.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(body["status"], "pending_deletion");
    assert_eq!(body["deletion_requested_at"], T0 + 120);
}

#[actix_web::test]
async fn missing_identity_is_400() {
    let h = harness(1).await;
    let app = test_app!(h);

    let res = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/allocate")
            .insert_header(("Authorization", format!("Bearer {}", API_TOKEN)))
            .to_request(),
    )
    .await;

    assert_eq!(res.status().as_u16(), 400);
    let body: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(body["error"]["code"], "INVALID_IDENTITY");
}

#[actix_web::test]
async fn bad_token_is_401_and_still_carries_headers() {
    let h = harness(1).await;
    let app = test_app!(h);

    let res = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/allocate")
            .insert_header(("Authorization", "Bearer wrong"))
            .insert_header(("X-Instruqt-Sandbox-ID", "c1"))
            .to_request(),
    )
    .await;

    assert_eq!(res.status().as_u16(), 401);
    assert_eq!(res.headers().get("x-frame-options").unwrap(), "DENY");
    assert!(res.headers().contains_key("x-request-id"));
    let body: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[actix_web::test]
async fn consumer_token_cannot_reach_admin() {
    let h = harness(0).await;
    let app = test_app!(h);

    let res = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/v1/admin/stats")
            .insert_header(("Authorization", format!("Bearer {}", API_TOKEN)))
            .to_request(),
    )
    .await;
    assert_eq!(res.status().as_u16(), 401);
}

#[actix_web::test]
async fn rate_limit_rejects_beyond_burst_and_probes_bypass() {
    let h = harness_with(1, test_config(1.0, 2.0)).await;
    let app = test_app!(h);

    // Burst of 2: two requests pass (whatever their outcome), third is 429
    for _ in 0..2 {
        let res = test::call_service(&app, allocate_req("c1").to_request()).await;
        assert_ne!(res.status().as_u16(), 429);
    }
    let res = test::call_service(&app, allocate_req("c1").to_request()).await;
    assert_eq!(res.status().as_u16(), 429);
    assert_eq!(res.headers().get("retry-after").unwrap(), "1");
    let body: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");

    // Probe endpoints never rate-limit
    for _ in 0..5 {
        let res =
            test::call_service(&app, test::TestRequest::get().uri("/healthz").to_request()).await;
        assert_eq!(res.status().as_u16(), 200);
    }

    // Refill admits the same client again
    h.clock.advance_secs(2);
    let res = test::call_service(&app, allocate_req("c1").to_request()).await;
    assert_ne!(res.status().as_u16(), 429);
}

#[actix_web::test]
async fn admin_stats_and_list_reflect_the_pool() {
    let h = harness(3).await;
    let app = test_app!(h);

    test::call_service(&app, allocate_req("c1").to_request()).await;

    let res = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/v1/admin/stats")
            .insert_header(("Authorization", format!("Bearer {}", ADMIN_TOKEN)))
            .to_request(),
    )
    .await;
    assert_eq!(res.status().as_u16(), 200);
    let stats: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["allocated"], 1);
    assert_eq!(stats["available"], 2);

    let res = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/v1/admin/sandboxes?status=available&limit=1")
            .insert_header(("Authorization", format!("Bearer {}", ADMIN_TOKEN)))
            .to_request(),
    )
    .await;
    assert_eq!(res.status().as_u16(), 200);
    let page: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert!(page["next_cursor"].is_string());
}

#[actix_web::test]
async fn admin_sync_seeds_pool_from_mock_csp() {
    let h = harness(0).await;
    let app = test_app!(h);

    let res = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/admin/sync")
            .insert_header(("Authorization", format!("Bearer {}", ADMIN_TOKEN)))
            .to_request(),
    )
    .await;

    assert_eq!(res.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(body["synced"], 3); // the mock fixture ships three sandboxes
    assert_eq!(h.store.len(), 3);
}

#[actix_web::test]
async fn admin_cleanup_destroys_pending_records() {
    let h = harness(0).await;
    // A pending record whose external_id matches the mock fixture
    let mut rec = SandboxRecord::available(
        "mock-csp-01",
        "mock-sandbox-01",
        "identity/accounts/mock-01",
        T0 - 86_400,
        T0,
        4,
    );
    rec.status = SandboxStatus::PendingDeletion;
    rec.deletion_requested_at = Some(T0);
    h.store.put(&rec).await.unwrap();

    let app = test_app!(h);
    let res = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/admin/cleanup")
            .insert_header(("Authorization", format!("Bearer {}", ADMIN_TOKEN)))
            .to_request(),
    )
    .await;

    assert_eq!(res.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(body["deleted"], 1);
    assert!(h.store.snapshot("mock-csp-01").is_none());
}

#[actix_web::test]
async fn readyz_and_healthz_respond_without_auth() {
    let h = harness(0).await;
    let app = test_app!(h);

    let res = test::call_service(&app, test::TestRequest::get().uri("/healthz").to_request()).await;
    assert_eq!(res.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(res).await;
    assert_eq!(body["status"], "healthy");

    let res = test::call_service(&app, test::TestRequest::get().uri("/readyz").to_request()).await;
    assert_eq!(res.status().as_u16(), 200);

    let res = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(res.status().as_u16(), 200);
}
