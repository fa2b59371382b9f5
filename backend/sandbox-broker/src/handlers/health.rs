//! Liveness and readiness probes
//!
//! Never rate-limited; orchestrator probes must not be starved.

use actix_web::{web, HttpResponse};
use chrono::Utc;

use crate::store::SandboxStore as _;
use crate::AppState;

/// GET /healthz
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /readyz: 200 when the store answers, 503 otherwise. A NotFound on
/// the probe key still proves the store is reachable.
pub async fn readyz(state: web::Data<AppState>) -> HttpResponse {
    match state.ctx.store.get("__readiness-probe__").await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "status": "ready" })),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness probe failed");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "unavailable",
                "error": e.to_string(),
            }))
        }
    }
}
