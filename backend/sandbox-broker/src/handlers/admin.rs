//! Admin endpoints: pool inspection and manual reconciliation triggers
//!
//! The trigger endpoints run the same iteration bodies as the worker loops,
//! so an operator-invoked sync behaves exactly like a scheduled one.

use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::error::ApiError;
use crate::handlers::map_store_error;
use crate::metrics;
use crate::middleware::request_id;
use crate::models::SandboxStatus;
use crate::worker;
use crate::worker::cleanup::CleanupError;
use crate::worker::sync::SyncError;
use crate::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<SandboxStatus>,
    limit: Option<u32>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteQuery {
    status: SandboxStatus,
}

#[derive(Debug, Deserialize)]
pub struct StaleDeleteQuery {
    grace_period_hours: Option<i64>,
}

/// GET /admin/sandboxes?status=&limit=&cursor=
pub async fn list_sandboxes(
    req: HttpRequest,
    query: web::Query<ListQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let page = state
        .admin
        .list(query.status, limit, query.cursor.as_deref())
        .await
        .map_err(|e| map_store_error(&request_id, &e))?;

    let mut body = serde_json::json!({ "items": page.items });
    if let Some(cursor) = page.next_cursor {
        body["next_cursor"] = serde_json::json!(cursor);
    }
    Ok(HttpResponse::Ok().json(body))
}

/// GET /admin/stats
pub async fn stats(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);
    let snapshot = state
        .stats
        .snapshot()
        .await
        .map_err(|e| map_store_error(&request_id, &e))?;
    Ok(HttpResponse::Ok().json(snapshot))
}

/// POST /admin/sync
pub async fn trigger_sync(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);

    match worker::sync::run_once(&state.ctx).await {
        Ok(outcome) => {
            metrics::SYNC_TOTAL.with_label_values(&["success"]).inc();
            tracing::info!(
                request_id = %request_id,
                synced = outcome.synced,
                marked_stale = outcome.marked_stale,
                "Manual sync completed"
            );
            Ok(HttpResponse::Ok().json(outcome))
        }
        Err(e) => {
            metrics::SYNC_TOTAL.with_label_values(&["error"]).inc();
            Err(map_sync_error(&request_id, e))
        }
    }
}

/// POST /admin/cleanup
pub async fn trigger_cleanup(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);

    match worker::cleanup::run_once(&state.ctx).await {
        Ok(outcome) => {
            metrics::CLEANUP_TOTAL.with_label_values(&["success"]).inc();
            tracing::info!(
                request_id = %request_id,
                deleted = outcome.deleted,
                failed = outcome.failed,
                "Manual cleanup completed"
            );
            Ok(HttpResponse::Ok().json(outcome))
        }
        Err(e) => {
            metrics::CLEANUP_TOTAL.with_label_values(&["error"]).inc();
            Err(map_cleanup_error(&request_id, e))
        }
    }
}

/// POST /admin/bulk-delete?status=
pub async fn bulk_delete(
    req: HttpRequest,
    query: web::Query<BulkDeleteQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);
    let started = Instant::now();

    let deleted = state
        .admin
        .bulk_delete(query.status)
        .await
        .map_err(|e| map_store_error(&request_id, &e))?;

    tracing::info!(
        request_id = %request_id,
        status = %query.status,
        deleted,
        "Bulk delete completed"
    );
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "deleted": deleted,
        "duration_ms": started.elapsed().as_millis() as u64,
    })))
}

/// POST /admin/auto-expire
pub async fn auto_expire(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);

    let marked = worker::auto_expiry::run_once(&state.ctx)
        .await
        .map_err(|e| map_store_error(&request_id, &e))?;
    metrics::EXPIRY_TOTAL.with_label_values(&["success"]).inc();

    Ok(HttpResponse::Ok().json(serde_json::json!({ "marked": marked })))
}

/// POST /admin/auto-delete-stale?grace_period_hours=
pub async fn auto_delete_stale(
    req: HttpRequest,
    query: web::Query<StaleDeleteQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);
    let grace_hours = query
        .grace_period_hours
        .unwrap_or(state.config.worker.stale_grace_hours);

    let deleted = worker::stale_delete::run_once(&state.ctx, grace_hours * 3600)
        .await
        .map_err(|e| map_store_error(&request_id, &e))?;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "deleted": deleted })))
}

fn map_sync_error(request_id: &str, err: SyncError) -> ApiError {
    match err {
        SyncError::Upstream(e) => {
            tracing::warn!(request_id, error = %e, "Manual sync hit unavailable upstream");
            ApiError::upstream_unavailable(request_id, e.retry_after_secs())
        }
        SyncError::Store(e) => map_store_error(request_id, &e),
    }
}

fn map_cleanup_error(request_id: &str, err: CleanupError) -> ApiError {
    match err {
        CleanupError::Upstream(e) => {
            tracing::warn!(request_id, error = %e, "Manual cleanup hit unavailable upstream");
            ApiError::upstream_unavailable(request_id, e.retry_after_secs())
        }
        CleanupError::Store(e) => map_store_error(request_id, &e),
    }
}
