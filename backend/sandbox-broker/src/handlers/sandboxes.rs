//! Consumer endpoints: claim, release, read

use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Serialize;

use crate::error::ApiError;
use crate::handlers::map_store_error;
use crate::identity::{consumer_identity, header_value, HEADER_NAME_PREFIX, HEADER_TRACK_NAME};
use crate::metrics;
use crate::middleware::request_id;
use crate::models::SandboxRecord;
use crate::services::{ClaimError, ClaimSuccess, ReadError, ReleaseError};
use crate::AppState;

#[derive(Serialize)]
struct AllocateResponse<'a> {
    sandbox_id: &'a str,
    name: &'a str,
    external_id: &'a str,
    allocated_at: i64,
    expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    track_name: Option<&'a str>,
}

impl<'a> AllocateResponse<'a> {
    fn from_record(rec: &'a SandboxRecord) -> Self {
        Self {
            sandbox_id: &rec.sandbox_id,
            name: &rec.name,
            external_id: &rec.external_id,
            allocated_at: rec.allocated_at,
            expires_at: rec.expires_at(),
            track_name: rec.track_name.as_deref(),
        }
    }
}

/// POST /allocate
pub async fn allocate(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);
    let consumer = consumer_identity(req.headers())
        .ok_or_else(|| ApiError::invalid_identity(&request_id))?;
    let track_name = header_value(req.headers(), HEADER_TRACK_NAME);
    let name_prefix = header_value(req.headers(), HEADER_NAME_PREFIX);

    let started = Instant::now();
    let result = state
        .engine
        .claim(&consumer, track_name.as_deref(), name_prefix.as_deref())
        .await;

    let outcome = match &result {
        Ok(ClaimSuccess::Claimed(_)) => "success",
        Ok(ClaimSuccess::AlreadyHeld(_)) => "idempotent",
        Err(ClaimError::PoolExhausted) => "pool_exhausted",
        Err(ClaimError::AllCandidatesConflicted(_)) => "conflict",
        Err(ClaimError::Store(_)) => "error",
    };
    metrics::ALLOCATE_TOTAL.with_label_values(&[outcome]).inc();
    metrics::ALLOCATION_LATENCY_SECONDS
        .with_label_values(&[outcome])
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(success) => {
            let rec = success.record();
            tracing::info!(
                request_id = %request_id,
                client_identity = %consumer,
                sandbox_id = %rec.sandbox_id,
                track_name = rec.track_name.as_deref().unwrap_or(""),
                outcome,
                "Sandbox allocated"
            );
            Ok(HttpResponse::Ok().json(AllocateResponse::from_record(rec)))
        }
        Err(ClaimError::PoolExhausted) => Err(ApiError::pool_exhausted(&request_id)),
        Err(ClaimError::AllCandidatesConflicted(_)) => Err(ApiError::claim_conflict(&request_id)),
        Err(ClaimError::Store(e)) => Err(map_store_error(&request_id, &e)),
    }
}

/// POST /sandboxes/{sandbox_id}/mark-for-deletion
pub async fn mark_for_deletion(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);
    let sandbox_id = path.into_inner();
    let consumer = consumer_identity(req.headers())
        .ok_or_else(|| ApiError::invalid_identity(&request_id))?;

    let result = state.engine.release(&sandbox_id, &consumer).await;
    let outcome = match &result {
        Ok(_) => "success",
        Err(ReleaseError::NotFound) => "not_found",
        Err(ReleaseError::NotOwner) => "not_owner",
        Err(ReleaseError::Expired) => "expired",
        Err(ReleaseError::Store(_)) => "error",
    };
    metrics::DELETION_MARKED_TOTAL
        .with_label_values(&[outcome])
        .inc();

    match result {
        Ok(rec) => {
            tracing::info!(
                request_id = %request_id,
                client_identity = %consumer,
                sandbox_id = %rec.sandbox_id,
                "Sandbox marked for deletion"
            );
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "sandbox_id": rec.sandbox_id,
                "status": rec.status,
                "deletion_requested_at": rec.deletion_requested_at,
            })))
        }
        Err(ReleaseError::NotFound) => Err(ApiError::not_found(&request_id, &sandbox_id)),
        Err(ReleaseError::NotOwner) => Err(ApiError::not_owner(&request_id)),
        Err(ReleaseError::Expired) => Err(ApiError::allocation_expired(&request_id)),
        Err(ReleaseError::Store(e)) => Err(map_store_error(&request_id, &e)),
    }
}

/// GET /sandboxes/{sandbox_id}
pub async fn get_sandbox(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request_id = request_id(&req);
    let sandbox_id = path.into_inner();
    let consumer = consumer_identity(req.headers())
        .ok_or_else(|| ApiError::invalid_identity(&request_id))?;

    match state.engine.get_owned(&sandbox_id, &consumer).await {
        Ok(rec) => Ok(HttpResponse::Ok().json(rec)),
        Err(ReadError::NotFound) => Err(ApiError::not_found(&request_id, &sandbox_id)),
        Err(ReadError::NotOwner) => Err(ApiError::not_owner(&request_id)),
        Err(ReadError::Store(e)) => Err(map_store_error(&request_id, &e)),
    }
}
