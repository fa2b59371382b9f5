//! API error surface
//!
//! Every failure a client can see is one of ten stable codes rendered as
//! `{"error":{"code","message","request_id","retry_after"?}}`. Store
//! conflicts never reach this layer; they are claim control flow.

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidIdentity,
    Unauthorized,
    ForbiddenNotOwner,
    AllocationExpired,
    NotFound,
    PoolExhausted,
    ClaimConflict,
    RateLimited,
    UpstreamUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidIdentity => "INVALID_IDENTITY",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::ForbiddenNotOwner => "FORBIDDEN_NOT_OWNER",
            ErrorCode::AllocationExpired => "ALLOCATION_EXPIRED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PoolExhausted => "POOL_EXHAUSTED",
            ErrorCode::ClaimConflict => "CLAIM_CONFLICT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidIdentity => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::ForbiddenNotOwner | ErrorCode::AllocationExpired => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::PoolExhausted | ErrorCode::ClaimConflict => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", .code.as_str())]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: String,
    /// Seconds until the client should retry; rendered as `Retry-After`
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: request_id.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn invalid_identity(request_id: &str) -> Self {
        Self::new(
            ErrorCode::InvalidIdentity,
            "Missing identity header (X-Instruqt-Sandbox-ID or X-Track-ID)",
            request_id,
        )
    }

    pub fn unauthorized(request_id: &str) -> Self {
        Self::new(ErrorCode::Unauthorized, "Invalid or missing bearer token", request_id)
    }

    pub fn not_owner(request_id: &str) -> Self {
        Self::new(
            ErrorCode::ForbiddenNotOwner,
            "Sandbox is not allocated to this consumer",
            request_id,
        )
    }

    pub fn allocation_expired(request_id: &str) -> Self {
        Self::new(
            ErrorCode::AllocationExpired,
            "Allocation hold window has expired",
            request_id,
        )
    }

    pub fn not_found(request_id: &str, sandbox_id: &str) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("Unknown sandbox: {}", sandbox_id),
            request_id,
        )
    }

    pub fn pool_exhausted(request_id: &str) -> Self {
        Self::new(
            ErrorCode::PoolExhausted,
            "No available sandbox in the pool",
            request_id,
        )
    }

    pub fn claim_conflict(request_id: &str) -> Self {
        Self::new(
            ErrorCode::ClaimConflict,
            "All candidate sandboxes were claimed concurrently; retry",
            request_id,
        )
    }

    pub fn rate_limited(request_id: &str, retry_after: u64) -> Self {
        Self::new(ErrorCode::RateLimited, "Rate limit exceeded", request_id)
            .with_retry_after(retry_after)
    }

    pub fn upstream_unavailable(request_id: &str, retry_after: Option<u64>) -> Self {
        let err = Self::new(
            ErrorCode::UpstreamUnavailable,
            "Upstream dependency is unavailable",
            request_id,
        );
        match retry_after {
            Some(secs) => err.with_retry_after(secs),
            None => err,
        }
    }

    pub fn internal(request_id: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message, request_id)
    }

    fn body(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
            "request_id": self.request_id,
        });
        if let Some(secs) = self.retry_after {
            error["retry_after"] = serde_json::json!(secs);
        }
        serde_json::json!({ "error": error })
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let Some(secs) = self.retry_after {
            builder.insert_header(("Retry-After", secs.to_string()));
        }
        builder.json(self.body())
    }
}
