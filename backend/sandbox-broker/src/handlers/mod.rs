pub mod admin;
pub mod health;
pub mod sandboxes;

use crate::error::ApiError;
use crate::store::StoreError;

/// Store trouble seen from a handler: transient outages are a retryable
/// 503, everything else is a 500 with the detail kept in the logs
pub(crate) fn map_store_error(request_id: &str, err: &StoreError) -> ApiError {
    match err {
        StoreError::Transient(message) => {
            tracing::warn!(request_id, error = %message, "Store transiently unavailable");
            ApiError::upstream_unavailable(request_id, Some(1))
        }
        StoreError::Internal(message) => {
            tracing::error!(request_id, error = %message, "Store operation failed");
            ApiError::internal(request_id, "Internal error")
        }
    }
}
