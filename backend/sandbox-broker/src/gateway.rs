//! Circuit-broken access to the CSP
//!
//! Every CSP call in the system goes through this gateway. While the breaker
//! is open, callers get `UpstreamUnavailable` with a retry hint instead of a
//! doomed network round-trip; sync and cleanup pause, claim and release keep
//! serving the pool unchanged.

use std::sync::Arc;
use std::time::Duration;

use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
use thiserror::Error;

use crate::config::BreakerConfig;
use crate::csp::{CspAccount, CspApi, DestroyOutcome};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Breaker is open (or probing); retry after the hint
    #[error("upstream unavailable; retry after {retry_after_secs}s")]
    UpstreamUnavailable { retry_after_secs: u64 },

    /// The upstream call ran and failed
    #[error("upstream call failed: {0}")]
    Failed(String),
}

pub struct CspGateway {
    api: Arc<dyn CspApi>,
    breaker: CircuitBreaker,
}

impl CspGateway {
    pub fn new(api: Arc<dyn CspApi>, cfg: &BreakerConfig) -> Self {
        Self {
            api,
            breaker: CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: cfg.threshold,
                open_duration: Duration::from_secs(cfg.timeout_sec),
            }),
        }
    }

    pub async fn list_active_sandboxes(&self) -> Result<Vec<CspAccount>, GatewayError> {
        self.breaker
            .call(|| self.api.list_active_sandboxes())
            .await
            .map_err(map_breaker_error)
    }

    pub async fn destroy(&self, external_id: &str) -> Result<DestroyOutcome, GatewayError> {
        self.breaker
            .call(|| self.api.destroy(external_id))
            .await
            .map_err(map_breaker_error)
    }

    /// Breaker state, for readiness reporting and tests
    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

fn map_breaker_error(err: CircuitBreakerError) -> GatewayError {
    match err {
        CircuitBreakerError::Open { .. } => GatewayError::UpstreamUnavailable {
            retry_after_secs: err.retry_after_secs().unwrap_or(1),
        },
        CircuitBreakerError::CallFailed(message) => GatewayError::Failed(message),
    }
}

impl GatewayError {
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::UpstreamUnavailable { retry_after_secs } => Some(*retry_after_secs),
            GatewayError::Failed(_) => None,
        }
    }
}
