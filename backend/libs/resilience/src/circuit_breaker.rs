/// Circuit breaker guarding a single upstream dependency
///
/// State transitions:
/// - Closed → Open: when consecutive failures reach the threshold
/// - Open → HalfOpen: after the open duration elapses
/// - HalfOpen → Closed: when the single admitted probe succeeds
/// - HalfOpen → Open: when the probe fails (open timer restarts)
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit is open, requests fail fast
    Open,
    /// Testing if the upstream recovered, exactly one probe allowed
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failure count to trigger circuit open
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitBreakerState>>,
}

struct CircuitBreakerState {
    current: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// A HalfOpen probe has been admitted and has not yet completed
    probe_in_flight: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open - retry after {retry_after:?}")]
    Open { retry_after: Duration },
    #[error("Call failed: {0}")]
    CallFailed(String),
}

impl CircuitBreakerError {
    /// Hint for the `Retry-After` header, in whole seconds (rounded up)
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            CircuitBreakerError::Open { retry_after } => {
                Some(retry_after.as_secs_f64().ceil() as u64)
            }
            CircuitBreakerError::CallFailed(_) => None,
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitBreakerState {
                current: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            })),
            config,
        }
    }

    /// Execute a future with circuit breaker protection
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let is_probe = match self.try_acquire() {
            Ok(is_probe) => is_probe,
            Err(retry_after) => return Err(CircuitBreakerError::Open { retry_after }),
        };

        match f().await {
            Ok(result) => {
                self.record_success(is_probe);
                Ok(result)
            }
            Err(e) => {
                self.record_failure(is_probe);
                Err(CircuitBreakerError::CallFailed(e.to_string()))
            }
        }
    }

    /// Decide whether a call may proceed. Returns `Ok(true)` when the call is
    /// the HalfOpen probe, `Err(retry_after)` when the circuit rejects it.
    fn try_acquire(&self) -> Result<bool, Duration> {
        let mut state = self.state.write();

        match state.current {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.open_duration);
                if elapsed >= self.config.open_duration {
                    info!("Circuit breaker: Open → HalfOpen, admitting probe");
                    state.current = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.config.open_duration - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    // Only one probe at a time; others come back shortly
                    Err(Duration::from_secs(1))
                } else {
                    state.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self, is_probe: bool) {
        let mut state = self.state.write();

        state.consecutive_failures = 0;
        if is_probe {
            state.probe_in_flight = false;
        }
        if state.current != CircuitState::Closed {
            info!("Circuit breaker: {:?} → Closed", state.current);
            state.current = CircuitState::Closed;
            state.opened_at = None;
        }
    }

    fn record_failure(&self, is_probe: bool) {
        let mut state = self.state.write();

        if is_probe {
            state.probe_in_flight = false;
        }

        match state.current {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker: Closed → Open (failures: {})",
                        state.consecutive_failures
                    );
                    state.current = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker: HalfOpen → Open (probe failed)");
                state.current = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Get current circuit state (for monitoring)
    pub fn state(&self) -> CircuitState {
        self.state.read().current
    }
}
