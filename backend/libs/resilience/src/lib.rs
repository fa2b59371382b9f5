/// Resilience patterns for services talking to flaky upstreams
///
/// This library provides:
/// - **Circuit Breaker**: fails fast while an upstream is judged unhealthy,
///   admitting a single probe after the open window and carrying a
///   `retry_after` hint on every rejection
/// - **Retry**: exponential backoff with jitter for transient failures,
///   with an optional predicate so permanent errors surface immediately
///
/// # Example: upstream call with circuit breaker
///
/// ```rust,no_run
/// use resilience::{CircuitBreaker, CircuitBreakerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
///     let result = breaker.call(|| async {
///         // Your upstream call here
///         Ok::<_, String>(())
///     }).await;
/// }
/// ```
pub mod circuit_breaker;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
pub use retry::{with_retry, with_retry_if, RetryConfig};
