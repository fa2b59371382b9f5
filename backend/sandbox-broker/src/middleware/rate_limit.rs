//! Per-client token bucket rate limiting
//!
//! Buckets live in a sharded concurrent map keyed by client identity, each
//! holding two floats under a small mutex. Refill is computed lazily from
//! the injected clock, so tests drive it deterministically. Probe endpoints
//! bypass the limiter entirely; orchestrator health checks must never
//! starve.
//!
//! State is per-process: N API processes grant up to N×burst in aggregate.
//! That is accepted as eventually-consistent limiting; an absolute cap
//! belongs to an outer layer such as a WAF.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    error::ResponseError,
    Error, HttpMessage,
};
use dashmap::DashMap;
use futures::future::LocalBoxFuture;
use parking_lot::Mutex;
use std::future::{ready, Ready};
use tracing::debug;

use crate::clock::Clock;
use crate::error::ApiError;
use crate::identity::rate_limit_identity;
use crate::middleware::request_id::RequestId;

/// Buckets idle longer than this are reclaimed by the sweeper
const BUCKET_IDLE_EXPIRY: Duration = Duration::from_secs(3600);

/// Probe endpoints are never rate-limited
const BYPASS_PATHS: [&str; 3] = ["/healthz", "/readyz", "/metrics"];

struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
}

#[derive(Debug, PartialEq)]
pub enum RateLimitDecision {
    Allowed {
        limit: u64,
        remaining: u64,
        reset_secs: u64,
    },
    Rejected {
        retry_after_secs: u64,
    },
}

pub struct TokenBucketLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
    rate: f64,
    burst: f64,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(rate: f64, burst: f64, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            buckets: DashMap::new(),
            rate,
            burst,
            clock,
        })
    }

    /// Admit or reject one request for `identity`
    pub fn check(&self, identity: &str) -> RateLimitDecision {
        let now_ms = self.clock.now_millis();
        let entry = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: self.burst,
                    last_refill_ms: now_ms,
                })
            });

        let mut bucket = entry.lock();
        let elapsed_secs = ((now_ms - bucket.last_refill_ms).max(0)) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_secs * self.rate).min(self.burst);
        bucket.last_refill_ms = now_ms;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision::Allowed {
                limit: self.burst as u64,
                remaining: bucket.tokens.floor() as u64,
                reset_secs: ((self.burst - bucket.tokens) / self.rate).ceil() as u64,
            }
        } else {
            RateLimitDecision::Rejected {
                retry_after_secs: (1.0 / self.rate).ceil().max(1.0) as u64,
            }
        }
    }

    /// Drop buckets idle for longer than the expiry window; returns how many
    /// were reclaimed
    pub fn sweep(&self) -> usize {
        let cutoff_ms = self.clock.now_millis() - BUCKET_IDLE_EXPIRY.as_millis() as i64;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.lock().last_refill_ms >= cutoff_ms);
        let reclaimed = before - self.buckets.len();
        if reclaimed > 0 {
            debug!(reclaimed, "Rate-limit bucket sweep");
        }
        reclaimed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

pub struct RateLimitMiddleware {
    limiter: Arc<TokenBucketLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<TokenBucketLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitService {
            service,
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct RateLimitService<S> {
    service: S,
    limiter: Arc<TokenBucketLimiter>,
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if BYPASS_PATHS.contains(&req.path()) {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await.map(|res| res.map_into_left_body()) });
        }

        let identity = {
            let info = req.connection_info().clone();
            rate_limit_identity(req.headers(), info.peer_addr())
        };

        match self.limiter.check(&identity) {
            RateLimitDecision::Rejected { retry_after_secs } => {
                let request_id = req
                    .extensions()
                    .get::<RequestId>()
                    .map(|id| id.0.clone())
                    .unwrap_or_default();
                debug!(client_identity = %identity, "Rate limit exceeded");
                let response =
                    ApiError::rate_limited(&request_id, retry_after_secs).error_response();
                Box::pin(ready(Ok(req.into_response(response).map_into_right_body())))
            }
            RateLimitDecision::Allowed {
                limit,
                remaining,
                reset_secs,
            } => {
                let fut = self.service.call(req);
                Box::pin(async move {
                    let mut res = fut.await?;
                    let headers = res.headers_mut();
                    headers.insert(
                        actix_web::http::header::HeaderName::from_static("x-ratelimit-limit"),
                        limit.into(),
                    );
                    headers.insert(
                        actix_web::http::header::HeaderName::from_static("x-ratelimit-remaining"),
                        remaining.into(),
                    );
                    headers.insert(
                        actix_web::http::header::HeaderName::from_static("x-ratelimit-reset"),
                        reset_secs.into(),
                    );
                    Ok(res.map_into_left_body())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_burst_then_reject() {
        let clock = ManualClock::new(1_000);
        let limiter = TokenBucketLimiter::new(1.0, 2.0, clock.clone());

        assert!(matches!(
            limiter.check("c1"),
            RateLimitDecision::Allowed { remaining: 1, .. }
        ));
        assert!(matches!(
            limiter.check("c1"),
            RateLimitDecision::Allowed { remaining: 0, .. }
        ));
        assert_eq!(
            limiter.check("c1"),
            RateLimitDecision::Rejected {
                retry_after_secs: 1
            }
        );
    }

    #[test]
    fn test_refill_restores_tokens() {
        let clock = ManualClock::new(1_000);
        let limiter = TokenBucketLimiter::new(2.0, 4.0, clock.clone());

        for _ in 0..4 {
            assert!(matches!(limiter.check("c1"), RateLimitDecision::Allowed { .. }));
        }
        assert!(matches!(limiter.check("c1"), RateLimitDecision::Rejected { .. }));

        // 1 second at 2 tokens/sec refills 2 admissions, not more
        clock.advance_secs(1);
        assert!(matches!(limiter.check("c1"), RateLimitDecision::Allowed { .. }));
        assert!(matches!(limiter.check("c1"), RateLimitDecision::Allowed { .. }));
        assert!(matches!(limiter.check("c1"), RateLimitDecision::Rejected { .. }));
    }

    #[test]
    fn test_refill_never_exceeds_burst() {
        let clock = ManualClock::new(1_000);
        let limiter = TokenBucketLimiter::new(10.0, 3.0, clock.clone());

        limiter.check("c1");
        clock.advance_secs(3600);

        // Long idle refills to the cap only
        let mut admitted = 0;
        while matches!(limiter.check("c1"), RateLimitDecision::Allowed { .. }) {
            admitted += 1;
        }
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_admission_envelope() {
        // P7: admitted requests in window W never exceed burst + rate * W
        let clock = ManualClock::new(1_000);
        let rate = 5.0;
        let burst = 10.0;
        let limiter = TokenBucketLimiter::new(rate, burst, clock.clone());

        let window_secs = 4;
        let mut admitted = 0;
        for _ in 0..window_secs * 10 {
            for _ in 0..20 {
                if matches!(limiter.check("c1"), RateLimitDecision::Allowed { .. }) {
                    admitted += 1;
                }
            }
            clock.advance_millis(100);
        }

        assert!(admitted as f64 <= burst + rate * window_secs as f64 + 1.0);
    }

    #[test]
    fn test_buckets_are_per_identity() {
        let clock = ManualClock::new(1_000);
        let limiter = TokenBucketLimiter::new(1.0, 1.0, clock);

        assert!(matches!(limiter.check("c1"), RateLimitDecision::Allowed { .. }));
        assert!(matches!(limiter.check("c1"), RateLimitDecision::Rejected { .. }));
        // A different client still has its full burst
        assert!(matches!(limiter.check("c2"), RateLimitDecision::Allowed { .. }));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_sweep_reclaims_idle_buckets() {
        let clock = ManualClock::new(1_000);
        let limiter = TokenBucketLimiter::new(1.0, 2.0, clock.clone());

        limiter.check("old");
        clock.advance_secs(1800);
        limiter.check("fresh");
        clock.advance_secs(1801); // "old" now idle > 1h, "fresh" just over 30m

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.bucket_count(), 1);
    }
}
