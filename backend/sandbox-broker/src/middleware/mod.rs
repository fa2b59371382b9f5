//! Handler wrappers, applied in a load-bearing order
//!
//! Outermost to innermost: security headers, request ID, rate limit,
//! logging, then per-scope bearer auth. The rate limiter runs before auth
//! so invalid tokens still spend tokens, and inside the security wrapper so
//! rejections still carry the hardening headers.

pub mod auth;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

pub use auth::BearerAuth;
pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
pub use rate_limit::{RateLimitMiddleware, TokenBucketLimiter};
pub use request_id::{request_id, RequestId, RequestIdMiddleware};
pub use security_headers::SecurityHeaders;
