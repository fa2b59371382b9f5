//! API process composition root
//!
//! Builds the leaves (clock, store, CSP client), wires them into the
//! allocation engine and admin services, and serves the HTTP surface.
//! Middleware executes security-headers → CORS → request-ID → rate-limit →
//! metrics → logging, with bearer auth wrapping the consumer and admin
//! scopes; the rate limiter runs before auth so invalid tokens still spend
//! tokens, and inside the security wrapper so rejections carry the
//! hardening headers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer};
use sandbox_broker::clock::{Clock, SystemClock};
use sandbox_broker::config::Config;
use sandbox_broker::middleware::{
    MetricsMiddleware, RateLimitMiddleware, RequestIdMiddleware, RequestLogging, SecurityHeaders,
    TokenBucketLimiter,
};
use sandbox_broker::store::{DynamoStore, SandboxStore};
use sandbox_broker::{build_cors, configure_routes, csp, init_tracing, AppState};

/// Idle rate-limit buckets are swept on this period
const BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.log);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        api_prefix = %config.app.api_prefix,
        k_candidates = config.lifecycle.k_candidates,
        "Starting sandbox-broker-api"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn SandboxStore> = Arc::new(DynamoStore::connect(&config.store).await);
    let csp_client = match csp::build_client(&config.csp) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build CSP client");
            return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
        }
    };

    let limiter = TokenBucketLimiter::new(
        config.rate_limit.requests_per_second,
        config.rate_limit.burst,
        clock.clone(),
    );
    let state = AppState::build(config.clone(), store, csp_client, clock);

    // Background sweep of idle rate-limit buckets
    let sweeper = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BUCKET_SWEEP_INTERVAL);
            interval.tick().await; // first tick is immediate
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        })
    };

    let bind_address = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!("Starting HTTP server at {}", bind_address);

    let server_config = config.clone();
    let server = HttpServer::new(move || {
        App::new()
            .configure(configure_routes(state.clone()))
            .wrap(RequestLogging)
            .wrap(MetricsMiddleware)
            .wrap(RateLimitMiddleware::new(limiter.clone()))
            .wrap(RequestIdMiddleware)
            .wrap(build_cors(&server_config.cors))
            .wrap(SecurityHeaders)
    })
    .bind(&bind_address)?
    .run();

    let result = server.await;

    sweeper.abort();
    tracing::info!("sandbox-broker-api shutting down");
    result
}
