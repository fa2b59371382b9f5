//! Sandbox broker
//!
//! Hands out pre-provisioned CSP sandbox accounts to transient consumers
//! under an at-most-one-holder guarantee, and arranges destruction of every
//! sandbox once released or orphaned. Two binaries share this crate: the
//! horizontally-scaled HTTP API and the singleton reconciliation worker.

pub mod clock;
pub mod config;
pub mod csp;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::web;

use crate::clock::Clock;
use crate::config::{Config, CorsConfig};
use crate::csp::CspApi;
use crate::gateway::CspGateway;
use crate::identity::{HEADER_NAME_PREFIX, HEADER_SANDBOX_ID, HEADER_TRACK_ID, HEADER_TRACK_NAME};
use crate::middleware::BearerAuth;
use crate::services::{AdminService, AllocationEngine, StatsService};
use crate::store::SandboxStore;
use crate::worker::WorkerContext;

/// TTL for the cached pool-stats snapshot feeding `/admin/stats` and the
/// `pool_*` gauges
const STATS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Shared API process state, built once in the composition root
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<AllocationEngine>,
    pub stats: Arc<StatsService>,
    pub admin: Arc<AdminService>,
    /// Store/gateway/clock bundle shared with the worker iteration bodies
    pub ctx: Arc<WorkerContext>,
}

impl AppState {
    pub fn build(
        config: Config,
        store: Arc<dyn SandboxStore>,
        csp: Arc<dyn CspApi>,
        clock: Arc<dyn Clock>,
    ) -> web::Data<AppState> {
        let config = Arc::new(config);
        let gateway = Arc::new(CspGateway::new(csp, &config.breaker));
        let engine = Arc::new(AllocationEngine::new(
            store.clone(),
            clock.clone(),
            config.lifecycle.k_candidates,
            config.lifecycle.lab_duration_hours,
        ));
        let stats = StatsService::new(store.clone(), STATS_CACHE_TTL);
        let admin = Arc::new(AdminService::new(store.clone()));
        let ctx = Arc::new(WorkerContext {
            store,
            gateway,
            clock,
            config: config.clone(),
        });

        web::Data::new(AppState {
            config,
            engine,
            stats,
            admin,
            ctx,
        })
    }
}

/// Route table: probes unprefixed, consumer and admin scopes under the
/// configured version prefix, each behind its own bearer token
pub fn configure_routes(state: web::Data<AppState>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        let prefix = state.config.app.api_prefix.clone();
        let consumer_auth = BearerAuth::new(state.config.auth.api_token.clone());
        let admin_auth = BearerAuth::new(state.config.auth.admin_token.clone());

        cfg.app_data(state.clone())
            .route("/healthz", web::get().to(handlers::health::healthz))
            .route("/readyz", web::get().to(handlers::health::readyz))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .service(
                web::scope(prefix.trim_end_matches('/'))
                    .service(
                        web::scope("/admin")
                            .wrap(admin_auth)
                            .route("/sandboxes", web::get().to(handlers::admin::list_sandboxes))
                            .route("/stats", web::get().to(handlers::admin::stats))
                            .route("/sync", web::post().to(handlers::admin::trigger_sync))
                            .route("/cleanup", web::post().to(handlers::admin::trigger_cleanup))
                            .route(
                                "/bulk-delete",
                                web::post().to(handlers::admin::bulk_delete),
                            )
                            .route("/auto-expire", web::post().to(handlers::admin::auto_expire))
                            .route(
                                "/auto-delete-stale",
                                web::post().to(handlers::admin::auto_delete_stale),
                            ),
                    )
                    .service(
                        web::scope("")
                            .wrap(consumer_auth)
                            .route("/allocate", web::post().to(handlers::sandboxes::allocate))
                            .route(
                                "/sandboxes/{sandbox_id}/mark-for-deletion",
                                web::post().to(handlers::sandboxes::mark_for_deletion),
                            )
                            .route(
                                "/sandboxes/{sandbox_id}",
                                web::get().to(handlers::sandboxes::get_sandbox),
                            ),
                    ),
            );
    }
}

/// Tracing setup shared by both binaries. `LOG_FORMAT=json` emits one JSON
/// object per line; `RUST_LOG` overrides the configured level when set.
pub fn init_tracing(cfg: &config::LogConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);

    if cfg.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// CORS allowlist; `*` is accepted for development only. Both identity
/// headers plus the analytics and prefix headers must be permitted, and
/// `Retry-After` must be readable by browser clients.
pub fn build_cors(cfg: &CorsConfig) -> Cors {
    let mut cors = Cors::default();
    for origin in cfg.allowed_origins.split(',') {
        let origin = origin.trim();
        if origin == "*" {
            cors = cors.allow_any_origin();
        } else if !origin.is_empty() {
            cors = cors.allowed_origin(origin);
        }
    }
    cors.allowed_methods(vec!["GET", "POST"])
        .allowed_headers(vec![
            "Authorization",
            "Content-Type",
            HEADER_SANDBOX_ID,
            HEADER_TRACK_ID,
            HEADER_TRACK_NAME,
            HEADER_NAME_PREFIX,
        ])
        .expose_headers(vec![
            "Retry-After",
            "X-Request-ID",
            "X-RateLimit-Limit",
            "X-RateLimit-Remaining",
            "X-RateLimit-Reset",
        ])
        .max_age(3600)
}
