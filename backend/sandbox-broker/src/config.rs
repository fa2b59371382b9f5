/// Configuration management for the sandbox broker
///
/// Both binaries load the same `Config` from environment variables; every
/// variable has a default so a bare `cargo run` comes up in local mock mode.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub csp: CspConfig,
    pub lifecycle: LifecycleConfig,
    pub worker: WorkerConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub cors: CorsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server host to bind to
    pub host: String,
    /// Server port to bind to
    pub port: u16,
    /// API version path segment, e.g. `/v1`
    pub api_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token for consumer endpoints (allocate/release/read)
    pub api_token: String,
    /// Bearer token for everything under /admin
    pub admin_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub table_name: String,
    /// Status index (partition `status`, sort `allocated_at`)
    pub gsi1_name: String,
    /// Owner index (partition `allocated_to_sandbox_id`, sort `allocated_at`)
    pub gsi2_name: String,
    /// Idempotency index (partition `idempotency_key`, sort `allocated_at`)
    pub gsi3_name: String,
    /// Local-dev endpoint override (e.g. dynamodb-local)
    pub endpoint_url: Option<String>,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CspConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout_connect_sec: u64,
    pub timeout_read_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Maximum hold per allocation, in hours
    pub lab_duration_hours: i64,
    /// Extra slack before auto-expiry reclaims an unreleased hold
    pub grace_period_minutes: i64,
    /// Claim fan-out width
    pub k_candidates: usize,
    /// Failed destroys before a record parks in deletion_failed
    pub deletion_retry_max_attempts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub sync_interval_sec: u64,
    pub cleanup_interval_sec: u64,
    pub auto_expiry_interval_sec: u64,
    pub stale_delete_interval_sec: u64,
    /// Grace window before stale records are purged, in hours
    pub stale_grace_hours: i64,
    pub cleanup_batch_size: usize,
    pub cleanup_batch_delay_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Comma-separated list of allowed origins, or `*` (dev only)
    pub allowed_origins: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    /// `json` or `text`
    pub format: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        let config = Config {
            app: AppConfig {
                host: env_or("BROKER_HOST", "0.0.0.0"),
                port: env_parse("BROKER_PORT", 8080),
                api_prefix: env_or("BROKER_API_PREFIX", "/v1"),
            },
            auth: AuthConfig {
                api_token: env_or("BROKER_API_TOKEN", "dev-api-token"),
                admin_token: env_or("BROKER_ADMIN_TOKEN", "dev-admin-token"),
            },
            store: StoreConfig {
                table_name: env_or("DDB_TABLE_NAME", "sandbox-broker-pool"),
                gsi1_name: env_or("DDB_GSI1_NAME", "by_status"),
                gsi2_name: env_or("DDB_GSI2_NAME", "by_owner"),
                gsi3_name: env_or("DDB_GSI3_NAME", "by_idem"),
                endpoint_url: std::env::var("DDB_ENDPOINT_URL").ok(),
                region: env_or("AWS_REGION", "us-east-1"),
            },
            csp: CspConfig {
                base_url: env_or("CSP_BASE_URL", "https://csp.example.com/api/v2"),
                api_token: env_or("CSP_API_TOKEN", crate::csp::MOCK_TOKEN),
                timeout_connect_sec: env_parse("CSP_TIMEOUT_CONNECT_SEC", 2),
                timeout_read_sec: env_parse("CSP_TIMEOUT_READ_SEC", 5),
            },
            lifecycle: LifecycleConfig {
                lab_duration_hours: env_parse("LAB_DURATION_HOURS", 4),
                grace_period_minutes: env_parse("GRACE_PERIOD_MINUTES", 30),
                k_candidates: env_parse("K_CANDIDATES", 15),
                deletion_retry_max_attempts: env_parse("DELETION_RETRY_MAX_ATTEMPTS", 3),
            },
            worker: WorkerConfig {
                sync_interval_sec: env_parse("SYNC_INTERVAL_SEC", 600),
                cleanup_interval_sec: env_parse("CLEANUP_INTERVAL_SEC", 300),
                auto_expiry_interval_sec: env_parse("AUTO_EXPIRY_INTERVAL_SEC", 300),
                stale_delete_interval_sec: env_parse("STALE_DELETE_INTERVAL_SEC", 86400),
                stale_grace_hours: env_parse("STALE_GRACE_HOURS", 24),
                cleanup_batch_size: env_parse("CLEANUP_BATCH_SIZE", 10),
                cleanup_batch_delay_sec: env_parse("CLEANUP_BATCH_DELAY_SEC", 2),
            },
            rate_limit: RateLimitConfig {
                requests_per_second: env_parse("RATE_LIMIT_REQUESTS_PER_SECOND", 10.0),
                burst: env_parse("RATE_LIMIT_BURST", 20.0),
            },
            breaker: BreakerConfig {
                threshold: env_parse("CIRCUIT_BREAKER_THRESHOLD", 5),
                timeout_sec: env_parse("CIRCUIT_BREAKER_TIMEOUT_SEC", 60),
            },
            cors: CorsConfig {
                allowed_origins: env_or("CORS_ALLOWED_ORIGINS", "*"),
            },
            log: LogConfig {
                level: env_or("LOG_LEVEL", "info"),
                format: env_or("LOG_FORMAT", "json"),
            },
        };

        if config.lifecycle.k_candidates == 0 {
            return Err("K_CANDIDATES must be at least 1".to_string());
        }
        if config.rate_limit.requests_per_second <= 0.0 || config.rate_limit.burst < 1.0 {
            return Err("rate limit requires positive rate and burst >= 1".to_string());
        }

        Ok(config)
    }

    /// Hold window in seconds
    pub fn max_hold_seconds(&self) -> i64 {
        self.lifecycle.lab_duration_hours * 3600
    }

    /// Auto-expiry cutoff offset: hold window plus grace, in seconds
    pub fn expiry_window_seconds(&self) -> i64 {
        self.max_hold_seconds() + self.lifecycle.grace_period_minutes * 60
    }
}
