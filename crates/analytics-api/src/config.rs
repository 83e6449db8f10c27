//! Service configuration
//!
//! All settings come from environment variables:
//! - `TOOLPULSE_DB_PATH`: SQLite file (default: toolpulse.db)
//! - `PORT`: listen port (default: 8080)
//! - `TOOLPULSE_FINGERPRINT_SECRET`: HMAC key for actor fingerprints
//! - `TOOLPULSE_ADMIN_SECRET`: bearer credential for `/api/admin/*` (unset disables admin)
//! - `TOOLPULSE_API_SECRET`: bearer credential for `/api/token/*` (unset disables it)
//! - `TOOLPULSE_TRUSTED_PROXIES`: comma-separated proxy IPs whose forwarded headers are trusted
//! - `TOOLPULSE_GITHUB_API_URL`: upstream base URL (default: https://api.github.com)
//! - `TOOLPULSE_UPSTREAM_TIMEOUT_SECS`: timeout for every upstream call (default: 10)
//! - `TOOLPULSE_TELEMETRY_URL`: best-effort event forwarding endpoint (unset disables it)
//! - `TOOLPULSE_RETENTION_DAYS`: default compaction horizon (default: 90)

use std::time::Duration;
use toolpulse_analytics_core::validation::MAX_HORIZON_DAYS;

/// Default SQLite file
pub const DEFAULT_DB_PATH: &str = "toolpulse.db";

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Default upstream base URL
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

/// Default upstream timeout in seconds
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 10;

/// Default retention horizon for raw downloads
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Used when no fingerprint secret is configured; never appropriate in production
const DEV_FINGERPRINT_SECRET: &str = "toolpulse-dev-fingerprint-secret";

/// Runtime configuration for the API server and operator jobs
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: String,
    pub port: u16,
    pub fingerprint_secret: String,
    pub admin_secret: Option<String>,
    pub api_secret: Option<String>,
    pub trusted_proxies: Vec<String>,
    pub github_api_url: String,
    pub upstream_timeout: Duration,
    pub telemetry_url: Option<String>,
    pub retention_days: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            port: DEFAULT_PORT,
            fingerprint_secret: DEV_FINGERPRINT_SECRET.to_string(),
            admin_secret: None,
            api_secret: None,
            trusted_proxies: Vec::new(),
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            telemetry_url: None,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// Falls back to defaults for any unset variables.
    pub fn from_env() -> Self {
        let fingerprint_secret = match env_string("TOOLPULSE_FINGERPRINT_SECRET") {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    "TOOLPULSE_FINGERPRINT_SECRET not set, using development default"
                );
                DEV_FINGERPRINT_SECRET.to_string()
            }
        };

        Self {
            db_path: env_string("TOOLPULSE_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            port: env_parse("PORT", DEFAULT_PORT),
            fingerprint_secret,
            admin_secret: env_string("TOOLPULSE_ADMIN_SECRET"),
            api_secret: env_string("TOOLPULSE_API_SECRET"),
            trusted_proxies: env_string("TOOLPULSE_TRUSTED_PROXIES")
                .map(|s| {
                    s.split(',')
                        .map(|ip| ip.trim().to_string())
                        .filter(|ip| !ip.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            github_api_url: env_string("TOOLPULSE_GITHUB_API_URL")
                .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
            upstream_timeout: Duration::from_secs(env_parse(
                "TOOLPULSE_UPSTREAM_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )),
            telemetry_url: env_string("TOOLPULSE_TELEMETRY_URL"),
            retention_days: env_parse("TOOLPULSE_RETENTION_DAYS", DEFAULT_RETENTION_DAYS),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.upstream_timeout.is_zero() {
            return Err("upstream_timeout must be greater than 0".to_string());
        }
        if self.fingerprint_secret.is_empty() {
            return Err("fingerprint_secret cannot be empty".to_string());
        }
        if matches!(&self.admin_secret, Some(s) if s.is_empty()) {
            return Err("admin_secret cannot be empty when set".to_string());
        }
        if matches!(&self.api_secret, Some(s) if s.is_empty()) {
            return Err("api_secret cannot be empty when set".to_string());
        }
        if !(0..=MAX_HORIZON_DAYS).contains(&self.retention_days) {
            return Err(format!(
                "retention_days must be between 0 and {}",
                MAX_HORIZON_DAYS
            ));
        }
        Ok(())
    }

    /// Whether forwarded headers from `peer` should be trusted
    pub fn is_trusted_proxy(&self, peer: &str) -> bool {
        self.trusted_proxies.iter().any(|p| p == peer)
    }
}

/// Non-empty environment variable
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable with a default fallback.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
