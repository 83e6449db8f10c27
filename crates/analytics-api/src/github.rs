//! Upstream GitHub API client
//!
//! The token pool talks to the upstream API through [`UpstreamApi`] so the
//! rotation logic can be exercised without a network. [`GitHubClient`] is
//! the production implementation on `reqwest`; every call is bounded by the
//! configured timeout.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use toolpulse_analytics_core::{AnalyticsError, Result};
use tracing::debug;

/// Quota state reported by the upstream API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: Option<i64>,
    pub remaining: i64,
    /// Unix seconds at which the quota resets
    pub reset: Option<i64>,
}

/// A proxied upstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub rate_limit: Option<RateLimit>,
}

/// Operations the token pool needs from the upstream API
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// `Ok(false)` when the upstream rejects the credential; `Err` for
    /// transport failures and unexpected statuses
    async fn validate_token(&self, token: &str) -> Result<bool>;

    /// Current quota of the credential
    async fn rate_limit(&self, token: &str) -> Result<RateLimit>;

    /// Authenticated GET of `path` (relative to the API root)
    async fn get(&self, token: &str, path: &str) -> Result<UpstreamResponse>;
}

/// Parse `x-ratelimit-*` headers; `None` without a remaining count
pub fn parse_rate_limit_headers(headers: &HeaderMap) -> Option<RateLimit> {
    let value = |name: &str| -> Option<i64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    };
    Some(RateLimit {
        limit: value("x-ratelimit-limit"),
        remaining: value("x-ratelimit-remaining")?,
        reset: value("x-ratelimit-reset"),
    })
}

/// Reject proxy paths that could escape the API root
pub fn validate_proxy_path(path: &str) -> Result<()> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(AnalyticsError::ValidationError("path is required".to_string()));
    }
    if trimmed.contains("..") || trimmed.contains("://") || trimmed.contains('\\') {
        return Err(AnalyticsError::ValidationError(format!(
            "invalid upstream path: {}",
            path
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    rate: RateLimitRate,
}

#[derive(Debug, Deserialize)]
struct RateLimitRate {
    limit: Option<i64>,
    remaining: i64,
    reset: Option<i64>,
}

/// `reqwest`-backed [`UpstreamApi`]
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
}

impl GitHubClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("toolpulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AnalyticsError::Upstream(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, token: &str, path: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(self.url(path))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| AnalyticsError::Upstream(format!("request to {} failed: {}", path, e)))?;

        debug!(path, status = response.status().as_u16(), "Upstream response");
        #[cfg(feature = "metrics")]
        crate::metrics::record_upstream_status(response.status().as_u16());

        Ok(response)
    }
}

#[async_trait]
impl UpstreamApi for GitHubClient {
    async fn validate_token(&self, token: &str) -> Result<bool> {
        let response = self.send(token, "/user").await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::UNAUTHORIZED => Ok(false),
            status => Err(AnalyticsError::Upstream(format!(
                "unexpected status validating token: {}",
                status
            ))),
        }
    }

    async fn rate_limit(&self, token: &str) -> Result<RateLimit> {
        let response = self.send(token, "/rate_limit").await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AnalyticsError::Upstream(format!(
                "unexpected status reading rate limit: {}",
                status
            )));
        }
        let body: RateLimitBody = response
            .json()
            .await
            .map_err(|e| AnalyticsError::Upstream(format!("invalid rate limit body: {}", e)))?;
        Ok(RateLimit {
            limit: body.rate.limit,
            remaining: body.rate.remaining,
            reset: body.rate.reset,
        })
    }

    async fn get(&self, token: &str, path: &str) -> Result<UpstreamResponse> {
        validate_proxy_path(path)?;
        let response = self.send(token, path).await?;
        let status = response.status().as_u16();
        let rate_limit = parse_rate_limit_headers(response.headers());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| AnalyticsError::Upstream(format!("failed to read body: {}", e)))?;
        Ok(UpstreamResponse {
            status,
            content_type,
            body,
            rate_limit,
        })
    }
}
