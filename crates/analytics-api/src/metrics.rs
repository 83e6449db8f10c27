//! Prometheus metrics for the Toolpulse API
//!
//! This module is only compiled when the `metrics` feature is enabled.
//!
//! - `http_requests_total` - Counter for total HTTP requests
//! - `http_request_duration_seconds` - Histogram for request latencies
//! - `toolpulse_downloads_tracked_total` - Tracked downloads, labelled by dedup outcome
//! - `toolpulse_jobs_total` - Rollup and compaction runs by outcome
//! - `toolpulse_token_selections_total` - Token pool selections by outcome
//! - `toolpulse_upstream_responses_total` - Upstream API responses by status

use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Counter for total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// Histogram for HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    pub static ref DOWNLOADS_TRACKED_TOTAL: CounterVec = register_counter_vec!(
        "toolpulse_downloads_tracked_total",
        "Download events received",
        &["deduplicated"]
    )
    .unwrap();

    pub static ref JOBS_TOTAL: CounterVec = register_counter_vec!(
        "toolpulse_jobs_total",
        "Background aggregation job runs",
        &["job", "outcome"]
    )
    .unwrap();

    /// "selected", "empty" or "exhausted"
    pub static ref TOKEN_SELECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "toolpulse_token_selections_total",
        "Token pool selection attempts",
        &["outcome"]
    )
    .unwrap();

    pub static ref UPSTREAM_RESPONSES_TOTAL: CounterVec = register_counter_vec!(
        "toolpulse_upstream_responses_total",
        "Responses received from the upstream API",
        &["status"]
    )
    .unwrap();
}

/// Axum middleware to track HTTP request metrics
pub async fn track_metrics(req: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let method = req.method().to_string();
    // Matched route template keeps label cardinality bounded
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(duration);

    response
}

/// Handler for the `/metrics` endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

pub fn record_download(deduplicated: bool) {
    DOWNLOADS_TRACKED_TOTAL
        .with_label_values(&[if deduplicated { "true" } else { "false" }])
        .inc();
}

/// Record a job run; `outcome` is "success" or "partial"
pub fn record_job(job: &str, outcome: &str) {
    JOBS_TOTAL.with_label_values(&[job, outcome]).inc();
}

pub fn record_token_selection(outcome: &str) {
    TOKEN_SELECTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_upstream_status(status: u16) {
    UPSTREAM_RESPONSES_TOTAL
        .with_label_values(&[&status.to_string()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = JOBS_TOTAL.with_label_values(&["rollup", "success"]).get();
        record_job("rollup", "success");
        assert_eq!(
            JOBS_TOTAL.with_label_values(&["rollup", "success"]).get(),
            before + 1.0
        );

        record_download(true);
        record_token_selection("selected");
        record_upstream_status(429);
        assert!(UPSTREAM_RESPONSES_TOTAL.with_label_values(&["429"]).get() >= 1.0);
    }
}
