//! Toolpulse API Server
//!
//! Download tracking, stats reads, the upstream token pool and admin jobs
//! over one SQLite database.

use std::net::SocketAddr;
use std::sync::Arc;
use toolpulse_analytics_api::github::GitHubClient;
use toolpulse_analytics_api::telemetry::TelemetryEmitter;
use toolpulse_analytics_api::{build_router, AppState, ServiceConfig};
use toolpulse_analytics_storage::{AnalyticsBackend, LocalSqliteBackend};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_env();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    tracing::info!(db_path = %config.db_path, "Using analytics database");

    let backend = LocalSqliteBackend::new(&config.db_path);
    if !backend.exists().unwrap_or(false) {
        tracing::warn!("Database does not exist, initializing");
        backend.initialize().expect("Failed to initialize database");
    }

    let upstream = GitHubClient::new(&config.github_api_url, config.upstream_timeout)
        .expect("Failed to build upstream client");
    let telemetry = TelemetryEmitter::spawn(config.telemetry_url.clone(), config.upstream_timeout);

    if config.admin_secret.is_none() {
        tracing::warn!("TOOLPULSE_ADMIN_SECRET not set, admin API disabled");
    }
    if config.api_secret.is_none() {
        tracing::warn!("TOOLPULSE_API_SECRET not set, token consumer API disabled");
    }

    let port = config.port;
    let state = AppState::new(Arc::new(backend), config, Arc::new(upstream), telemetry);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Toolpulse API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}
