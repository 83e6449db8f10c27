//! HTTP surface
//!
//! Route groups:
//! - tracking (`/api/track*`): an actor fingerprint is attached by middleware
//! - reads (`/api/stats/*`, `/api/tools*`): cacheable for five minutes
//! - token consumer (`/api/token/*`): `TOOLPULSE_API_SECRET` bearer
//! - admin (`/api/admin/*`): `TOOLPULSE_ADMIN_SECRET` bearer
//! - GitHub proxy (`/api/github/*`): forwarded through the token pool
//!
//! Every response carries an `x-request-id`.

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ConnectInfo, Path, Query, RawQuery, Request, State,
    },
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use toolpulse_analytics_core::days::{now_ts, parse_date, today};
use toolpulse_analytics_core::validation::{validate_days, validate_horizon_days};
use toolpulse_analytics_core::{DownloadEvent, ToolMetadata, ToolVersion};
use toolpulse_analytics_storage::{AnalyticsBackend, LocalSqliteBackend};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::auth;
use crate::compaction::{compact_older_than, CompactionSummary};
use crate::config::ServiceConfig;
use crate::error::ApiError;
use crate::events::EventStore;
use crate::fingerprint::{actor_fingerprint, client_ip, Actor};
use crate::github::{validate_proxy_path, UpstreamApi};
use crate::growth::{self, GrowthMetrics, ToolGrowth, TrendingTool, VersionTrends};
use crate::metadata::{self, BackendBackfillSummary, BackendFinalizeSummary};
use crate::rollups::{backfill_rollups, populate_mau_for_date, populate_rollups_for_date, BackfillSummary};
use crate::stats::{self, ActiveUsers, BackendUsage, MonthlyPoint, ToolStats, TopTool};
use crate::telemetry::{TelemetryEmitter, TelemetryEvent};
use crate::token_pool::{self, PoolHealth, TokenPool, TokenTestResult};

/// Default window for windowed stats endpoints
pub const DEFAULT_STATS_DAYS: i64 = 30;

/// Default and maximum list sizes
pub const DEFAULT_LIST_LIMIT: usize = 10;
pub const MAX_LIST_LIMIT: usize = 100;

/// Default number of catalog versions returned per tool
pub const DEFAULT_VERSION_LIMIT: usize = 50;

const READ_CACHE_CONTROL: &str = "public, max-age=300";

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<LocalSqliteBackend>,
    pub config: Arc<ServiceConfig>,
    pub upstream: Arc<dyn UpstreamApi>,
    pub tokens: TokenPool<LocalSqliteBackend>,
    pub telemetry: TelemetryEmitter,
}

impl AppState {
    pub fn new(
        backend: Arc<LocalSqliteBackend>,
        config: ServiceConfig,
        upstream: Arc<dyn UpstreamApi>,
        telemetry: TelemetryEmitter,
    ) -> Self {
        Self {
            tokens: TokenPool::new(Arc::clone(&backend)),
            backend,
            config: Arc::new(config),
            upstream,
            telemetry,
        }
    }

    /// Run synchronous storage work on the blocking pool with a fresh connection
    async fn db<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> toolpulse_analytics_core::Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            let conn = backend.get_connection()?;
            f(&conn)
        })
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let tracking = Router::new()
        .route("/api/track", post(track_download))
        .route("/api/track/version-request", post(track_version_request))
        .route_layer(middleware::from_fn_with_state(state.clone(), attach_actor));

    let reads = Router::new()
        .route("/api/stats/tools/{tool}", get(get_tool_stats))
        .route("/api/stats/tools/{tool}/monthly", get(get_tool_monthly))
        .route("/api/stats/tools/{tool}/growth", get(get_tool_growth))
        .route("/api/stats/tools/{tool}/versions", get(get_version_trends))
        .route("/api/stats/top", get(get_top_tools))
        .route("/api/stats/downloads-30d", get(get_downloads_30d))
        .route("/api/stats/active-users", get(get_active_users))
        .route("/api/stats/growth", get(get_growth))
        .route("/api/stats/trending", get(get_trending))
        .route("/api/stats/backends", get(get_backend_stats))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/{tool}", get(get_tool))
        .route("/api/tools/{tool}/versions", get(get_tool_versions))
        .route_layer(middleware::from_fn(cache_control));

    let token_consumer = Router::new()
        .route("/api/token/next", get(next_token))
        .route("/api/token/rate-limited", post(report_rate_limited))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api));

    let admin = Router::new()
        .route("/api/admin/compact", post(admin_compact))
        .route("/api/admin/backfill", post(admin_backfill))
        .route("/api/admin/rollup", post(admin_rollup))
        .route("/api/admin/tools/sync", post(admin_sync_tools))
        .route("/api/admin/tools/{tool}/versions/sync", post(admin_sync_versions))
        .route(
            "/api/admin/migrations/backend-ids/backfill",
            post(admin_backfill_backend_ids),
        )
        .route(
            "/api/admin/migrations/backend-ids/finalize",
            post(admin_finalize_backend_ids),
        )
        .route("/api/admin/tokens", post(admin_register_token))
        .route("/api/admin/tokens/health", get(admin_token_health))
        .route("/api/admin/tokens/test", post(admin_test_tokens))
        .route("/api/admin/tokens/delete", post(admin_delete_tokens))
        .route("/api/admin/tokens/{id}", delete(admin_delete_token))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/github/{*path}", get(github_proxy))
        .merge(tracking)
        .merge(reads)
        .merge(token_consumer)
        .merge(admin);

    #[cfg(feature = "metrics")]
    let app = app
        .route("/metrics", get(crate::metrics::metrics_handler))
        .layer(middleware::from_fn(crate::metrics::track_metrics));

    app.layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Middleware
// =============================================================================

/// Tag every response with a request id, reusing the caller's when present
async fn request_id(req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn cache_control(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    if response.status().is_success() {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(READ_CACHE_CONTROL),
        );
    }
    response
}

/// Compute the caller's fingerprint and attach it as an [`Actor`] extension
async fn attach_actor(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ip = client_ip(req.headers(), peer, &state.config.trusted_proxies);
    let fingerprint = actor_fingerprint(&state.config.fingerprint_secret, &ip)?;
    req.extensions_mut().insert(Actor(fingerprint));
    Ok(next.run(req).await)
}

// =============================================================================
// Request parameters
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    pub days: Option<i64>,
    pub limit: Option<usize>,
}

fn days_param(days: Option<i64>) -> Result<i64, ApiError> {
    let days = days.unwrap_or(DEFAULT_STATS_DAYS);
    validate_days(days, "days")?;
    Ok(days)
}

fn limit_param(limit: Option<usize>, default: usize) -> Result<usize, ApiError> {
    match limit.unwrap_or(default) {
        n if (1..=MAX_LIST_LIMIT).contains(&n) => Ok(n),
        n => Err(ApiError::bad_request(format!(
            "limit must be between 1 and {}, got {}",
            MAX_LIST_LIMIT, n
        ))),
    }
}

// =============================================================================
// Tracking
// =============================================================================

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct TrackRequest {
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    /// Full backend identifier, e.g. "aqua:nodejs/node"
    pub full: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrackResponse {
    pub success: bool,
    pub deduplicated: bool,
}

async fn track_download(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    body: Result<Json<TrackRequest>, JsonRejection>,
) -> Result<Json<TrackResponse>, ApiError> {
    let Json(body) = body?;
    let event = DownloadEvent {
        tool: body.tool.unwrap_or_default(),
        version: body.version.unwrap_or_default(),
        actor: actor.0,
        os: body.os,
        arch: body.arch,
        backend: body.full,
    };

    let now = now_ts();
    let recorded = event.clone();
    let outcome = state
        .db(move |conn| EventStore::new(conn).record_download_at(&recorded, now))
        .await?;

    debug!(tool = %event.tool, version = %event.version, deduplicated = outcome.deduplicated, "Download tracked");
    #[cfg(feature = "metrics")]
    crate::metrics::record_download(outcome.deduplicated);

    state.telemetry.emit(TelemetryEvent::new(
        "download",
        now,
        json!({
            "tool": event.tool.trim(),
            "version": event.version.trim(),
            "os": event.os,
            "arch": event.arch,
            "backend": event.backend,
            "deduplicated": outcome.deduplicated,
        }),
    ));

    Ok(Json(TrackResponse {
        success: true,
        deduplicated: outcome.deduplicated,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct VersionRequestBody {
    tool: Option<String>,
}

/// Version-check ping; the body (`{"tool": ...}`) is optional
async fn track_version_request(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body: VersionRequestBody = if body.is_empty() {
        VersionRequestBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))?
    };

    state
        .db(move |conn| EventStore::new(conn).record_version_request(&actor.0, body.tool.as_deref()))
        .await?;
    Ok(Json(json!({ "success": true })))
}

// =============================================================================
// Stats reads
// =============================================================================

async fn get_tool_stats(
    State(state): State<AppState>,
    Path(tool): Path<String>,
) -> Result<Json<ToolStats>, ApiError> {
    let stats = state
        .db(move |conn| stats::tool_stats(conn, &tool, today()))
        .await?;
    Ok(Json(stats))
}

async fn get_tool_monthly(
    State(state): State<AppState>,
    Path(tool): Path<String>,
) -> Result<Json<Vec<MonthlyPoint>>, ApiError> {
    let points = state.db(move |conn| stats::tool_monthly(conn, &tool)).await?;
    Ok(Json(points))
}

async fn get_tool_growth(
    State(state): State<AppState>,
    Path(tool): Path<String>,
) -> Result<Json<ToolGrowth>, ApiError> {
    let growth = state
        .db(move |conn| growth::tool_growth(conn, &tool, today()))
        .await?;
    Ok(Json(growth))
}

async fn get_version_trends(
    State(state): State<AppState>,
    Path(tool): Path<String>,
    query: Result<Query<DaysQuery>, QueryRejection>,
) -> Result<Json<VersionTrends>, ApiError> {
    let Query(query) = query?;
    let days = days_param(query.days)?;
    let trends = state
        .db(move |conn| growth::version_trends(conn, &tool, days, today()))
        .await?;
    Ok(Json(trends))
}

async fn get_top_tools(
    State(state): State<AppState>,
    query: Result<Query<TopQuery>, QueryRejection>,
) -> Result<Json<Vec<TopTool>>, ApiError> {
    let Query(query) = query?;
    let days = days_param(query.days)?;
    let limit = limit_param(query.limit, DEFAULT_LIST_LIMIT)?;
    let top = state
        .db(move |conn| stats::top_tools(conn, days, limit, today()))
        .await?;
    Ok(Json(top))
}

async fn get_downloads_30d(
    State(state): State<AppState>,
) -> Result<Json<std::collections::BTreeMap<String, i64>>, ApiError> {
    let counts = state.db(|conn| stats::downloads_30d(conn, today())).await?;
    Ok(Json(counts))
}

async fn get_active_users(
    State(state): State<AppState>,
    query: Result<Query<DaysQuery>, QueryRejection>,
) -> Result<Json<ActiveUsers>, ApiError> {
    let Query(query) = query?;
    let days = days_param(query.days)?;
    let users = state
        .db(move |conn| stats::active_users(conn, days, today()))
        .await?;
    Ok(Json(users))
}

async fn get_growth(State(state): State<AppState>) -> Result<Json<GrowthMetrics>, ApiError> {
    let metrics = state.db(|conn| growth::growth_metrics(conn, today())).await?;
    Ok(Json(metrics))
}

async fn get_trending(
    State(state): State<AppState>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> Result<Json<Vec<TrendingTool>>, ApiError> {
    let Query(query) = query?;
    let limit = limit_param(query.limit, DEFAULT_LIST_LIMIT)?;
    let trending = state
        .db(move |conn| growth::trending_tools(conn, limit, today()))
        .await?;
    Ok(Json(trending))
}

async fn get_backend_stats(
    State(state): State<AppState>,
    query: Result<Query<DaysQuery>, QueryRejection>,
) -> Result<Json<Vec<BackendUsage>>, ApiError> {
    let Query(query) = query?;
    let days = days_param(query.days)?;
    let backends = state
        .db(move |conn| stats::backend_stats(conn, days, today()))
        .await?;
    Ok(Json(backends))
}

async fn list_tools(State(state): State<AppState>) -> Result<Json<Vec<ToolMetadata>>, ApiError> {
    let tools = state.db(metadata::list_tools).await?;
    Ok(Json(tools))
}

async fn get_tool(
    State(state): State<AppState>,
    Path(tool): Path<String>,
) -> Result<Json<ToolMetadata>, ApiError> {
    let meta = state
        .db(move |conn| metadata::get_tool_metadata(conn, &tool))
        .await?;
    Ok(Json(meta))
}

async fn get_tool_versions(
    State(state): State<AppState>,
    Path(tool): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> Result<Json<Vec<ToolVersion>>, ApiError> {
    let Query(query) = query?;
    let limit = limit_param(query.limit, DEFAULT_VERSION_LIMIT)?;
    let versions = state
        .db(move |conn| metadata::tool_versions(conn, &tool, limit))
        .await?;
    Ok(Json(versions))
}

// =============================================================================
// GitHub proxy
// =============================================================================

async fn github_proxy(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    validate_proxy_path(&path)?;
    let target = match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path,
    };

    let upstream = state
        .tokens
        .proxy_get(state.upstream.as_ref(), &target)
        .await?;

    let status = StatusCode::from_u16(upstream.status).map_err(ApiError::internal)?;
    let mut response = (status, upstream.body).into_response();
    let content_type = upstream
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    Ok(response)
}

// =============================================================================
// Token consumer
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct NextTokenQuery {
    pub min_remaining: Option<i64>,
}

/// Token handed to a consumer; the only response that carries the secret
#[derive(Debug, Serialize, Deserialize)]
pub struct NextTokenResponse {
    pub id: i64,
    pub token: String,
    pub user_id: String,
    pub usage_count: i64,
}

async fn next_token(
    State(state): State<AppState>,
    query: Result<Query<NextTokenQuery>, QueryRejection>,
) -> Result<Json<NextTokenResponse>, ApiError> {
    let Query(query) = query?;
    if matches!(query.min_remaining, Some(n) if n < 0) {
        return Err(ApiError::bad_request("min_remaining cannot be negative"));
    }

    let token = state
        .tokens
        .next_token(state.upstream.as_ref(), query.min_remaining)
        .await?
        .ok_or_else(|| ApiError::service_unavailable("No upstream token available"))?;

    Ok(Json(NextTokenResponse {
        id: token.id,
        token: token.token,
        user_id: token.user_id,
        usage_count: token.usage_count,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RateLimitedRequest {
    pub token_id: i64,
    /// Unix seconds
    pub reset_at: i64,
}

async fn report_rate_limited(
    State(state): State<AppState>,
    body: Result<Json<RateLimitedRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(RateLimitedRequest { token_id, reset_at }) = body?;
    let updated = state
        .db(move |conn| token_pool::mark_rate_limited(conn, token_id, reset_at))
        .await?;
    if !updated {
        return Err(ApiError::not_found(format!("Token {} not found", token_id)));
    }
    info!(token_id, reset_at, "Token reported rate limited");
    Ok(Json(json!({ "success": true })))
}

// =============================================================================
// Admin
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CompactQuery {
    pub horizon_days: Option<i64>,
}

async fn admin_compact(
    State(state): State<AppState>,
    query: Result<Query<CompactQuery>, QueryRejection>,
) -> Result<Json<CompactionSummary>, ApiError> {
    let Query(query) = query?;
    let horizon = query.horizon_days.unwrap_or(state.config.retention_days);
    validate_horizon_days(horizon, "horizon_days")?;
    let summary = state
        .db(move |conn| compact_older_than(conn, horizon, now_ts()))
        .await?;
    Ok(Json(summary))
}

async fn admin_backfill(
    State(state): State<AppState>,
    query: Result<Query<DaysQuery>, QueryRejection>,
) -> Result<Json<BackfillSummary>, ApiError> {
    let Query(query) = query?;
    let days = days_param(query.days)?;
    let summary = state
        .db(move |conn| backfill_rollups(conn, days, today()))
        .await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct RollupQuery {
    /// YYYY-MM-DD, defaults to today (UTC)
    pub date: Option<String>,
}

async fn admin_rollup(
    State(state): State<AppState>,
    query: Result<Query<RollupQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(query) = query?;
    let date = match query.date.as_deref() {
        Some(s) => parse_date(s)?,
        None => today(),
    };
    let (counts, mau) = state
        .db(move |conn| {
            let counts = populate_rollups_for_date(conn, date)?;
            let mau = populate_mau_for_date(conn, date)?;
            Ok((counts, mau))
        })
        .await?;
    Ok(Json(json!({
        "date": date.to_string(),
        "rollups": counts,
        "mau": mau,
    })))
}

async fn admin_sync_tools(
    State(state): State<AppState>,
    body: Result<Json<Vec<ToolMetadata>>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(entries) = body?;
    let synced = state
        .db(move |conn| metadata::sync_tool_metadata(conn, &entries))
        .await?;
    Ok(Json(json!({ "success": true, "synced": synced })))
}

async fn admin_sync_versions(
    State(state): State<AppState>,
    Path(tool): Path<String>,
    body: Result<Json<Vec<ToolVersion>>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(versions) = body?;
    let synced = state
        .db(move |conn| metadata::sync_tool_versions(conn, &tool, &versions))
        .await?;
    Ok(Json(json!({ "success": true, "synced": synced })))
}

async fn admin_backfill_backend_ids(
    State(state): State<AppState>,
) -> Result<Json<BackendBackfillSummary>, ApiError> {
    let summary = state.db(metadata::backfill_backend_ids).await?;
    Ok(Json(summary))
}

async fn admin_finalize_backend_ids(
    State(state): State<AppState>,
) -> Result<Json<BackendFinalizeSummary>, ApiError> {
    let summary = state.db(metadata::finalize_backend_migration).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct RegisterTokenRequest {
    pub user_id: String,
    pub token: String,
    /// Unix seconds
    pub expires_at: Option<i64>,
}

async fn admin_register_token(
    State(state): State<AppState>,
    body: Result<Json<RegisterTokenRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let Json(body) = body?;
    let id = state
        .db(move |conn| token_pool::insert_token(conn, &body.user_id, &body.token, body.expires_at, now_ts()))
        .await?;
    info!(token_id = id, "Token registered");
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn admin_token_health(State(state): State<AppState>) -> Result<Json<PoolHealth>, ApiError> {
    let health = state
        .db(|conn| token_pool::pool_health(conn, now_ts()))
        .await?;
    Ok(Json(health))
}

async fn admin_test_tokens(
    State(state): State<AppState>,
) -> Result<Json<Vec<TokenTestResult>>, ApiError> {
    let results = state.tokens.test_all_tokens(state.upstream.as_ref()).await?;
    Ok(Json(results))
}

async fn admin_delete_token(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state
        .db(move |conn| token_pool::delete_token(conn, id))
        .await?;
    if !deleted {
        return Err(ApiError::not_found(format!("Token {} not found", id)));
    }
    Ok(Json(json!({ "success": true, "deleted": 1 })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteTokensRequest {
    pub ids: Vec<i64>,
}

async fn admin_delete_tokens(
    State(state): State<AppState>,
    body: Result<Json<DeleteTokensRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = body?;
    if body.ids.is_empty() {
        return Err(ApiError::bad_request("ids cannot be empty"));
    }
    let deleted = state
        .db(move |conn| token_pool::delete_tokens(conn, &body.ids))
        .await?;
    Ok(Json(json!({ "success": true, "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_param() {
        assert_eq!(limit_param(None, 10).unwrap(), 10);
        assert_eq!(limit_param(Some(100), 10).unwrap(), 100);
        assert!(limit_param(Some(0), 10).is_err());
        assert!(limit_param(Some(101), 10).is_err());
    }

    #[test]
    fn test_days_param() {
        assert_eq!(days_param(None).unwrap(), DEFAULT_STATS_DAYS);
        assert_eq!(days_param(Some(7)).unwrap(), 7);
        assert!(days_param(Some(0)).is_err());
        assert!(days_param(Some(366)).is_err());
    }
}
