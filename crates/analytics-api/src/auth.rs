//! Bearer credential checks
//!
//! `/api/admin/*` requires `TOOLPULSE_ADMIN_SECRET` and `/api/token/*`
//! requires `TOOLPULSE_API_SECRET`. A route group whose secret is unset
//! rejects every request.
//!
//! ```rust,ignore
//! let admin = Router::new()
//!     .route("/api/admin/compact", post(compact))
//!     .layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));
//! ```

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::app::AppState;
use crate::error::ApiError;

/// Extract the credential from `Authorization: Bearer <secret>`
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Comparison whose running time does not depend on where the inputs differ
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// True when the request carries `expected` as its bearer credential
pub fn is_authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    match (expected, bearer_token(headers)) {
        (Some(expected), Some(provided)) => constant_time_eq(expected.as_bytes(), provided.as_bytes()),
        _ => false,
    }
}

pub async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !is_authorized(req.headers(), state.config.admin_secret.as_deref()) {
        warn!(path = %req.uri().path(), "Rejected admin request");
        return Err(ApiError::unauthorized());
    }
    Ok(next.run(req).await)
}

pub async fn require_api(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !is_authorized(req.headers(), state.config.api_secret.as_deref()) {
        warn!(path = %req.uri().path(), "Rejected token consumer request");
        return Err(ApiError::unauthorized());
    }
    Ok(next.run(req).await)
}
