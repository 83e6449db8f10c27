//! HTTP error responses
//!
//! Every failure leaves the API as `{"error": "..."}` with a status code.
//! Storage and other internal failures are logged and reported with a
//! generic message.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use toolpulse_analytics_core::AnalyticsError;
use tracing::error;

use crate::token_pool::ProxyError;

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    /// Log `detail` and answer with a generic 500
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        error!(error = %detail, "Internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<AnalyticsError> for ApiError {
    fn from(e: AnalyticsError) -> Self {
        match e {
            AnalyticsError::ValidationError(msg) => Self::bad_request(msg),
            AnalyticsError::NotFound(msg) => Self::not_found(msg),
            AnalyticsError::Upstream(msg) => {
                error!(error = %msg, "Upstream failure");
                Self::new(StatusCode::BAD_GATEWAY, "Upstream request failed")
            }
            other => Self::internal(other),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::NoToken => Self::service_unavailable(e.to_string()),
            ProxyError::Exhausted { .. } => Self::new(StatusCode::BAD_GATEWAY, e.to_string()),
            ProxyError::Analytics(inner) => inner.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AnalyticsError::ValidationError("x".into()), StatusCode::BAD_REQUEST),
            (AnalyticsError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AnalyticsError::Upstream("x".into()), StatusCode::BAD_GATEWAY),
            (AnalyticsError::Other("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }

        assert_eq!(ApiError::from(ProxyError::NoToken).status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::from(ProxyError::Exhausted { attempts: 3 }).status,
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_internal_hides_detail() {
        let err = ApiError::from(AnalyticsError::Other("disk I/O error at /var/db".into()));
        assert_eq!(err.message, "Internal server error");
    }
}
