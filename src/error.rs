//! Error types for Tusker
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Variants fall into the federation error classes: authentication
/// (`Signature`), validation (`Validation`, `UnknownActivityType`,
/// `UnknownObjectType`, `Forbidden`), resolution and transport
/// (`UnsupportedObjectType`, `RemoteStatus`, `Federation`, `HttpClient`),
/// and internal failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// HTTP signature missing, malformed or invalid (401)
    #[error("Invalid signature: {0}")]
    Signature(String),

    /// Activity type this engine does not interpret (400)
    #[error("Unknown activity type: {0}")]
    UnknownActivityType(String),

    /// Nested object type not valid for the activity (400)
    #[error("Unknown object type: {0}")]
    UnknownObjectType(String),

    /// Remote object resolved to the wrong kind (502)
    #[error("Unsupported object type: expected {expected}, found {found}")]
    UnsupportedObjectType { expected: &'static str, found: String },

    /// Remote server answered with a non-success status (502)
    #[error("Remote {uri} returned HTTP {status}")]
    RemoteStatus { uri: String, status: u16 },

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Remote object is gone or hidden from us (401/403/404/410)
    ///
    /// Reply parents in this state are dropped rather than failing the
    /// whole resolution.
    pub fn is_remote_gone(&self) -> bool {
        matches!(
            self,
            AppError::RemoteStatus {
                status: 401 | 403 | 404 | 410,
                ..
            }
        )
    }

    /// Short label used for the error metric
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::Signature(_) => "invalid_signature",
            AppError::UnknownActivityType(_) => "unknown_activity_type",
            AppError::UnknownObjectType(_) => "unknown_object_type",
            AppError::UnsupportedObjectType { .. } => "unsupported_object_type",
            AppError::RemoteStatus { .. } => "remote_status",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::Federation(_) => "federation",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::Signature(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::UnknownActivityType(_) | AppError::UnknownObjectType(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::UnsupportedObjectType { .. }
            | AppError::RemoteStatus { .. }
            | AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL
            .with_label_values(&[self.kind(), "http"])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_errors_map_to_unauthorized() {
        let response = AppError::Signature("missing header".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn unknown_activity_maps_to_bad_request() {
        let response = AppError::UnknownActivityType("Flag".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn gone_statuses_are_recognized() {
        for status in [401, 403, 404, 410] {
            let error = AppError::RemoteStatus {
                uri: "https://remote.example/notes/1".to_string(),
                status,
            };
            assert!(error.is_remote_gone());
        }

        let error = AppError::RemoteStatus {
            uri: "https://remote.example/notes/1".to_string(),
            status: 500,
        };
        assert!(!error.is_remote_gone());
    }
}
