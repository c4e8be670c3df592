//! API error types with HTTP response mapping.

use archival::ArchivalError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use snapshot_store::SnapshotError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client.
    BadRequest(String),
    /// An archival operation failed.
    Archival(ArchivalError),
    /// The snapshot store failed.
    Snapshot(SnapshotError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Archival(err) => archival_error_to_response(err),
            ApiError::Snapshot(err) => {
                tracing::error!(error = %err, "snapshot store error");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn archival_error_to_response(err: ArchivalError) -> (StatusCode, String) {
    match &err {
        ArchivalError::Corrupted { .. } => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        ArchivalError::WarmBehind { .. } | ArchivalError::VersionCollision { .. } => {
            (StatusCode::CONFLICT, err.to_string())
        }
        ArchivalError::Compression(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        _ => {
            tracing::error!(error = %err, "archival error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<ArchivalError> for ApiError {
    fn from(err: ArchivalError) -> Self {
        ApiError::Archival(err)
    }
}

impl From<SnapshotError> for ApiError {
    fn from(err: SnapshotError) -> Self {
        ApiError::Snapshot(err)
    }
}
