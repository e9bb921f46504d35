//! Error types for the aggregator API.
//!
//! [`ApiError`] unifies all failure modes into a single enum that can be
//! converted into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation. Every
//! error body has the shape `{"code": "...", "message": "..."}`, where
//! `code` is the stable [`ErrorKind`] string.

use aggregator_core::historian::HistorianError;
use aggregator_core::pipeline::PipelineError;
use aggregator_types::ErrorKind;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Errors that can occur in the API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A path or query parameter is missing or malformed.
    #[error("{0}")]
    Validation(String),

    /// The aggregation pipeline failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The in-process historian rejected a data point.
    #[error(transparent)]
    Historian(#[from] HistorianError),
}

impl ApiError {
    /// Machine-readable classification.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Pipeline(e) => e.kind(),
            Self::Historian(e) => e.kind(),
        }
    }

    /// HTTP status for this error.
    pub const fn status(&self) -> StatusCode {
        status_for(self.kind())
    }
}

/// Map an error kind to its HTTP status.
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError | ErrorKind::UnsupportedDeviceType => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound | ErrorKind::NoMatchingEntries => StatusCode::NOT_FOUND,
        ErrorKind::VersionConflict | ErrorKind::UnsupportedEntity | ErrorKind::AlreadyExists => {
            StatusCode::CONFLICT
        }
        ErrorKind::FatalUpstreamError | ErrorKind::NoAggregateProduced => StatusCode::BAD_GATEWAY,
        ErrorKind::TransientUpstreamError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self, "request failed");
        } else {
            tracing::debug!(status = %status, error = %self, "request rejected");
        }

        let body = ErrorBody {
            code: self.kind().as_str().to_owned(),
            message: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}
