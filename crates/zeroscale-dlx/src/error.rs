//! Request-scoped DLX errors and their HTTP mapping.

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use zeroscale_state::ScaleError;

/// Seconds a client is told to wait before retrying a 503.
pub const RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, Error)]
pub enum DlxError {
    #[error("missing header {0}")]
    MissingHeader(String),

    #[error("invalid header {header}: {reason}")]
    InvalidHeader { header: String, reason: String },

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("resource {resource} not ready within {timeout:?}")]
    ReadinessTimeout { resource: String, timeout: Duration },

    #[error("too many requests held for resource {0}")]
    Backpressure(String),

    #[error("resource {resource} failed to scale from zero: {reason}")]
    ActivationFailed { resource: String, reason: String },

    #[error("upstream {authority} unreachable: {reason}")]
    Upstream { authority: String, reason: String },

    #[error(transparent)]
    Scale(ScaleError),
}

impl DlxError {
    pub fn status(&self) -> StatusCode {
        match self {
            DlxError::MissingHeader(_) | DlxError::InvalidHeader { .. } => StatusCode::BAD_REQUEST,
            DlxError::UnknownResource(_) => StatusCode::NOT_FOUND,
            DlxError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DlxError::Backpressure(_) | DlxError::ActivationFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DlxError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            DlxError::Scale(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ScaleError> for DlxError {
    fn from(e: ScaleError) -> Self {
        match e {
            ScaleError::ReadinessTimeout { resource, timeout } => {
                DlxError::ReadinessTimeout { resource, timeout }
            }
            ScaleError::ActivationFailed { resource, reason } => {
                DlxError::ActivationFailed { resource, reason }
            }
            ScaleError::UnknownResource(name) => DlxError::UnknownResource(name),
            other => DlxError::Scale(other),
        }
    }
}

impl IntoResponse for DlxError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (
            status,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}
