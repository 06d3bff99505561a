use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::path::PathBuf;

use crate::retry::Retryable;

// Failures while loading limit overrides
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    #[error("failed to read limits file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid limits file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of a failed forwarded call.
///
/// `Clone` because every caller coalesced onto one in-flight call gets
/// its own copy of the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport failure: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => UpstreamError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => UpstreamError::Transport(err.to_string()),
        }
    }
}

impl Retryable for UpstreamError {
    fn is_transport_error(&self) -> bool {
        matches!(self, UpstreamError::Transport(_))
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            UpstreamError::Transport(_) => None,
        }
    }
}

// Errors surfaced by the gateway's HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Rate limit exceeded. Try again later.")]
    RateLimited,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(UpstreamError::Transport(_)) => StatusCode::BAD_GATEWAY,
            GatewayError::Upstream(UpstreamError::Status { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
