//! Error taxonomy for the adapter.
//!
//! Shape errors on either side of the translation are fatal to the single
//! request and reported in the Anthropic error envelope. Streaming chunk
//! errors are not represented here: they are recovered locally (chunk
//! dropped, stream continues) inside `crate::stream`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The client body is not a valid Messages API request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The upstream 2xx response does not have the expected shape.
    #[error("unexpected upstream response shape: {0}")]
    UpstreamShape(String),

    /// The upstream call itself failed (connect, timeout, body read).
    /// Non-2xx statuses are relayed verbatim and never reach this variant.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl BridgeError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamShape(_) | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "invalid_request_error",
            Self::UpstreamShape(_) | Self::Upstream(_) => "api_error",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "type": "error",
                "error": {
                    "type": self.error_type(),
                    "message": self.to_string()
                }
            })),
        )
            .into_response()
    }
}
