//! The `/v1/messages` gateway.
//!
//! One handler: parse the Anthropic request, map it, make exactly one
//! upstream call, and hand the result back: transcoded SSE when the client
//! asked to stream, mapped JSON otherwise. Non-2xx upstream responses are
//! relayed verbatim (status, content-type, body) rather than masked.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::BridgeError;
use crate::schema::anthropic::MessagesRequest;
use crate::schema::openai::ChatResponse;
use crate::sse::stream_response;
use crate::transform::{map_request, map_response};

/// Shared application state threaded through Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/health", get(health))
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(not_found)
        .with_state(state)
}

pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return BridgeError::MalformedRequest(err.to_string()).into_response();
        }
    };
    if request.messages.is_empty() {
        return BridgeError::MalformedRequest("messages must not be empty".to_string())
            .into_response();
    }

    let model = request.model.clone();
    let streaming = request.stream.unwrap_or(false);
    info!(model = %model, streaming, "incoming /v1/messages request");

    let upstream_request = map_request(request);

    let Some(api_key) = bearer_token(&headers)
        .or_else(|| state.config.fallback_api_key().map(str::to_string))
    else {
        return BridgeError::MalformedRequest(
            "missing credentials: supply x-api-key or Authorization".to_string(),
        )
        .into_response();
    };

    let resp = match state
        .config
        .http_client()
        .post(state.config.chat_completions_url())
        .bearer_auth(api_key)
        .json(&upstream_request)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => return BridgeError::from(err).into_response(),
    };

    if !resp.status().is_success() {
        return relay_upstream_error(resp).await;
    }

    if streaming {
        stream_response(resp, model, state.config.sse_buffer_size())
    } else {
        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(err) => return BridgeError::from(err).into_response(),
        };
        let upstream: ChatResponse = match serde_json::from_slice(&body) {
            Ok(upstream) => upstream,
            Err(err) => return BridgeError::UpstreamShape(err.to_string()).into_response(),
        };
        match map_response(upstream, &model) {
            Ok(response) => Json(response).into_response(),
            Err(err) => err.into_response(),
        }
    }
}

/// Client credential: `x-api-key` or a bearer Authorization header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).to_string())
        .filter(|v| !v.is_empty())
}

/// Pass an upstream failure through unchanged so the caller sees the real
/// status and body.
async fn relay_upstream_error(resp: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json; charset=utf-8")
        .to_string();
    let body = match resp.bytes().await {
        Ok(body) => body,
        Err(err) => {
            warn!(error = %err, "failed reading upstream error body");
            Bytes::new()
        }
    };

    (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

async fn health() -> &'static str {
    "ok"
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not Found",
            "message": "Use POST /v1/messages with Anthropic-compatible request JSON."
        })),
    )
        .into_response()
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({
            "error": "Method Not Allowed",
            "message": "This endpoint only supports POST /v1/messages. Use OPTIONS for CORS preflight."
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_token_prefers_x_api_key() {
        let mut headers = headers_with("x-api-key", "sk-key");
        headers.insert(header::AUTHORIZATION, "Bearer other".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("sk-key".to_string()));
    }

    #[test]
    fn bearer_token_strips_bearer_prefix() {
        let headers = headers_with("authorization", "Bearer sk-bearer");
        assert_eq!(bearer_token(&headers), Some("sk-bearer".to_string()));
    }

    #[test]
    fn bearer_token_absent() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
