//! HTTP endpoint handlers.
//!
//! The relay endpoint publishes a fixed request to the request queue and
//! answers with the next reply from the response queue, or a timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::inbox::{ReplyError, ReplyInbox};
use crate::broker::Transport;
use crate::queue::QueueClient;

/// Body published for every relay request.
pub const RELAY_MESSAGE: &str = "lalalalala";

/// Shared application state.
pub struct AppState<T: Transport> {
    pub requests: Arc<QueueClient<T>>,
    pub replies: Arc<ReplyInbox<T>>,
    pub reply_timeout: Duration,
}

impl<T: Transport> AppState<T> {
    pub fn new(requests: QueueClient<T>, responses: QueueClient<T>, reply_timeout: Duration) -> Self {
        Self {
            requests: Arc::new(requests),
            replies: Arc::new(ReplyInbox::new(Arc::new(responses))),
            reply_timeout,
        }
    }
}

impl<T: Transport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            replies: self.replies.clone(),
            reply_timeout: self.reply_timeout,
        }
    }
}

/// Build the application router.
pub fn router<T: Transport>(state: AppState<T>) -> Router {
    Router::new()
        .route("/", get(relay::<T>))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Relay
// =============================================================================

/// Relay response. `tag` is `success`, `timeout` or `error`.
#[derive(Debug, Serialize)]
pub struct RelayResponse {
    pub tag: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayResponse {
    fn success(data: Value) -> Self {
        Self {
            tag: "success",
            data: Some(data),
            error: None,
        }
    }

    fn failure(tag: &'static str, error: impl Into<String>) -> Self {
        Self {
            tag,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Relay endpoint.
///
/// This endpoint:
/// 1. Publishes the request message
/// 2. Waits for the next reply on the response queue
/// 3. Returns it, or 504 when none arrives in time
pub async fn relay<T: Transport>(State(state): State<AppState<T>>) -> impl IntoResponse {
    match state.requests.publish(RELAY_MESSAGE).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(queue = %state.requests.name(), "relay_publish_refused");
            return (
                StatusCode::BAD_GATEWAY,
                Json(RelayResponse::failure("error", "message was not accepted by the broker")),
            );
        }
        Err(e) => {
            error!(queue = %state.requests.name(), error = %e, "relay_publish_failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(RelayResponse::failure("error", e.to_string())),
            );
        }
    }

    match state.replies.next_reply(state.reply_timeout).await {
        Ok(data) => {
            info!(queue = %state.replies.queue().name(), "relay_reply_received");
            (StatusCode::OK, Json(RelayResponse::success(data)))
        }
        Err(e @ ReplyError::Timeout { .. }) => {
            warn!(queue = %state.replies.queue().name(), error = %e, "relay_reply_timeout");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(RelayResponse::failure("timeout", e.to_string())),
            )
        }
        Err(ReplyError::Queue(e)) => {
            error!(queue = %state.replies.queue().name(), error = %e, "relay_subscribe_failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(RelayResponse::failure("error", e.to_string())),
            )
        }
    }
}
