//! HTTP layer.
//!
//! This module provides the axum router that:
//! - Accepts authenticated send requests
//! - Receives delivery webhooks from the test and signed providers
//! - Serves stored message records back to authenticated callers
//! - Lists, searches and aggregates a company's messages for user sessions

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod handlers;
pub mod user_auth;

pub use handlers::{
    get_message, health, mandrill_webhook, mandrill_webhook_check, send, test_webhook,
    user_aggregation, user_messages, AggregationResponse, ApiError, AppState, ErrorResponse,
    HealthResponse, WebhookResponse,
};
pub use user_auth::{issue_user_token, verify_user_token, UserSession, ALL_COMPANIES};

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/send/", post(send))
        .route("/webhook/test/", post(test_webhook))
        .route(
            "/webhook/mandrill/",
            post(mandrill_webhook).head(mandrill_webhook_check),
        )
        .route("/messages/:method/:id", get(get_message))
        .route("/user/:method/", get(user_messages))
        .route("/user/:method/aggregation/", get(user_aggregation))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
