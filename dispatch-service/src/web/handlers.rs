//! HTTP endpoint handlers.
//!
//! Handlers only deal with transport concerns (authentication, body shape,
//! status codes) and hand everything else to the dispatcher or the tracker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Form, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use rand::Rng;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use anyhow::Context as _;
use chrono::Utc;

use super::user_auth::{verify_user_token, UserAuthError, UserSession};
use crate::dispatch::{DispatchConfig, Dispatcher, SendError, SendReport};
use crate::message::{is_valid_message_id, MessageKey, MessageRecord, SendMethod, SendRequest};
use crate::sink::{DeliveryError, MandrillSink, TestSink, WebhookRegistration};
use crate::store::{
    DayBucket, ElasticConfig, ElasticStore, MemoryStore, MessageFilter, MessagePage,
    MessageQuery, MessageStore, StoreError, MAX_PAGE_SIZE,
};
use crate::webhook::{
    is_signature_verification_enabled, BatchReport, Provider, SigningConfig, StatusTracker,
    WebhookError, EVENTS_FIELD, SIGNATURE_HEADER,
};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: Arc<StatusTracker>,
    /// Provider client used to register the signed webhook
    pub mandrill: Option<Arc<MandrillSink>>,
}

impl AppState {
    pub fn new(config: Config, dispatcher: Dispatcher, tracker: StatusTracker) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            tracker: Arc::new(tracker),
            mandrill: None,
        }
    }

    /// Wire the store, sinks and tracker described by `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn MessageStore> = match &config.elastic_url {
            Some(url) => Arc::new(
                ElasticStore::new(ElasticConfig {
                    url: url.clone(),
                    username: config.elastic_username.clone(),
                    password: config.elastic_password.clone(),
                    update_retries: config.store_update_retries,
                })
                .context("Invalid ELASTIC_URL")?,
            ),
            None => {
                warn!("message_store_in_memory");
                Arc::new(MemoryStore::new())
            }
        };

        let mut dispatcher = Dispatcher::new(
            store.clone(),
            DispatchConfig {
                group_ttl: Duration::from_secs(config.send_group_ttl_secs),
                content_key: config.content_key.clone(),
            },
        )
        .with_sink(
            SendMethod::EmailTest,
            Arc::new(TestSink::new(config.test_output.clone())),
        );

        let mut mandrill = None;
        if let Some(key) = &config.mandrill_key {
            let sink = Arc::new(
                MandrillSink::new(&config.mandrill_url, key.clone())
                    .context("Invalid MANDRILL_URL")?,
            );
            dispatcher = dispatcher.with_sink(SendMethod::EmailMandrill, sink.clone());
            mandrill = Some(sink);
        }

        let signing = config
            .webhook_auth_key
            .clone()
            .filter(|_| is_signature_verification_enabled(&config.webhook_auth_key))
            .map(|secret| SigningConfig {
                secret,
                url: config.signed_webhook_url.clone(),
            });
        let tracker = StatusTracker::new(store, signing);

        Ok(Self {
            mandrill,
            ..Self::new(config, dispatcher, tracker)
        })
    }

    /// Make sure the provider calls back to our signed webhook URL and adopt
    /// the key it signs with. Does nothing without a provider key.
    pub async fn register_mandrill_webhook(
        &self,
    ) -> Result<Option<WebhookRegistration>, DeliveryError> {
        let Some(mandrill) = &self.mandrill else {
            return Ok(None);
        };

        let url = &self.config.signed_webhook_url;
        let registration = mandrill.register_webhook(url).await?;
        self.tracker.set_signing(SigningConfig {
            secret: registration.auth_key.clone(),
            url: url.clone(),
        });

        Ok(Some(registration))
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
}

/// Everything a handler can fail with.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    UserAuth(UserAuthError),
    BadRequest(String),
    Send(SendError),
    Webhook(WebhookError),
    Store(StoreError),
}

impl From<SendError> for ApiError {
    fn from(e: SendError) -> Self {
        ApiError::Send(e)
    }
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        ApiError::Webhook(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

fn store_status(e: &StoreError) -> (StatusCode, &'static str) {
    match e {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        e if e.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "error"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "Invalid Authorization header".to_string(),
            ),
            ApiError::UserAuth(e @ UserAuthError::BadData) => {
                (StatusCode::BAD_REQUEST, "invalid", e.to_string())
            }
            ApiError::UserAuth(e) => (StatusCode::FORBIDDEN, "forbidden", e.to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "invalid", message),
            ApiError::Send(e @ SendError::Invalid(_)) => {
                (StatusCode::BAD_REQUEST, "invalid", e.to_string())
            }
            ApiError::Send(e @ SendError::DuplicateGroup(_)) => {
                (StatusCode::CONFLICT, "conflict", e.to_string())
            }
            ApiError::Webhook(e @ WebhookError::SignatureInvalid) => {
                (StatusCode::FORBIDDEN, "forbidden", e.to_string())
            }
            ApiError::Webhook(e @ WebhookError::InvalidPayload(_)) => {
                (StatusCode::BAD_REQUEST, "invalid", e.to_string())
            }
            ApiError::Webhook(e @ WebhookError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found", e.to_string())
            }
            ApiError::Webhook(WebhookError::Store(e)) | ApiError::Store(e) => {
                let (code, status) = store_status(&e);
                (code, status, e.to_string())
            }
        };

        if code.is_server_error() {
            error!(status_code = code.as_u16(), message = %message, "request_failed");
        }

        (code, Json(ErrorResponse { status, message })).into_response()
    }
}

/// Check the service `Authorization` header.
///
/// A failed check waits a random sub-second delay before answering.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok());

    if provided == Some(state.config.auth_key.as_str()) {
        return Ok(());
    }

    let delay_ms = random_delay().await;
    warn!(has_header = provided.is_some(), delay_ms = delay_ms, "auth_invalid");
    Err(ApiError::Unauthorized)
}

/// Sleep a random sub-second delay, returning its length.
async fn random_delay() -> u64 {
    let delay_ms = rand::thread_rng().gen_range(0..500);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    delay_ms
}

/// Check a user session token from the `Authorization` header.
///
/// Every token is refused when no user auth key is configured.
async fn authorize_user(state: &AppState, headers: &HeaderMap) -> Result<UserSession, ApiError> {
    let token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let result = match &state.config.user_auth_key {
        Some(key) => verify_user_token(key, token, Utc::now().timestamp_millis()),
        None => {
            warn!("user_auth_not_configured");
            Err(UserAuthError::InvalidToken)
        }
    };

    match result {
        Ok(session) => Ok(session),
        Err(UserAuthError::InvalidToken) => {
            let delay_ms = random_delay().await;
            warn!(has_header = !token.is_empty(), delay_ms = delay_ms, "user_auth_invalid");
            Err(ApiError::UserAuth(UserAuthError::InvalidToken))
        }
        Err(e) => {
            warn!(error = %e, "user_auth_rejected");
            Err(ApiError::UserAuth(e))
        }
    }
}

fn parse_method(method: &str) -> Result<SendMethod, ApiError> {
    SendMethod::parse(method)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown method \"{}\"", method)))
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
// Send
// =============================================================================

/// Send endpoint: compose, store and deliver one message per recipient.
///
/// Answers once every record is stored, so webhooks for these messages can
/// always find them.
pub async fn send(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SendReport>), ApiError> {
    authorize(&state, &headers).await?;
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    info!(
        group_id = %request.uid,
        method = %request.method,
        recipient_count = request.recipients.len(),
        "send_request_received"
    );

    let report = state.dispatcher.send(request).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

// =============================================================================
// Webhooks
// =============================================================================

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchReport>,
}

/// Generic test-provider webhook: one unsigned `{ts, event, _id, ...}` event.
pub async fn test_webhook(
    State(state): State<AppState>,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let Json(event) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    state.tracker.ingest_event(Provider::Test, event).await?;

    Ok(Json(WebhookResponse {
        status: "updated",
        batch: None,
    }))
}

/// Signed-provider webhook: a form with a single `mandrill_events` field.
pub async fn mandrill_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let Some(events) = form.get(EVENTS_FIELD) else {
        warn!("mandrill_webhook_missing_events");
        return Err(ApiError::BadRequest(format!(
            "\"{}\" not found in post data",
            EVENTS_FIELD
        )));
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    info!(
        events_length = events.len(),
        has_signature = !signature.is_empty(),
        "mandrill_webhook_received"
    );

    let report = state.tracker.ingest_signed_batch(events, signature).await?;

    Ok(Json(WebhookResponse {
        status: "updated",
        batch: Some(report),
    }))
}

/// The provider checks the callback URL with `HEAD` before registering it.
pub async fn mandrill_webhook_check() -> StatusCode {
    StatusCode::OK
}

// =============================================================================
// Readback
// =============================================================================

/// Return a stored message record.
pub async fn get_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((method, id)): Path<(String, String)>,
) -> Result<Json<MessageRecord>, ApiError> {
    authorize(&state, &headers).await?;

    let method = parse_method(&method)?;
    if !is_valid_message_id(&id) {
        return Err(ApiError::BadRequest(format!("invalid message id \"{}\"", id)));
    }

    let record = state
        .dispatcher
        .store()
        .get(&MessageKey::new(method, id))
        .await?;
    Ok(Json(record))
}

// =============================================================================
// User views
// =============================================================================

/// Read an integer query parameter.
fn int_param(params: &[(String, String)], name: &str, default: usize) -> Result<usize, ApiError> {
    match params.iter().find(|(k, _)| k == name) {
        Some((_, raw)) => raw
            .trim()
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid int value for \"{}\"", name))),
        None => Ok(default),
    }
}

/// Build the listing query from `message_id`, `q`, repeated `tags`, `from`
/// and `size`. The first present of `message_id`, `q` and `tags` decides the
/// filter.
fn user_query(session: &UserSession, params: &[(String, String)]) -> Result<MessageQuery, ApiError> {
    let first = |name: &str| {
        params
            .iter()
            .find(|(k, v)| k == name && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
    };
    let tags: Vec<String> = params
        .iter()
        .filter(|(k, v)| k == "tags" && !v.trim().is_empty())
        .map(|(_, v)| v.trim().to_string())
        .collect();

    let filter = if let Some(id) = first("message_id") {
        MessageFilter::Id(id)
    } else if let Some(text) = first("q") {
        MessageFilter::Text(text)
    } else if !tags.is_empty() {
        MessageFilter::Tags(tags)
    } else {
        MessageFilter::All
    };

    let mut query = MessageQuery::new(session.scope(), filter);
    query.from = int_param(params, "from", query.from)?;
    query.size = int_param(params, "size", query.size)?.min(MAX_PAGE_SIZE);
    Ok(query)
}

/// List, search or tag-filter the messages visible to a user session.
pub async fn user_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(method): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<MessagePage>, ApiError> {
    let session = authorize_user(&state, &headers).await?;
    let method = parse_method(&method)?;
    let query = user_query(&session, &params)?;

    let page = state.dispatcher.store().search(method, &query).await?;

    info!(
        company = %session.company,
        method = %method,
        filter = ?query.filter,
        total = page.total,
        "user_messages_listed"
    );
    Ok(Json(page))
}

/// Per-day send counts by current status.
#[derive(Debug, Serialize)]
pub struct AggregationResponse {
    pub days: Vec<DayBucket>,
}

/// Daily per-status aggregation of the messages visible to a user session.
pub async fn user_aggregation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(method): Path<String>,
) -> Result<Json<AggregationResponse>, ApiError> {
    let session = authorize_user(&state, &headers).await?;
    let method = parse_method(&method)?;

    let days = state
        .dispatcher
        .store()
        .histogram(method, &session.scope())
        .await?;

    info!(
        company = %session.company,
        method = %method,
        day_count = days.len(),
        "user_aggregation_built"
    );
    Ok(Json(AggregationResponse { days }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn session() -> UserSession {
        UserSession {
            company: "acme".to_string(),
            expires: i64::MAX,
        }
    }

    #[test]
    fn test_user_query_filters() {
        let query = user_query(&session(), &params(&[])).unwrap();
        assert_eq!(query.filter, MessageFilter::All);
        assert_eq!((query.from, query.size), (0, 10));

        let query = user_query(
            &session(),
            &params(&[("tags", "user:2"), ("q", "pear"), ("message_id", "abc")]),
        )
        .unwrap();
        assert_eq!(query.filter, MessageFilter::Id("abc".to_string()));

        let query = user_query(&session(), &params(&[("tags", "user:2"), ("q", "pear")])).unwrap();
        assert_eq!(query.filter, MessageFilter::Text("pear".to_string()));

        let query = user_query(
            &session(),
            &params(&[("tags", "trigger:other"), ("tags", "shoesize:8"), ("q", " ")]),
        )
        .unwrap();
        assert_eq!(
            query.filter,
            MessageFilter::Tags(vec!["trigger:other".to_string(), "shoesize:8".to_string()])
        );
    }

    #[test]
    fn test_user_query_paging() {
        let query = user_query(&session(), &params(&[("from", "20"), ("size", "5000")])).unwrap();
        assert_eq!(query.from, 20);
        assert_eq!(query.size, MAX_PAGE_SIZE);

        let result = user_query(&session(), &params(&[("size", "ten")]));
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_store_error_statuses() {
        let key = MessageKey::new(SendMethod::EmailTest, "abc");
        let status = |e: StoreError| ApiError::Store(e).into_response().status();

        assert_eq!(status(StoreError::NotFound(key.clone())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(StoreError::Conflict { key, attempts: 6 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(StoreError::Unavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let bad_json = serde_json::from_str::<JsonValue>("{").unwrap_err();
        assert_eq!(
            status(StoreError::Serialization(bad_json)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
