//! Delivery status tracking.
//!
//! Provider events are parsed into [`ProviderEvent`]s, mapped to a stored
//! record and applied through a single store update: the event is appended,
//! the status moves to the event type and `update_ts` advances to the later
//! of its current value and the event time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::DateTime;
use futures::future::join_all;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, warn};

use super::signature::verify_webhook_signature;
use crate::message::{
    is_valid_message_id, MessageEvent, MessageKey, MessageRecord, MessageStatus, SendMethod,
};
use crate::sink::METADATA_MESSAGE_ID;
use crate::store::{MessageStore, StoreError};

/// Form field carrying the signed provider's event batch.
pub const EVENTS_FIELD: &str = "mandrill_events";

/// Numeric timestamps above this are taken to be milliseconds already.
const MILLIS_THRESHOLD: f64 = 2e10;

/// Fields that make up the event envelope rather than its payload.
const ENVELOPE_FIELDS: &[&str] = &["ts", "event", "_id"];

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid signature")]
    SignatureInvalid,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no message found for {0}")]
    NotFound(MessageKey),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for WebhookError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => WebhookError::NotFound(key),
            other => WebhookError::Store(other),
        }
    }
}

/// Which provider delivered an event; decides the record namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Unsigned events for `email-test` messages.
    Test,
    /// Signed batches for `email-mandrill` messages.
    Mandrill,
}

impl Provider {
    pub fn method(&self) -> SendMethod {
        match self {
            Provider::Test => SendMethod::EmailTest,
            Provider::Mandrill => SendMethod::EmailMandrill,
        }
    }
}

/// A validated provider event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    /// Id of the stored record this event refers to
    pub message_id: String,
    pub status: MessageStatus,
    /// Event time in milliseconds
    pub ts: i64,
    /// Everything in the payload besides the envelope fields
    pub extra: JsonValue,
}

impl ProviderEvent {
    /// Parse a raw `{ts, event, _id, ...}` payload.
    pub fn parse(provider: Provider, raw: JsonValue) -> Result<Self, WebhookError> {
        let JsonValue::Object(mut fields) = raw else {
            return Err(WebhookError::InvalidPayload("event must be an object".into()));
        };

        let ts = fields
            .get("ts")
            .and_then(normalize_ts)
            .ok_or_else(|| WebhookError::InvalidPayload("missing or invalid \"ts\"".into()))?;

        let status: MessageStatus = fields
            .get("event")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| WebhookError::InvalidPayload("missing or unknown \"event\"".into()))?;

        let message_id = resolve_message_id(provider, &fields)
            .ok_or_else(|| WebhookError::InvalidPayload("missing \"_id\"".into()))?;
        if !is_valid_message_id(&message_id) {
            return Err(WebhookError::InvalidPayload(format!(
                "invalid message id {:?}",
                message_id
            )));
        }

        for field in ENVELOPE_FIELDS {
            fields.remove(*field);
        }

        Ok(Self {
            message_id,
            status,
            ts,
            extra: JsonValue::Object(fields),
        })
    }

    fn into_event(self) -> MessageEvent {
        MessageEvent {
            ts: self.ts,
            status: self.status,
            extra: self.extra,
        }
    }
}

/// Map an event to our record id.
///
/// The signed provider reports its own `_id`; our id rides along in
/// `msg.metadata` when the message was sent through this service.
fn resolve_message_id(provider: Provider, fields: &Map<String, JsonValue>) -> Option<String> {
    if provider == Provider::Mandrill {
        let from_metadata = fields
            .get("msg")
            .and_then(|msg| msg.get("metadata"))
            .and_then(|meta| meta.get(METADATA_MESSAGE_ID))
            .and_then(JsonValue::as_str);
        if let Some(id) = from_metadata {
            return Some(id.to_string());
        }
    }

    fields
        .get("_id")
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Normalize a provider timestamp to milliseconds.
///
/// Accepts epoch seconds (the providers' convention, fractional allowed),
/// epoch milliseconds, numeric strings of either, and RFC 3339 strings.
pub fn normalize_ts(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_f64().and_then(epoch_to_millis),
        JsonValue::String(s) => match s.trim().parse::<f64>() {
            Ok(n) => epoch_to_millis(n),
            Err(_) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.timestamp_millis()),
        },
        _ => None,
    }
}

fn epoch_to_millis(n: f64) -> Option<i64> {
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    let millis = if n > MILLIS_THRESHOLD { n } else { n * 1000.0 };
    Some(millis.round() as i64)
}

/// Outcome of a signed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub applied: usize,
    /// Events naming a message we have no record of
    pub unknown: usize,
}

/// Signing settings for the signed provider.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub secret: String,
    /// Callback URL exactly as registered with the provider
    pub url: String,
}

pub struct StatusTracker {
    store: Arc<dyn MessageStore>,
    /// Replaced once the provider hands out a key for our callback
    signing: RwLock<Option<SigningConfig>>,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn MessageStore>, signing: Option<SigningConfig>) -> Self {
        Self {
            store,
            signing: RwLock::new(signing),
        }
    }

    pub fn set_signing(&self, signing: SigningConfig) {
        info!(url = %signing.url, "webhook_signing_configured");
        *self.signing.write().unwrap_or_else(|e| e.into_inner()) = Some(signing);
    }

    fn signing(&self) -> Option<SigningConfig> {
        self.signing.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply one parsed event to its record.
    pub async fn apply(
        &self,
        method: SendMethod,
        event: ProviderEvent,
    ) -> Result<MessageRecord, WebhookError> {
        let key = MessageKey::new(method, event.message_id.clone());
        let status = event.status;
        let ts = event.ts;
        let event = event.into_event();

        let record = self
            .store
            .update(&key, &move |record: &mut MessageRecord| {
                record.apply_event(event.clone())
            })
            .await?;

        info!(
            key = %key,
            status = %status,
            ts = ts,
            event_count = record.events.len(),
            "webhook_event_applied"
        );
        Ok(record)
    }

    /// Apply events for one message one after another, in the given order.
    async fn apply_in_order(
        &self,
        method: SendMethod,
        events: Vec<ProviderEvent>,
    ) -> Vec<Result<MessageRecord, WebhookError>> {
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            results.push(self.apply(method, event).await);
        }
        results
    }

    /// Ingest a single unsigned event.
    pub async fn ingest_event(
        &self,
        provider: Provider,
        raw: JsonValue,
    ) -> Result<MessageRecord, WebhookError> {
        let event = ProviderEvent::parse(provider, raw)?;
        self.apply(provider.method(), event).await.map_err(|e| {
            if let WebhookError::NotFound(key) = &e {
                warn!(key = %key, "webhook_unknown_message");
            }
            e
        })
    }

    /// Verify and ingest a signed provider batch.
    ///
    /// `raw_events` is the un-decoded form field value. A bad signature or an
    /// unparsable event rejects the whole batch before anything is applied.
    /// Events for unknown messages are counted, not fatal, since the provider
    /// would otherwise redeliver the batch indefinitely.
    ///
    /// Events for the same message are applied in batch order; distinct
    /// messages are updated concurrently.
    pub async fn ingest_signed_batch(
        &self,
        raw_events: &str,
        signature: &str,
    ) -> Result<BatchReport, WebhookError> {
        let Some(signing) = self.signing() else {
            warn!("webhook_signing_not_configured");
            return Err(WebhookError::SignatureInvalid);
        };

        if !verify_webhook_signature(
            &signing.secret,
            &signing.url,
            &[(EVENTS_FIELD, raw_events)],
            signature,
        ) {
            return Err(WebhookError::SignatureInvalid);
        }

        let raw: Vec<JsonValue> = serde_json::from_str(raw_events)
            .map_err(|e| WebhookError::InvalidPayload(format!("invalid json data: {}", e)))?;

        let events = raw
            .into_iter()
            .map(|event| ProviderEvent::parse(Provider::Mandrill, event))
            .collect::<Result<Vec<_>, _>>()?;

        let method = Provider::Mandrill.method();
        let mut report = BatchReport {
            received: events.len(),
            ..Default::default()
        };

        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<Vec<ProviderEvent>> = Vec::new();
        for event in events {
            let next = groups.len();
            let at = *positions.entry(event.message_id.clone()).or_insert(next);
            if at == next {
                groups.push(Vec::new());
            }
            groups[at].push(event);
        }

        let results = join_all(
            groups
                .into_iter()
                .map(|group| self.apply_in_order(method, group)),
        )
        .await;

        let mut store_error = None;
        for result in results.into_iter().flatten() {
            match result {
                Ok(_) => report.applied += 1,
                Err(WebhookError::NotFound(key)) => {
                    warn!(key = %key, "webhook_unknown_message");
                    report.unknown += 1;
                }
                Err(e) => {
                    error!(error = %e, "webhook_event_failed");
                    store_error.get_or_insert(e);
                }
            }
        }

        info!(
            received = report.received,
            applied = report.applied,
            unknown = report.unknown,
            "webhook_batch_ingested"
        );

        match store_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
