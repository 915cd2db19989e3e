//! Message types shared by the send path and the webhook path.
//!
//! This module defines:
//! - the send request accepted by the dispatch endpoint
//! - the persisted message record and its event timeline
//! - delivery methods and statuses

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::render::Context;

/// Minimum length of a send group uid.
pub const UID_MIN_LEN: usize = 20;

/// Maximum length of a send group uid.
pub const UID_MAX_LEN: usize = 40;

/// Built-in layout used when a request supplies no main template.
pub const DEFAULT_MAIN_TEMPLATE: &str = include_str!("../../templates/default-email.mustache");

// =============================================================================
// Methods and statuses
// =============================================================================

/// How a message is delivered. Records are namespaced by method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendMethod {
    #[serde(rename = "email-mandrill")]
    EmailMandrill,
    #[serde(rename = "email-ses")]
    EmailSes,
    #[serde(rename = "email-test")]
    EmailTest,
    #[serde(rename = "sms-messagebird")]
    SmsMessagebird,
    #[serde(rename = "sms-test")]
    SmsTest,
}

impl SendMethod {
    pub const ALL: [SendMethod; 5] = [
        SendMethod::EmailMandrill,
        SendMethod::EmailSes,
        SendMethod::EmailTest,
        SendMethod::SmsMessagebird,
        SendMethod::SmsTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SendMethod::EmailMandrill => "email-mandrill",
            SendMethod::EmailSes => "email-ses",
            SendMethod::EmailTest => "email-test",
            SendMethod::SmsMessagebird => "sms-messagebird",
            SendMethod::SmsTest => "sms-test",
        }
    }

    /// Whether this service can dispatch messages with the method.
    pub fn is_supported(&self) -> bool {
        matches!(self, SendMethod::EmailMandrill | SendMethod::EmailTest)
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for SendMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status, named after the provider's webhook event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Send,
    Deferral,
    HardBounce,
    SoftBounce,
    Open,
    Click,
    Spam,
    Unsub,
    Reject,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 9] = [
        MessageStatus::Send,
        MessageStatus::Deferral,
        MessageStatus::HardBounce,
        MessageStatus::SoftBounce,
        MessageStatus::Open,
        MessageStatus::Click,
        MessageStatus::Spam,
        MessageStatus::Unsub,
        MessageStatus::Reject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Send => "send",
            MessageStatus::Deferral => "deferral",
            MessageStatus::HardBounce => "hard_bounce",
            MessageStatus::SoftBounce => "soft_bounce",
            MessageStatus::Open => "open",
            MessageStatus::Click => "click",
            MessageStatus::Spam => "spam",
            MessageStatus::Unsub => "unsub",
            MessageStatus::Reject => "reject",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Send request
// =============================================================================

/// A send request: one template, shared context, many recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    /// Send group id, 20-40 characters, unique per group
    pub uid: String,
    #[serde(default = "default_main_template")]
    pub main_template: String,
    #[serde(default)]
    pub mustache_partials: HashMap<String, String>,
    /// Macro signature → body
    #[serde(default)]
    pub macros: HashMap<String, String>,
    pub subject_template: String,
    pub company_code: String,
    /// `"Name <address>"` or a bare address
    pub from_address: String,
    pub method: SendMethod,
    #[serde(default)]
    pub subaccount: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub recipients: Vec<Recipient>,
}

fn default_main_template() -> String {
    DEFAULT_MAIN_TEMPLATE.to_string()
}

/// A single recipient with its context and header overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

// =============================================================================
// Persisted record
// =============================================================================

/// Characters allowed in a record id.
pub fn is_message_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// Whether `id` has the shape of a record id.
pub fn is_valid_message_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(is_message_id_char)
}

/// Store key: records are unique within a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub method: SendMethod,
    pub id: String,
}

impl MessageKey {
    pub fn new(method: SendMethod, id: impl Into<String>) -> Self {
        Self {
            method,
            id: id.into(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.method, self.id)
    }
}

/// One entry in a message's event timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Event time in milliseconds
    pub ts: i64,
    pub status: MessageStatus,
    /// Raw provider payload
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// The persisted document for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub company: String,
    pub method: SendMethod,
    pub group_id: String,
    #[serde(default)]
    pub to_first_name: Option<String>,
    #[serde(default)]
    pub to_last_name: Option<String>,
    pub to_email: String,
    pub from_email: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subaccount: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub status: MessageStatus,
    /// Creation time in milliseconds, never changed
    pub send_ts: i64,
    /// Last mutation time in milliseconds, never decreases
    pub update_ts: i64,
    #[serde(default)]
    pub events: Vec<MessageEvent>,
}

impl MessageRecord {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.method, self.id.clone())
    }

    /// Append an event and advance the status and update time.
    ///
    /// The event list only grows; `update_ts` only moves forward, so an event
    /// delivered late never rewinds it.
    pub fn apply_event(&mut self, event: MessageEvent) {
        self.status = event.status;
        self.update_ts = self.update_ts.max(event.ts);
        self.events.push(event);
    }
}
