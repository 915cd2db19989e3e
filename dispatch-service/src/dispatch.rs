//! Send-group dispatch.
//!
//! The [`Dispatcher`] validates a send request, refuses a group uid it has
//! already seen within the TTL, composes every recipient concurrently, stores
//! each record and hands it to the sink for its method. A failure for one
//! recipient never affects the others; the returned [`SendReport`] lists the
//! outcome of each.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::compose::{Composer, Sender};
use crate::message::{Recipient, SendMethod, SendRequest, UID_MAX_LEN, UID_MIN_LEN};
use crate::sink::Sink;
use crate::store::MessageStore;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid send request: {0}")]
    Invalid(String),

    #[error("send group with id \"{0}\" already exists")]
    DuplicateGroup(String),
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a group uid blocks a repeat send
    pub group_ttl: Duration,
    /// Context key holding the content block
    pub content_key: String,
}

/// Outcome for a single recipient.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecipientOutcome {
    pub address: String,
    pub message_id: String,
    pub stored: bool,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecipientOutcome {
    pub fn is_success(&self) -> bool {
        self.stored && self.delivered
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendReport {
    pub group_id: String,
    pub method: SendMethod,
    pub recipients: Vec<RecipientOutcome>,
}

impl SendReport {
    pub fn failed(&self) -> usize {
        self.recipients.iter().filter(|r| !r.is_success()).count()
    }
}

pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    sinks: HashMap<SendMethod, Arc<dyn Sink>>,
    groups: DashMap<String, Instant>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn MessageStore>, config: DispatchConfig) -> Self {
        Self {
            store,
            sinks: HashMap::new(),
            groups: DashMap::new(),
            config,
        }
    }

    /// Register the sink used for `method`.
    pub fn with_sink(mut self, method: SendMethod, sink: Arc<dyn Sink>) -> Self {
        self.sinks.insert(method, sink);
        self
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Dispatch a send group. Returns once every record has been written.
    pub async fn send(&self, request: SendRequest) -> Result<SendReport, SendError> {
        let sender = validate(&request)?;
        let sink = self.sinks.get(&request.method).cloned().ok_or_else(|| {
            SendError::Invalid(format!("method {} is not configured", request.method))
        })?;

        self.claim_group(&request.uid)?;

        info!(
            group_id = %request.uid,
            method = %request.method,
            company = %request.company_code,
            recipient_count = request.recipients.len(),
            "send_group_accepted"
        );

        let composer = Composer::new(&request, sender, &self.config.content_key);
        let now_ms = Utc::now().timestamp_millis();

        let outcomes = join_all(
            request
                .recipients
                .iter()
                .map(|recipient| self.send_one(&composer, recipient, sink.as_ref(), now_ms)),
        )
        .await;

        let report = SendReport {
            group_id: request.uid.clone(),
            method: request.method,
            recipients: outcomes,
        };

        info!(
            group_id = %report.group_id,
            sent = report.recipients.len() - report.failed(),
            failed = report.failed(),
            "send_group_complete"
        );

        Ok(report)
    }

    async fn send_one(
        &self,
        composer: &Composer<'_>,
        recipient: &Recipient,
        sink: &dyn Sink,
        now_ms: i64,
    ) -> RecipientOutcome {
        let record = composer.compose(recipient, now_ms);
        let mut outcome = RecipientOutcome {
            address: recipient.address.clone(),
            message_id: record.id.clone(),
            stored: false,
            delivered: false,
            error: None,
        };

        if let Err(e) = self.store.create(&record).await {
            error!(message_id = %record.id, error = %e, "message_store_failed");
            outcome.error = Some(e.to_string());
            return outcome;
        }
        outcome.stored = true;

        match sink.deliver(&record).await {
            Ok(()) => outcome.delivered = true,
            Err(e) => {
                warn!(message_id = %record.id, error = %e, "message_delivery_failed");
                outcome.error = Some(e.to_string());
            }
        }

        outcome
    }

    /// Record the group uid, failing if it is already held within the TTL.
    fn claim_group(&self, uid: &str) -> Result<(), SendError> {
        let now = Instant::now();
        let ttl = self.config.group_ttl;
        self.groups.retain(|_, seen| now.duration_since(*seen) < ttl);

        match self.groups.entry(uid.to_string()) {
            Entry::Occupied(_) => {
                warn!(group_id = %uid, "send_group_duplicate");
                Err(SendError::DuplicateGroup(uid.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(())
            }
        }
    }
}

/// Check a request and parse its sender address.
pub fn validate(request: &SendRequest) -> Result<Sender, SendError> {
    let uid_len = request.uid.chars().count();
    if !(UID_MIN_LEN..=UID_MAX_LEN).contains(&uid_len) {
        return Err(SendError::Invalid(format!(
            "uid must be between {} and {} characters",
            UID_MIN_LEN, UID_MAX_LEN
        )));
    }

    if !request.method.is_supported() {
        return Err(SendError::Invalid(format!(
            "method {} is not supported",
            request.method
        )));
    }

    if request.recipients.is_empty() {
        return Err(SendError::Invalid("no recipients".to_string()));
    }

    if let Some(bad) = request.recipients.iter().find(|r| !r.address.contains('@')) {
        return Err(SendError::Invalid(format!(
            "invalid recipient address \"{}\"",
            bad.address
        )));
    }

    parse_sender(&request.from_address)
}

/// Parse `"Name <address>"` or a bare address.
pub fn parse_sender(from_address: &str) -> Result<Sender, SendError> {
    let invalid = || SendError::Invalid(format!("invalid from_address \"{}\"", from_address));

    let addrs = mailparse::addrparse(from_address).map_err(|_| invalid())?;
    match addrs.first() {
        Some(mailparse::MailAddr::Single(info)) if info.addr.contains('@') => Ok(Sender {
            email: info.addr.clone(),
            name: info.display_name.clone().filter(|n| !n.trim().is_empty()),
        }),
        _ => Err(invalid()),
    }
}
