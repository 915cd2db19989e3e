//! Delivery through the Mandrill transactional API.
//!
//! Our record id travels as message metadata so webhook events, which carry
//! the provider's own `_id`, can be mapped back to the stored record.
//!
//! The same API registers our signed webhook callback on startup.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use super::{DeliveryError, Sink};
use crate::message::MessageRecord;

/// Metadata key carrying the record id.
pub const METADATA_MESSAGE_ID: &str = "message_id";

/// Events requested when the webhook is created.
pub const WEBHOOK_EVENTS: &[&str] = &[
    "send",
    "hard_bounce",
    "soft_bounce",
    "open",
    "click",
    "spam",
    "unsub",
    "reject",
];

const WEBHOOK_DESCRIPTION: &str = "dispatch - auto created";

#[derive(Debug, Clone)]
pub struct MandrillSink {
    client: Client,
    send_url: Url,
    webhooks_list_url: Url,
    webhooks_add_url: Url,
    api_key: String,
}

/// The provider's webhook entry for our callback URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRegistration {
    /// Key the provider signs callbacks with
    pub auth_key: String,
    /// Whether the entry was created by this call
    pub created: bool,
}

#[derive(Debug, Serialize)]
struct KeyPayload<'a> {
    key: &'a str,
}

#[derive(Debug, Serialize)]
struct AddWebhookPayload<'a> {
    key: &'a str,
    url: &'a str,
    description: &'a str,
    events: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    url: String,
    auth_key: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendPayload<'a> {
    key: &'a str,
    #[serde(rename = "async")]
    is_async: bool,
    message: ProviderMessage<'a>,
}

#[derive(Debug, Serialize)]
struct ProviderMessage<'a> {
    html: &'a str,
    text: &'a str,
    subject: &'a str,
    from_email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_name: Option<&'a str>,
    to: [Recipient<'a>; 1],
    headers: &'a std::collections::BTreeMap<String, String>,
    track_opens: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    subaccount: Option<&'a str>,
    tags: &'a [String],
    metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Recipient<'a> {
    email: &'a str,
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct SendResult {
    email: String,
    status: String,
    #[serde(default)]
    reject_reason: Option<String>,
    #[serde(rename = "_id", default)]
    provider_id: Option<String>,
}

impl MandrillSink {
    /// `api_url` is the API root, e.g. `https://mandrillapp.com/api/1.0/`.
    pub fn new(api_url: &str, api_key: impl Into<String>) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(api_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client: Client::new(),
            send_url: base.join("messages/send.json")?,
            webhooks_list_url: base.join("webhooks/list.json")?,
            webhooks_add_url: base.join("webhooks/add.json")?,
            api_key: api_key.into(),
        })
    }

    async fn call<T, R>(&self, url: &Url, payload: &T) -> Result<R, DeliveryError>
    where
        T: Serialize,
        R: serde::de::DeserializeOwned,
    {
        Ok(self
            .client
            .post(url.clone())
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Find the webhook pointing at `callback_url`, creating it if absent.
    pub async fn register_webhook(
        &self,
        callback_url: &str,
    ) -> Result<WebhookRegistration, DeliveryError> {
        let hooks: Vec<WebhookEntry> = self
            .call(&self.webhooks_list_url, &KeyPayload { key: &self.api_key })
            .await?;

        if let Some(hook) = hooks.into_iter().find(|h| h.url == callback_url) {
            info!(
                url = %callback_url,
                description = ?hook.description,
                "mandrill_webhook_existing"
            );
            return Ok(WebhookRegistration {
                auth_key: hook.auth_key,
                created: false,
            });
        }

        let hook: WebhookEntry = self
            .call(
                &self.webhooks_add_url,
                &AddWebhookPayload {
                    key: &self.api_key,
                    url: callback_url,
                    description: WEBHOOK_DESCRIPTION,
                    events: WEBHOOK_EVENTS,
                },
            )
            .await?;

        info!(url = %hook.url, "mandrill_webhook_created");
        Ok(WebhookRegistration {
            auth_key: hook.auth_key,
            created: true,
        })
    }
}

#[async_trait]
impl Sink for MandrillSink {
    async fn deliver(&self, message: &MessageRecord) -> Result<(), DeliveryError> {
        let name = [message.to_first_name.as_deref(), message.to_last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

        let payload = SendPayload {
            key: &self.api_key,
            is_async: true,
            message: ProviderMessage {
                html: &message.html_body,
                text: &message.text_body,
                subject: &message.subject,
                from_email: &message.from_email,
                from_name: message.from_name.as_deref(),
                to: [Recipient {
                    email: &message.to_email,
                    name,
                    kind: "to",
                }],
                headers: &message.headers,
                track_opens: true,
                subaccount: message.subaccount.as_deref(),
                tags: &message.tags,
                metadata: serde_json::json!({ METADATA_MESSAGE_ID: message.id }),
            },
        };

        let results: Vec<SendResult> = self
            .client
            .post(self.send_url.clone())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(result) = results.into_iter().find(|r| r.email == message.to_email) else {
            return Err(DeliveryError::Rejected {
                status: "missing".to_string(),
                reason: "no result for recipient".to_string(),
            });
        };

        match result.status.as_str() {
            "sent" | "queued" | "scheduled" => {
                info!(
                    message_id = %message.id,
                    provider_id = ?result.provider_id,
                    provider_status = %result.status,
                    "mandrill_message_accepted"
                );
                Ok(())
            }
            _ => {
                let reason = result.reject_reason.unwrap_or_default();
                warn!(
                    message_id = %message.id,
                    provider_status = %result.status,
                    reject_reason = %reason,
                    "mandrill_message_not_sent"
                );
                Err(DeliveryError::Rejected {
                    status: result.status,
                    reason,
                })
            }
        }
    }
}
