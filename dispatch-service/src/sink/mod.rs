//! Outbound delivery of composed messages.
//!
//! Test methods write to a local directory; `email-mandrill` hands the
//! message to the provider's API. Delivery is attempted once; retries are
//! left to the caller re-sending the group.

use async_trait::async_trait;
use thiserror::Error;

use crate::message::MessageRecord;

pub mod file;
pub mod mandrill;

pub use file::TestSink;
pub use mandrill::{MandrillSink, WebhookRegistration, METADATA_MESSAGE_ID, WEBHOOK_EVENTS};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider request failed: {0}")]
    Provider(#[from] reqwest::Error),

    #[error("provider rejected message: {status} ({reason})")]
    Rejected { status: String, reason: String },
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, message: &MessageRecord) -> Result<(), DeliveryError>;
}
