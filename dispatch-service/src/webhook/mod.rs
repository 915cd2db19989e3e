//! Provider webhook ingestion.
//!
//! ```text
//! provider callback → verify signature → parse events → store.update (append + advance)
//! ```

pub mod signature;
pub mod tracker;

pub use signature::{
    is_signature_verification_enabled, sign_webhook, verify_webhook_signature, SIGNATURE_HEADER,
};
pub use tracker::{
    normalize_ts, BatchReport, Provider, ProviderEvent, SigningConfig, StatusTracker,
    WebhookError, EVENTS_FIELD,
};
