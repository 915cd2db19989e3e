//! Dispatch - transactional message dispatch service.
//!
//! This library provides the modules behind the `dispatch-web` binary:
//! - `render`: mustache-family template engine with partials, macros and markdown
//! - `compose`: per-recipient context and header merging into message records
//! - `dispatch`: send-group validation and concurrent per-recipient delivery
//! - `webhook`: signed and unsigned provider events applied to stored records
//! - `store`: record storage plus company-scoped listing, search and daily aggregation
//!
//! ## Architecture
//!
//! ```text
//! Send request → Dispatcher → Composer → Renderer → Store (create) → Sink
//! Provider webhook → StatusTracker (verify, parse) → Store (update)
//! User view → user token → Store (search, histogram)
//! ```

pub mod compose;
pub mod config;
pub mod dispatch;
pub mod html;
pub mod message;
pub mod render;
pub mod sink;
pub mod store;
pub mod web;
pub mod webhook;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{Dispatcher, SendError, SendReport};
pub use message::{MessageRecord, MessageStatus, SendMethod, SendRequest};
pub use render::Renderer;
pub use store::{MessageStore, StoreError};
pub use web::{router, AppState};
pub use webhook::{StatusTracker, WebhookError};
