//! Message record storage.
//!
//! Records are created once by the send path and afterwards only mutated
//! through [`MessageStore::update`], which applies a mutator as a single
//! read-modify-write per record so concurrent webhook events never lose an
//! append.

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{MessageKey, MessageRecord, SendMethod};

pub mod elastic;
pub mod memory;
pub mod query;

pub use elastic::{ElasticConfig, ElasticStore};
pub use memory::MemoryStore;
pub use query::{
    CompanyScope, DayBucket, MessageFilter, MessagePage, MessageQuery, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};

/// Errors returned by a message store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(MessageKey),

    /// Optimistic update kept losing the race.
    #[error("update conflict on {key} after {attempts} attempts")]
    Conflict { key: MessageKey, attempts: u32 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Unavailable(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// A mutation applied to a stored record. May run more than once when the
/// backend retries an optimistic update.
pub type Mutator<'a> = &'a (dyn Fn(&mut MessageRecord) + Send + Sync);

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a new record. An existing record with the same key is overwritten.
    async fn create(&self, record: &MessageRecord) -> Result<(), StoreError>;

    async fn get(&self, key: &MessageKey) -> Result<MessageRecord, StoreError>;

    /// Atomically apply `mutator` to the record and return the stored result.
    async fn update(&self, key: &MessageKey, mutator: Mutator<'_>)
        -> Result<MessageRecord, StoreError>;

    /// List or search the records of one method.
    async fn search(&self, method: SendMethod, query: &MessageQuery)
        -> Result<MessagePage, StoreError>;

    /// Per-day send counts with a breakdown by current status, oldest day first.
    async fn histogram(&self, method: SendMethod, scope: &CompanyScope)
        -> Result<Vec<DayBucket>, StoreError>;

    /// Prepare backing storage (indices, mappings) before serving.
    async fn ensure_ready(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
