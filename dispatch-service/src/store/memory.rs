//! In-memory message store backed by `DashMap`.
//!
//! Used when no search engine is configured, and by tests. Records are lost
//! on restart.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::query::daily_histogram;
use super::{CompanyScope, DayBucket, MessagePage, MessageQuery, MessageStore, Mutator, StoreError};
use crate::message::{MessageKey, MessageRecord, SendMethod};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<MessageKey, MessageRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, record: &MessageRecord) -> Result<(), StoreError> {
        if let Some(previous) = self.records.insert(record.key(), record.clone()) {
            debug!(key = %previous.key(), "message_record_overwritten");
        }
        Ok(())
    }

    async fn get(&self, key: &MessageKey) -> Result<MessageRecord, StoreError> {
        self.records
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn update(
        &self,
        key: &MessageKey,
        mutator: Mutator<'_>,
    ) -> Result<MessageRecord, StoreError> {
        // The shard write lock is held for the whole mutation
        let mut entry = self
            .records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        mutator(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn search(
        &self,
        method: SendMethod,
        query: &MessageQuery,
    ) -> Result<MessagePage, StoreError> {
        let mut selected: Vec<MessageRecord> = self
            .records
            .iter()
            .filter(|entry| entry.key().method == method && query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        query.sort(&mut selected);

        Ok(MessagePage {
            total: selected.len() as u64,
            messages: selected
                .into_iter()
                .skip(query.from)
                .take(query.size)
                .collect(),
        })
    }

    async fn histogram(
        &self,
        method: SendMethod,
        scope: &CompanyScope,
    ) -> Result<Vec<DayBucket>, StoreError> {
        let selected: Vec<MessageRecord> = self
            .records
            .iter()
            .filter(|entry| entry.key().method == method && scope.includes(&entry.value().company))
            .map(|entry| entry.value().clone())
            .collect();

        Ok(daily_histogram(&selected))
    }
}
