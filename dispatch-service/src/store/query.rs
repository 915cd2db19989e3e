//! Listing, search and aggregation over stored records.
//!
//! Both backends answer the same [`MessageQuery`]: the in-memory store by
//! filtering its map, the search engine by translating it to a `_search`
//! request.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::message::{MessageRecord, MessageStatus};

/// Page size when the caller gives none.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Largest page a caller may ask for.
pub const MAX_PAGE_SIZE: usize = 100;

const DAY_MS: i64 = 86_400_000;

/// Which companies' records a caller may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanyScope {
    All,
    Company(String),
}

impl CompanyScope {
    pub fn includes(&self, company: &str) -> bool {
        match self {
            CompanyScope::All => true,
            CompanyScope::Company(c) => c == company,
        }
    }
}

/// How a query narrows the records in scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    /// Every record, newest send first.
    All,
    /// One record by id.
    Id(String),
    /// Free-text search over recipient fields and subject.
    Text(String),
    /// Records carrying every listed tag, most recently updated first.
    Tags(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub scope: CompanyScope,
    pub filter: MessageFilter,
    /// Offset of the first record returned
    pub from: usize,
    pub size: usize,
}

impl MessageQuery {
    pub fn new(scope: CompanyScope, filter: MessageFilter) -> Self {
        Self {
            scope,
            filter,
            from: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Whether `record` is selected, ignoring paging.
    pub fn matches(&self, record: &MessageRecord) -> bool {
        if !self.scope.includes(&record.company) {
            return false;
        }

        match &self.filter {
            MessageFilter::All => true,
            MessageFilter::Id(id) => &record.id == id,
            MessageFilter::Text(text) => {
                let needle = text.to_lowercase();
                [
                    Some(record.to_email.as_str()),
                    record.to_first_name.as_deref(),
                    record.to_last_name.as_deref(),
                    Some(record.subject.as_str()),
                ]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(&needle))
            }
            MessageFilter::Tags(tags) => tags.iter().all(|t| record.tags.contains(t)),
        }
    }

    /// Order selected records the way the backends present them.
    pub fn sort(&self, records: &mut [MessageRecord]) {
        match self.filter {
            MessageFilter::Tags(_) => records.sort_by(|a, b| b.update_ts.cmp(&a.update_ts)),
            _ => records.sort_by(|a, b| b.send_ts.cmp(&a.send_ts)),
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagePage {
    /// Matches across all pages
    pub total: u64,
    pub messages: Vec<MessageRecord>,
}

/// Records sent on one UTC day, counted per current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayBucket {
    /// Start of the day, epoch milliseconds
    pub day: i64,
    pub total: u64,
    pub statuses: BTreeMap<MessageStatus, u64>,
}

impl DayBucket {
    pub fn new(day: i64) -> Self {
        Self {
            day,
            total: 0,
            statuses: MessageStatus::ALL.iter().map(|s| (*s, 0)).collect(),
        }
    }
}

/// Start of the UTC day containing `ts_ms`.
pub fn day_start(ts_ms: i64) -> i64 {
    ts_ms.div_euclid(DAY_MS) * DAY_MS
}

/// Bucket records by send day, oldest day first.
pub fn daily_histogram<'a>(records: impl IntoIterator<Item = &'a MessageRecord>) -> Vec<DayBucket> {
    let mut days: BTreeMap<i64, DayBucket> = BTreeMap::new();

    for record in records {
        let day = day_start(record.send_ts);
        let bucket = days.entry(day).or_insert_with(|| DayBucket::new(day));
        bucket.total += 1;
        *bucket.statuses.entry(record.status).or_insert(0) += 1;
    }

    days.into_values().collect()
}
