//! Search-engine message store.
//!
//! Each send method gets its own index (`messages-{method}`) and each record
//! is one document keyed by its message id. Updates use the engine's
//! optimistic concurrency control: the document is read together with its
//! `_seq_no`/`_primary_term`, mutated locally, and written back with
//! `if_seq_no`/`if_primary_term`. A `409` means another writer got there
//! first, so the cycle is retried from a fresh read.
//!
//! Listing, search and the daily histogram are `_search` requests against the
//! method's index.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    CompanyScope, DayBucket, MessageFilter, MessagePage, MessageQuery, MessageStore, Mutator,
    StoreError,
};
use crate::message::{MessageKey, MessageRecord, MessageStatus, SendMethod};

/// Connection settings for [`ElasticStore`].
#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra attempts after the first optimistic write loses a race
    pub update_retries: u32,
}

#[derive(Debug, Clone)]
pub struct ElasticStore {
    client: Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
    update_retries: u32,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(rename = "_seq_no")]
    seq_no: u64,
    #[serde(rename = "_primary_term")]
    primary_term: u64,
    #[serde(rename = "_source")]
    source: MessageRecord,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    total: HitTotal,
    #[serde(default)]
    hits: Vec<SearchHit>,
}

/// Older engines report a bare count, newer ones `{"value": n, "relation": ..}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HitTotal {
    Count(u64),
    Object { value: u64 },
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_source")]
    source: MessageRecord,
}

#[derive(Debug, Deserialize)]
struct HistogramResponse {
    aggregations: HistogramAggregations,
}

#[derive(Debug, Deserialize)]
struct HistogramAggregations {
    days: HistogramDays,
}

#[derive(Debug, Deserialize)]
struct HistogramDays {
    buckets: Vec<HistogramBucket>,
}

#[derive(Debug, Deserialize)]
struct HistogramBucket {
    key: i64,
    doc_count: u64,
    /// One `{doc_count}` sub-aggregation per status
    #[serde(flatten)]
    statuses: HashMap<String, JsonValue>,
}

/// A record together with the version it was read at.
struct Versioned {
    record: MessageRecord,
    seq_no: u64,
    primary_term: u64,
}

impl ElasticStore {
    pub fn new(config: ElasticConfig) -> Result<Self, url::ParseError> {
        let base = Url::parse(&config.url)?;

        Ok(Self {
            client: Client::new(),
            base,
            username: config.username,
            password: config.password,
            update_retries: config.update_retries,
        })
    }

    fn index(method: SendMethod) -> String {
        format!("messages-{}", method.as_str())
    }

    /// Append path segments to the base URL. Each segment is percent-encoded,
    /// so `/`, `?` and `#` in a segment never leave it.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Unavailable(format!("cannot extend {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn doc_url(&self, key: &MessageKey) -> Result<Url, StoreError> {
        self.endpoint(&[&Self::index(key.method), "_doc", &key.id])
    }

    /// POST a `_search` body to the method's index. A missing index reads as `None`.
    async fn post_search(
        &self,
        method: SendMethod,
        body: &JsonValue,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let index = Self::index(method);
        let url = self.endpoint(&[&index, "_search"])?;
        let resp = self.authed(self.client.post(url)).json(body).send().await?;

        match resp.status() {
            // No record has been stored for this method yet
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.bytes().await?.to_vec())),
            status => {
                warn!(index = %index, status_code = status.as_u16(), "store_search_failed");
                Err(StoreError::Unavailable(format!(
                    "unexpected status {} searching {}",
                    status, index
                )))
            }
        }
    }

    async fn create_index(&self, method: SendMethod) -> Result<(), StoreError> {
        let index = Self::index(method);
        let url = self.endpoint(&[&index])?;
        let resp = self
            .authed(self.client.put(url))
            .json(&index_definition())
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            info!(index = %index, "store_index_created");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            debug!(index = %index, "store_index_exists");
            return Ok(());
        }

        warn!(index = %index, status_code = status.as_u16(), "store_index_create_failed");
        Err(StoreError::Unavailable(format!(
            "unexpected status {} creating {}",
            status, index
        )))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    async fn get_versioned(&self, key: &MessageKey) -> Result<Versioned, StoreError> {
        let url = self.doc_url(key)?;
        let resp = self.authed(self.client.get(url)).send().await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.clone())),
            status if status.is_success() => {
                let body: GetResponse = serde_json::from_slice(&resp.bytes().await?)?;
                Ok(Versioned {
                    record: body.source,
                    seq_no: body.seq_no,
                    primary_term: body.primary_term,
                })
            }
            status => Err(unexpected_status(key, status)),
        }
    }
}

/// Index settings: exact-match fields are keywords, timestamps are epoch millis.
fn index_definition() -> JsonValue {
    let keyword = json!({"type": "keyword"});
    let date = json!({"type": "date", "format": "epoch_millis"});
    let opaque = json!({"type": "object", "enabled": false});

    json!({
        "mappings": {
            "dynamic": false,
            "properties": {
                "id": keyword,
                "company": keyword,
                "method": keyword,
                "group_id": keyword,
                "to_first_name": keyword,
                "to_last_name": keyword,
                "to_email": keyword,
                "from_email": keyword,
                "from_name": keyword,
                "subaccount": keyword,
                "tags": keyword,
                "subject": {"type": "text"},
                "text_body": {"type": "text"},
                "html_body": {"type": "text", "index": false},
                "headers": opaque,
                "status": keyword,
                "send_ts": date,
                "update_ts": date,
                "events": {
                    "properties": {
                        "ts": date,
                        "status": keyword,
                        "extra": opaque,
                    }
                },
            }
        }
    })
}

fn scope_filter(scope: &CompanyScope) -> JsonValue {
    match scope {
        CompanyScope::All => json!({"match_all": {}}),
        CompanyScope::Company(company) => json!({"term": {"company": company}}),
    }
}

fn search_body(query: &MessageQuery) -> JsonValue {
    let mut filters = vec![scope_filter(&query.scope)];
    let mut must = Vec::new();
    let mut sort = Vec::new();

    match &query.filter {
        MessageFilter::All => sort.push(json!({"send_ts": "desc"})),
        MessageFilter::Id(id) => filters.push(json!({"term": {"id": id}})),
        MessageFilter::Text(text) => must.push(json!({
            "simple_query_string": {
                "query": text,
                "fields": ["to_*^3", "subject^2", "text_body"],
                "lenient": true,
            }
        })),
        MessageFilter::Tags(tags) => {
            filters.extend(tags.iter().map(|t| json!({"term": {"tags": t}})));
            sort.push(json!({"update_ts": "desc"}));
        }
    }

    let mut body = json!({
        "query": {"bool": {"filter": filters}},
        "from": query.from,
        "size": query.size,
        "track_total_hits": true,
    });
    if !must.is_empty() {
        body["query"]["bool"]["must"] = JsonValue::Array(must);
    }
    if !sort.is_empty() {
        body["sort"] = JsonValue::Array(sort);
    }
    body
}

fn histogram_body(scope: &CompanyScope) -> JsonValue {
    let per_status: serde_json::Map<String, JsonValue> = MessageStatus::ALL
        .iter()
        .map(|status| {
            (
                status.as_str().to_string(),
                json!({"filter": {"term": {"status": status.as_str()}}}),
            )
        })
        .collect();

    json!({
        "size": 0,
        "query": {"bool": {"filter": [scope_filter(scope)]}},
        "aggs": {
            "days": {
                "date_histogram": {
                    "field": "send_ts",
                    "calendar_interval": "day",
                    "min_doc_count": 1,
                },
                "aggs": per_status,
            }
        }
    })
}

impl From<HistogramBucket> for DayBucket {
    fn from(bucket: HistogramBucket) -> Self {
        let mut day = DayBucket::new(bucket.key);
        day.total = bucket.doc_count;
        for (status, count) in day.statuses.iter_mut() {
            *count = bucket
                .statuses
                .get(status.as_str())
                .and_then(|agg| agg.get("doc_count"))
                .and_then(JsonValue::as_u64)
                .unwrap_or(0);
        }
        day
    }
}

fn unexpected_status(key: &MessageKey, status: StatusCode) -> StoreError {
    warn!(key = %key, status_code = status.as_u16(), "store_unexpected_status");
    StoreError::Unavailable(format!("unexpected status {} for {}", status, key))
}

#[async_trait]
impl MessageStore for ElasticStore {
    async fn create(&self, record: &MessageRecord) -> Result<(), StoreError> {
        let key = record.key();
        let url = self.doc_url(&key)?;
        let resp = self
            .authed(self.client.put(url))
            .json(record)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(unexpected_status(&key, status));
        }
        if status == StatusCode::OK {
            debug!(key = %key, "message_record_overwritten");
        }
        Ok(())
    }

    async fn get(&self, key: &MessageKey) -> Result<MessageRecord, StoreError> {
        Ok(self.get_versioned(key).await?.record)
    }

    async fn update(
        &self,
        key: &MessageKey,
        mutator: Mutator<'_>,
    ) -> Result<MessageRecord, StoreError> {
        let attempts = self.update_retries + 1;

        for attempt in 1..=attempts {
            let Versioned {
                mut record,
                seq_no,
                primary_term,
            } = self.get_versioned(key).await?;

            mutator(&mut record);

            let url = self.doc_url(key)?;
            let resp = self
                .authed(self.client.put(url))
                .query(&[("if_seq_no", seq_no), ("if_primary_term", primary_term)])
                .json(&record)
                .send()
                .await?;

            match resp.status() {
                status if status.is_success() => return Ok(record),
                StatusCode::CONFLICT => {
                    debug!(key = %key, attempt = attempt, "store_update_conflict");
                }
                status => return Err(unexpected_status(key, status)),
            }
        }

        warn!(key = %key, attempts = attempts, "store_update_conflict_exhausted");
        Err(StoreError::Conflict {
            key: key.clone(),
            attempts,
        })
    }

    async fn search(
        &self,
        method: SendMethod,
        query: &MessageQuery,
    ) -> Result<MessagePage, StoreError> {
        let Some(bytes) = self.post_search(method, &search_body(query)).await? else {
            return Ok(MessagePage {
                total: 0,
                messages: Vec::new(),
            });
        };

        let resp: SearchResponse = serde_json::from_slice(&bytes)?;
        let total = match resp.hits.total {
            HitTotal::Count(n) | HitTotal::Object { value: n } => n,
        };

        Ok(MessagePage {
            total,
            messages: resp.hits.hits.into_iter().map(|h| h.source).collect(),
        })
    }

    async fn histogram(
        &self,
        method: SendMethod,
        scope: &CompanyScope,
    ) -> Result<Vec<DayBucket>, StoreError> {
        let Some(bytes) = self.post_search(method, &histogram_body(scope)).await? else {
            return Ok(Vec::new());
        };

        let resp: HistogramResponse = serde_json::from_slice(&bytes)?;
        Ok(resp
            .aggregations
            .days
            .buckets
            .into_iter()
            .map(DayBucket::from)
            .collect())
    }

    async fn ensure_ready(&self) -> Result<(), StoreError> {
        for method in SendMethod::ALL.into_iter().filter(SendMethod::is_supported) {
            self.create_index(method).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::message::MessageEvent;

    fn record() -> MessageRecord {
        MessageRecord {
            id: "group-aexamplecom".to_string(),
            company: "co".to_string(),
            method: SendMethod::EmailMandrill,
            group_id: "group".to_string(),
            to_first_name: None,
            to_last_name: None,
            to_email: "a@example.com".to_string(),
            from_email: "s@example.com".to_string(),
            from_name: None,
            subaccount: None,
            tags: vec![],
            subject: "hi".to_string(),
            html_body: "<p>hi</p>".to_string(),
            text_body: "hi".to_string(),
            headers: BTreeMap::new(),
            status: MessageStatus::Send,
            send_ts: 100,
            update_ts: 100,
            events: vec![],
        }
    }

    fn store(server: &MockServer, update_retries: u32) -> ElasticStore {
        ElasticStore::new(ElasticConfig {
            url: server.uri(),
            username: Some("elastic".to_string()),
            password: Some("secret".to_string()),
            update_retries,
        })
        .unwrap()
    }

    fn doc_body(seq_no: u64) -> serde_json::Value {
        json!({
            "_index": "messages-email-mandrill",
            "_id": "group-aexamplecom",
            "_seq_no": seq_no,
            "_primary_term": 1,
            "found": true,
            "_source": record(),
        })
    }

    const DOC_PATH: &str = "/messages-email-mandrill/_doc/group-aexamplecom";

    #[tokio::test]
    async fn test_get_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(doc_body(3)))
            .mount(&server)
            .await;

        let got = store(&server, 0).get(&record().key()).await.unwrap();
        assert_eq!(got, record());
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"found": false})))
            .mount(&server)
            .await;

        let result = store(&server, 0).get(&record().key()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_puts_document() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .and(body_partial_json(json!({"status": "send", "to_email": "a@example.com"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        store(&server, 0).create(&record()).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_retries_on_version_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(doc_body(7)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .and(query_param("if_seq_no", "7"))
            .respond_with(ResponseTemplate::new(409))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .and(query_param("if_primary_term", "1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let event = MessageEvent {
            ts: 5_000,
            status: MessageStatus::Open,
            extra: json!({"user_agent": "test"}),
        };
        let updated = store(&server, 2)
            .update(&record().key(), &move |r: &mut MessageRecord| {
                r.apply_event(event.clone())
            })
            .await
            .unwrap();

        assert_eq!(updated.status, MessageStatus::Open);
        assert_eq!(updated.events.len(), 1);
        assert_eq!(updated.update_ts, 5_000);
    }

    #[tokio::test]
    async fn test_update_gives_up_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(doc_body(1)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(409))
            .expect(3)
            .mount(&server)
            .await;

        let result = store(&server, 2)
            .update(&record().key(), &|r: &mut MessageRecord| {
                r.status = MessageStatus::Click
            })
            .await;

        match result {
            Err(StoreError::Conflict { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = store(&server, 0).get(&record().key()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_id_cannot_escape_its_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/messages-email-mandrill/_doc/victim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(doc_body(1)))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"found": false})))
            .mount(&server)
            .await;

        let store = store(&server, 0);
        let key = MessageKey::new(
            SendMethod::EmailTest,
            "../../messages-email-mandrill/_doc/victim",
        );

        let url = store.doc_url(&key).unwrap();
        assert_eq!(url.path_segments().unwrap().count(), 3);
        assert!(url.path().starts_with("/messages-email-test/_doc/"));
        assert!(url.query().is_none());

        let result = store.get(&key).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_base_path_is_kept() {
        let store = ElasticStore::new(ElasticConfig {
            url: "http://localhost:9200/es".to_string(),
            username: None,
            password: None,
            update_retries: 0,
        })
        .unwrap();

        let url = store.doc_url(&record().key()).unwrap();
        assert_eq!(url.path(), "/es/messages-email-mandrill/_doc/group-aexamplecom");
    }

    #[tokio::test]
    async fn test_search_scopes_by_company() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages-email-mandrill/_search"))
            .and(body_partial_json(json!({
                "query": {"bool": {"filter": [{"term": {"company": "co"}}]}},
                "from": 0,
                "size": 10,
                "sort": [{"send_ts": "desc"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {
                    "total": {"value": 1, "relation": "eq"},
                    "hits": [{"_id": "group-aexamplecom", "_source": record()}]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let query = MessageQuery::new(CompanyScope::Company("co".to_string()), MessageFilter::All);
        let page = store(&server, 0)
            .search(SendMethod::EmailMandrill, &query)
            .await
            .unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.messages, vec![record()]);
    }

    #[tokio::test]
    async fn test_search_missing_index_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let query = MessageQuery::new(CompanyScope::All, MessageFilter::Text("cherry".into()));
        let page = store(&server, 0)
            .search(SendMethod::EmailTest, &query)
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(page.messages.is_empty());
    }

    #[test]
    fn test_search_body_shapes() {
        let tags = MessageQuery::new(
            CompanyScope::All,
            MessageFilter::Tags(vec!["user:2".to_string(), "shoesize:8".to_string()]),
        );
        let body = search_body(&tags);
        assert_eq!(
            body["query"]["bool"]["filter"],
            json!([
                {"match_all": {}},
                {"term": {"tags": "user:2"}},
                {"term": {"tags": "shoesize:8"}}
            ])
        );
        assert_eq!(body["sort"], json!([{"update_ts": "desc"}]));

        let text = MessageQuery::new(CompanyScope::All, MessageFilter::Text("cherry".into()));
        let body = search_body(&text);
        assert_eq!(body["query"]["bool"]["must"][0]["simple_query_string"]["query"], "cherry");
        assert!(body.get("sort").is_none());
    }

    #[tokio::test]
    async fn test_histogram_parses_buckets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages-email-test/_search"))
            .and(body_partial_json(json!({"size": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "aggregations": {
                    "days": {
                        "buckets": [{
                            "key_as_string": "86400000",
                            "key": 86_400_000,
                            "doc_count": 4,
                            "send": {"doc_count": 3},
                            "open": {"doc_count": 1},
                            "click": {"doc_count": 0}
                        }]
                    }
                }
            })))
            .mount(&server)
            .await;

        let buckets = store(&server, 0)
            .histogram(SendMethod::EmailTest, &CompanyScope::All)
            .await
            .unwrap();

        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].day, 86_400_000);
        assert_eq!(buckets[0].total, 4);
        assert_eq!(buckets[0].statuses[&MessageStatus::Send], 3);
        assert_eq!(buckets[0].statuses[&MessageStatus::Open], 1);
        assert_eq!(buckets[0].statuses[&MessageStatus::Spam], 0);
    }

    #[tokio::test]
    async fn test_ensure_ready_tolerates_existing_index() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/messages-email-mandrill"))
            .and(body_partial_json(json!({"mappings": {"properties": {"company": {"type": "keyword"}}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/messages-email-test"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"type": "resource_already_exists_exception"},
                "status": 400
            })))
            .expect(1)
            .mount(&server)
            .await;

        store(&server, 0).ensure_ready().await.unwrap();
    }
}
