//! Source adapter contracts + REST, fixture and static implementations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opsfeed_core::{
    now_millis, BulkRfqRecord, Category, LeadEvent, NotificationDraft, OrderRecord,
    QuestionRecord, ReviewRecord, SingleLeadRecord, ACTIONABLE_ORDER_STATUSES,
};
use opsfeed_storage::{FetchError, HttpFetcher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "opsfeed-adapters";

/// Backend collection shape. Two kinds feed the lead category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Orders,
    Reviews,
    Questions,
    Leads,
    BulkRfqs,
}

impl SourceKind {
    pub fn category(&self) -> Category {
        match self {
            SourceKind::Orders => Category::Order,
            SourceKind::Reviews => Category::Review,
            SourceKind::Questions => Category::Question,
            SourceKind::Leads | SourceKind::BulkRfqs => Category::Lead,
        }
    }

    /// Server-side filters the collection understands.
    pub fn default_query(&self, limit: usize) -> Vec<(String, String)> {
        let mut query = vec![("limit".to_string(), limit.to_string())];
        match self {
            SourceKind::Orders => {
                query.push(("status".to_string(), ACTIONABLE_ORDER_STATUSES.join(",")));
            }
            SourceKind::Reviews => {
                query.push(("includeInactive".to_string(), "false".to_string()));
            }
            SourceKind::Questions | SourceKind::Leads | SourceKind::BulkRfqs => {}
        }
        query
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {kind:?} page: {source}")]
    Decode {
        kind: SourceKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn category(&self) -> Category;

    /// Up to `limit` entities needing attention, normalised into drafts.
    async fn fetch(&self, limit: usize) -> Result<Vec<NotificationDraft>, AdapterError>;

    /// Release transport resources once the owning engine is disposed.
    fn close(&self) {}
}

/// Collections answer either with a bare array or an envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Page<T> {
    Bare(Vec<T>),
    Envelope {
        #[serde(alias = "items", alias = "results")]
        data: Vec<T>,
    },
}

impl<T> Page<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Page::Bare(items) | Page::Envelope { data: items } => items,
        }
    }
}

/// Decode one entity object. Mongo-style payloads may carry both `_id` and
/// an `id` virtual; `_id` wins.
fn decode_entity<T: DeserializeOwned>(mut value: JsonValue) -> Result<T, serde_json::Error> {
    if let Some(object) = value.as_object_mut() {
        if let Some(mongo_id) = object.remove("_id").filter(|v| !v.is_null()) {
            object.insert("id".to_string(), mongo_id);
        }
    }
    serde_json::from_value(value)
}

/// A page that is not a list fails the source; a bad record only skips itself.
fn decode_page<T: DeserializeOwned>(kind: SourceKind, body: JsonValue) -> Result<Vec<T>, AdapterError> {
    let raw = serde_json::from_value::<Page<JsonValue>>(body)
        .map(Page::into_vec)
        .map_err(|source| AdapterError::Decode { kind, source })?;
    Ok(raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match decode_entity::<T>(value) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(?kind, index, error = %err, "skipping malformed record");
                None
            }
        })
        .collect())
}

/// Decode one collection response and keep the entities worth notifying about.
pub fn drafts_from_json(
    kind: SourceKind,
    body: JsonValue,
    limit: usize,
    now_ms: i64,
) -> Result<Vec<NotificationDraft>, AdapterError> {
    let drafts: Vec<NotificationDraft> = match kind {
        SourceKind::Orders => decode_page::<OrderRecord>(kind, body)?
            .iter()
            .filter(|o| o.is_actionable())
            .map(|o| o.to_draft(now_ms))
            .collect(),
        SourceKind::Reviews => decode_page::<ReviewRecord>(kind, body)?
            .iter()
            .map(|r| r.to_draft(now_ms))
            .collect(),
        SourceKind::Questions => decode_page::<QuestionRecord>(kind, body)?
            .iter()
            .filter(|q| q.needs_attention())
            .map(|q| q.to_draft(now_ms))
            .collect(),
        SourceKind::Leads => decode_page::<SingleLeadRecord>(kind, body)?
            .into_iter()
            .map(|lead| LeadEvent::Single(lead).normalize(now_ms))
            .collect(),
        SourceKind::BulkRfqs => decode_page::<BulkRfqRecord>(kind, body)?
            .into_iter()
            .map(|rfq| LeadEvent::BulkRfq(rfq).normalize(now_ms))
            .collect(),
    };
    Ok(drafts.into_iter().take(limit).collect())
}

/// Interpret a single pushed entity the way a poll would.
///
/// Returns `None` when the payload does not have the category's entity shape
/// or is filtered out (e.g. an order already past the actionable statuses).
pub fn draft_from_entity(category: Category, data: &JsonValue, now_ms: i64) -> Option<NotificationDraft> {
    match category {
        Category::Order => decode_entity::<OrderRecord>(data.clone())
            .ok()
            .filter(OrderRecord::is_actionable)
            .map(|o| o.to_draft(now_ms)),
        Category::Review => decode_entity::<ReviewRecord>(data.clone())
            .ok()
            .map(|r| r.to_draft(now_ms)),
        Category::Question => decode_entity::<QuestionRecord>(data.clone())
            .ok()
            .filter(QuestionRecord::needs_attention)
            .map(|q| q.to_draft(now_ms)),
        Category::Lead => decode_entity::<SingleLeadRecord>(data.clone())
            .ok()
            .map(|lead| LeadEvent::Single(lead).normalize(now_ms)),
    }
}

/// Live collection behind the back-office REST API.
pub struct RestSource {
    source_id: String,
    kind: SourceKind,
    path: String,
    extra_query: Vec<(String, String)>,
    http: Arc<HttpFetcher>,
}

impl RestSource {
    pub fn new(
        source_id: impl Into<String>,
        kind: SourceKind,
        path: impl Into<String>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            path: path.into(),
            extra_query: Vec::new(),
            http,
        }
    }

    pub fn with_query(mut self, query: impl IntoIterator<Item = (String, String)>) -> Self {
        self.extra_query.extend(query);
        self
    }
}

#[async_trait]
impl SourceAdapter for RestSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> Category {
        self.kind.category()
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<NotificationDraft>, AdapterError> {
        let mut query = self.kind.default_query(limit);
        for (key, value) in &self.extra_query {
            query.retain(|(k, _)| k != key);
            query.push((key.clone(), value.clone()));
        }
        let body: JsonValue = self
            .http
            .get_json(&self.source_id, &self.path, &query)
            .await?;
        let drafts = drafts_from_json(self.kind, body, limit, now_millis())?;
        debug!(source_id = %self.source_id, drafts = drafts.len(), "fetched collection");
        Ok(drafts)
    }

    fn close(&self) {
        self.http.close();
    }
}

/// Reads a captured API response from disk on every fetch.
pub struct FixtureSource {
    source_id: String,
    kind: SourceKind,
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> Category {
        self.kind.category()
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<NotificationDraft>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AdapterError::Fixture {
                path: self.path.display().to_string(),
                source,
            })?;
        let body: JsonValue = serde_json::from_str(&text).map_err(|source| AdapterError::Decode {
            kind: self.kind,
            source,
        })?;
        drafts_from_json(self.kind, body, limit, now_millis())
    }
}

#[derive(Debug, Clone)]
enum StaticBehaviour {
    Batch(Vec<NotificationDraft>),
    Fail(String),
}

/// In-process source with a swappable batch. Counts every fetch call.
pub struct StaticSource {
    source_id: String,
    category: Category,
    behaviour: Mutex<StaticBehaviour>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    closed: AtomicBool,
}

impl StaticSource {
    pub fn new(source_id: impl Into<String>, category: Category) -> Self {
        Self {
            source_id: source_id.into(),
            category,
            behaviour: Mutex::new(StaticBehaviour::Batch(Vec::new())),
            delay: None,
            calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_batch(self, batch: Vec<NotificationDraft>) -> Self {
        self.set_batch(batch);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_batch(&self, batch: Vec<NotificationDraft>) {
        *self.behaviour.lock().unwrap_or_else(|e| e.into_inner()) = StaticBehaviour::Batch(batch);
    }

    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.behaviour.lock().unwrap_or_else(|e| e.into_inner()) =
            StaticBehaviour::Fail(reason.into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> Category {
        self.category
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<NotificationDraft>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let behaviour = self
            .behaviour
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match behaviour {
            StaticBehaviour::Batch(batch) => Ok(batch.into_iter().take(limit).collect()),
            StaticBehaviour::Fail(reason) => Err(AdapterError::Message(reason)),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Shorthand for building drafts in tests and demos.
pub fn draft(category: Category, source_id: &str, timestamp: i64) -> NotificationDraft {
    NotificationDraft {
        category,
        source_id: source_id.to_string(),
        title: format!("New {category}"),
        message: format!("{category} {source_id}"),
        timestamp,
    }
}
