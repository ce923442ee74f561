//! The reconciliation engine: one explicit instance owning the dedup cache,
//! the notification store and the seen checkpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use opsfeed_adapters::{draft_from_entity, SourceAdapter};
use opsfeed_core::{now_millis, recompute_counts, Category, Counts, Notification, NotificationDraft};
use opsfeed_storage::KeyValueStore;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoints::{BatchPulse, Checkpoints};
use crate::config::EngineConfig;
use crate::dedup::{DedupCache, DedupPolicy};
use crate::live::PushEvent;
use crate::store::{load_feed, save_feed, NotificationStore};

/// What consumers render: badge counts plus the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedState {
    pub counts: Counts,
    pub items: Vec<Notification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Fetched { fetched: usize, created: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub category: Category,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub run_id: Uuid,
    pub sources: Vec<SourceReport>,
    pub created: usize,
    pub evicted: usize,
    pub counts: Counts,
}

impl PassReport {
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources
            .iter()
            .filter(|s| matches!(s.outcome, SourceOutcome::Failed { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Completed(PassReport),
    AlreadyInFlight,
    Disposed,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub page_size: usize,
    pub store_cap: usize,
    pub fetch_timeout: Duration,
    pub dedup_policy: DedupPolicy,
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            page_size: config.page_size,
            store_cap: config.store_cap,
            fetch_timeout: config.fetch_timeout,
            dedup_policy: config.dedup_policy,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        (&EngineConfig::default()).into()
    }
}

/// Everything the dedup invariant spans. Only ever touched under one lock.
#[derive(Debug)]
struct FeedCore {
    dedup: DedupCache,
    store: NotificationStore,
    counts: Counts,
    checkpoints: Checkpoints,
    pulses: HashMap<Category, BatchPulse>,
}

impl FeedCore {
    fn empty(settings: &EngineSettings) -> Self {
        Self {
            dedup: DedupCache::new(settings.dedup_policy),
            store: NotificationStore::new(settings.store_cap),
            counts: Counts::default(),
            checkpoints: Checkpoints::default(),
            pulses: HashMap::new(),
        }
    }

    fn recount(&mut self) {
        self.counts = recompute_counts(self.store.items());
    }

    /// Dedup-filter drafts into fresh notifications, in batch order.
    fn admit(&mut self, drafts: Vec<NotificationDraft>) -> Vec<Notification> {
        let mut admitted = Vec::new();
        for draft in drafts {
            if self.dedup.has(draft.category, &draft.source_id) {
                continue;
            }
            self.dedup.add(draft.category, &draft.source_id);
            admitted.push(draft.into_notification());
        }
        admitted
    }
}

type FetchResult = (String, Category, Result<Vec<NotificationDraft>, String>);

pub struct NotificationEngine {
    settings: EngineSettings,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    kv: Arc<dyn KeyValueStore>,
    core: Mutex<FeedCore>,
    in_flight: Mutex<()>,
    last_fetch: std::sync::Mutex<Option<Instant>>,
    disposed: AtomicBool,
    visible: watch::Sender<bool>,
}

impl NotificationEngine {
    pub fn new(
        settings: EngineSettings,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (visible, _) = watch::channel(true);
        Self {
            core: Mutex::new(FeedCore::empty(&settings)),
            settings,
            adapters,
            kv,
            in_flight: Mutex::new(()),
            last_fetch: std::sync::Mutex::new(None),
            disposed: AtomicBool::new(false),
            visible,
        }
    }

    /// Restore the store and checkpoints, then rebuild the dedup cache from
    /// every restored record so a reload never re-notifies.
    pub async fn init(&self) {
        let mut core = self.core.lock().await;
        let items = match load_feed(self.kv.as_ref()).await {
            Ok(Some(feed)) => feed.items,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "persisted feed unreadable; starting empty");
                Vec::new()
            }
        };
        let (store, discarded) = NotificationStore::restore(self.settings.store_cap, items);
        if discarded > 0 {
            warn!(discarded, "dropped duplicate or over-cap records while restoring feed");
        }
        core.dedup = DedupCache::rebuild(self.settings.dedup_policy, store.items().iter());
        core.store = store;
        core.checkpoints = Checkpoints::load(self.kv.as_ref()).await;
        core.pulses.clear();
        core.recount();
        self.disposed.store(false, Ordering::SeqCst);
        info!(
            restored = core.store.len(),
            dedup_keys = core.dedup.len(),
            unread = core.counts.total(),
            "notification engine initialised"
        );
    }

    /// Stop accepting results. An in-flight pass finishes fetching but its
    /// batch is discarded. Sources are closed and stay closed.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            for adapter in &self.adapters {
                adapter.close();
            }
            info!("notification engine disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> FeedState {
        let core = self.core.lock().await;
        FeedState {
            counts: core.counts,
            items: core.store.items().to_vec(),
        }
    }

    /// Same snapshot as `state`, items ordered newest `timestamp` first.
    pub async fn sorted_state(&self) -> FeedState {
        let core = self.core.lock().await;
        FeedState {
            counts: core.counts,
            items: core.store.sorted_newest_first(),
        }
    }

    /// Checkpoint-based "new since last view" per category.
    pub async fn fresh_counts(&self) -> HashMap<Category, usize> {
        let core = self.core.lock().await;
        Category::ALL
            .iter()
            .map(|&category| {
                let pulse = core.pulses.get(&category).cloned().unwrap_or_default();
                (category, core.checkpoints.fresh(category, &pulse))
            })
            .collect()
    }

    pub async fn dedup_contains(&self, category: Category, source_id: &str) -> bool {
        self.core.lock().await.dedup.has(category, source_id)
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.send_if_modified(|current| {
            let changed = *current != visible;
            *current = visible;
            changed
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }

    pub fn visibility(&self) -> watch::Receiver<bool> {
        self.visible.subscribe()
    }

    /// `true` once `min_interval` has passed since the last pass started
    /// fetching, or if none has yet.
    pub fn poll_due(&self, min_interval: Duration) -> bool {
        let last = *self.last_fetch.lock().unwrap_or_else(|e| e.into_inner());
        last.map_or(true, |at| at.elapsed() >= min_interval)
    }

    /// Run one reconciliation pass unless one is already running.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        if self.is_disposed() {
            return RefreshOutcome::Disposed;
        }
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("reconciliation already in flight; skipping");
            return RefreshOutcome::AlreadyInFlight;
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id);
        async {
            *self.last_fetch.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            let results = self.fetch_all().await;

            if self.is_disposed() {
                debug!("engine disposed during fetch; dropping batch");
                return RefreshOutcome::Disposed;
            }
            RefreshOutcome::Completed(self.apply(run_id, results).await)
        }
        .instrument(span)
        .await
    }

    /// Fan out to every source; each one settles independently.
    async fn fetch_all(&self) -> Vec<FetchResult> {
        let limit = self.settings.page_size;
        let timeout = self.settings.fetch_timeout;
        join_all(self.adapters.iter().map(|adapter| async move {
            let source_id = adapter.source_id().to_string();
            let category = adapter.category();
            let result = match tokio::time::timeout(timeout, adapter.fetch(limit)).await {
                Ok(Ok(drafts)) => Ok(drafts),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            };
            (source_id, category, result)
        }))
        .await
    }

    async fn apply(&self, run_id: Uuid, results: Vec<FetchResult>) -> PassReport {
        let mut core = self.core.lock().await;
        let mut reports = Vec::with_capacity(results.len());
        let mut admitted = Vec::new();
        let mut pulses: HashMap<Category, BatchPulse> = HashMap::new();
        let mut failed_categories = Vec::new();

        for (source_id, category, result) in results {
            match result {
                Ok(drafts) => {
                    let fetched = drafts.len();
                    pulses
                        .entry(category)
                        .or_default()
                        .absorb(drafts.iter().map(|d| d.timestamp));
                    let fresh = core.admit(drafts);
                    reports.push(SourceReport {
                        source_id,
                        category,
                        outcome: SourceOutcome::Fetched {
                            fetched,
                            created: fresh.len(),
                        },
                    });
                    admitted.extend(fresh);
                }
                Err(reason) => {
                    warn!(%source_id, %category, %reason, "source fetch failed; skipping this cycle");
                    failed_categories.push(category);
                    reports.push(SourceReport {
                        source_id,
                        category,
                        outcome: SourceOutcome::Failed { reason },
                    });
                }
            }
        }

        // a category with any failed source keeps its previous pulse
        for (category, pulse) in pulses {
            if !failed_categories.contains(&category) {
                core.pulses.insert(category, pulse);
            }
        }

        let created = admitted.len();
        core.store.prepend(admitted);
        let evicted = core.store.trim();
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "trimmed oldest notifications; dedup keys retained");
        }
        core.recount();
        self.persist_feed(&core).await;

        info!(created, evicted = evicted.len(), unread = core.counts.total(), "reconciliation pass complete");
        PassReport {
            run_id,
            sources: reports,
            created,
            evicted: evicted.len(),
            counts: core.counts,
        }
    }

    /// Treat a pushed entity as a one-entity poll result. Returns the created
    /// notification, if any.
    pub async fn ingest_push(&self, event: &PushEvent) -> Option<Notification> {
        if self.is_disposed() {
            return None;
        }
        let category = event.kind.category();
        let draft = draft_from_entity(category, &event.data, now_millis())?;
        let mut core = self.core.lock().await;
        let created = core.admit(vec![draft]).pop()?;
        core.store.prepend(vec![created.clone()]);
        core.store.trim();
        core.recount();
        self.persist_feed(&core).await;
        debug!(id = %created.id, "push event reconciled into feed");
        Some(created)
    }

    /// Returns `false` for an unknown id.
    pub async fn mark_as_read(&self, id: &str) -> bool {
        let mut core = self.core.lock().await;
        let Some(category) = core.store.mark_read(id) else {
            return false;
        };
        core.recount();
        self.persist_feed(&core).await;
        debug!(%id, %category, unread = core.counts.get(category), "marked notification read");
        true
    }

    pub async fn mark_all_as_read(&self) {
        let mut core = self.core.lock().await;
        let flipped = core.store.mark_all_read();
        core.recount();
        self.persist_feed(&core).await;
        debug!(flipped, "marked all notifications read");
    }

    /// Reset the category's "new since last view" counter without touching
    /// read flags.
    pub async fn mark_category_as_seen(&self, category: Category) {
        let mut core = self.core.lock().await;
        let pulse = core.pulses.get(&category).cloned();
        let value = core
            .checkpoints
            .mark_seen(category, pulse.as_ref(), now_millis());
        if let Err(err) = core.checkpoints.save(self.kv.as_ref(), category).await {
            warn!(%category, error = %err, "failed to persist seen checkpoint");
        }
        debug!(%category, ?value, "category checkpoint updated");
    }

    async fn persist_feed(&self, core: &FeedCore) {
        if let Err(err) = save_feed(self.kv.as_ref(), &core.store, now_millis()).await {
            warn!(error = %err, "failed to persist notification feed; keeping in-memory state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use opsfeed_adapters::{draft, StaticSource};
    use opsfeed_storage::{MemoryKvStore, StorageError};

    fn settings(store_cap: usize) -> EngineSettings {
        EngineSettings {
            store_cap,
            ..EngineSettings::default()
        }
    }

    fn engine_with(sources: Vec<Arc<StaticSource>>, store_cap: usize) -> NotificationEngine {
        let adapters = sources
            .into_iter()
            .map(|s| s as Arc<dyn SourceAdapter>)
            .collect();
        NotificationEngine::new(settings(store_cap), adapters, Arc::new(MemoryKvStore::new()))
    }

    fn completed(outcome: RefreshOutcome) -> PassReport {
        match outcome {
            RefreshOutcome::Completed(report) => report,
            other => panic!("expected completed pass, got {other:?}"),
        }
    }

    struct BrokenKv;

    #[async_trait]
    impl KeyValueStore for BrokenKv {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Io {
                key: key.to_string(),
                source: std::io::Error::other("disk gone"),
            })
        }
        async fn set(&self, key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Io {
                key: key.to_string(),
                source: std::io::Error::other("quota exceeded"),
            })
        }
        async fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn overlapping_batches_never_duplicate() {
        let reviews = Arc::new(StaticSource::new("reviews", Category::Review).with_batch(vec![
            draft(Category::Review, "r1", 1),
            draft(Category::Review, "r2", 2),
        ]));
        let engine = engine_with(vec![Arc::clone(&reviews)], 100);
        engine.init().await;

        completed(engine.refresh_now().await);
        reviews.set_batch(vec![
            draft(Category::Review, "r2", 2),
            draft(Category::Review, "r3", 3),
        ]);
        let second = completed(engine.refresh_now().await);
        completed(engine.refresh_now().await);

        assert_eq!(second.created, 1);
        let state = engine.state().await;
        assert_eq!(state.items.len(), 3);
        assert_eq!(state.counts.review, 3);
    }

    #[tokio::test]
    async fn read_records_still_block_renotification() {
        let reviews = Arc::new(
            StaticSource::new("reviews", Category::Review)
                .with_batch(vec![draft(Category::Review, "r1", 1)]),
        );
        let engine = engine_with(vec![reviews], 100);
        engine.init().await;
        completed(engine.refresh_now().await);
        engine.mark_all_as_read().await;

        let report = completed(engine.refresh_now().await);
        assert_eq!(report.created, 0);
        assert_eq!(engine.state().await.counts.review, 0);
    }

    #[tokio::test]
    async fn timeout_counts_as_a_source_failure() {
        tokio::time::pause();
        let slow = Arc::new(
            StaticSource::new("orders", Category::Order)
                .with_batch(vec![draft(Category::Order, "o1", 1)])
                .with_delay(Duration::from_secs(60)),
        );
        let fast = Arc::new(
            StaticSource::new("leads", Category::Lead)
                .with_batch(vec![draft(Category::Lead, "l1", 1)]),
        );
        let engine = NotificationEngine::new(
            EngineSettings {
                fetch_timeout: Duration::from_secs(5),
                ..EngineSettings::default()
            },
            vec![slow as Arc<dyn SourceAdapter>, fast as Arc<dyn SourceAdapter>],
            Arc::new(MemoryKvStore::new()),
        );
        engine.init().await;

        let report = completed(engine.refresh_now().await);
        assert_eq!(report.failed_sources().count(), 1);
        assert_eq!(report.created, 1);
        assert!(engine.dedup_contains(Category::Lead, "l1").await);
        assert!(!engine.dedup_contains(Category::Order, "o1").await);
    }

    #[tokio::test]
    async fn results_arriving_after_dispose_are_dropped() {
        tokio::time::pause();
        let slow = Arc::new(
            StaticSource::new("reviews", Category::Review)
                .with_batch(vec![draft(Category::Review, "r1", 1)])
                .with_delay(Duration::from_millis(500)),
        );
        let engine = Arc::new(engine_with(vec![Arc::clone(&slow)], 100));
        engine.init().await;

        let pass = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.refresh_now().await }
        });
        tokio::task::yield_now().await;
        engine.dispose();

        assert_eq!(pass.await.unwrap(), RefreshOutcome::Disposed);
        assert!(slow.is_closed());
        assert!(engine.state().await.items.is_empty());
        assert_eq!(engine.refresh_now().await, RefreshOutcome::Disposed);
    }

    #[tokio::test]
    async fn persistence_failures_are_not_fatal() {
        let reviews = Arc::new(
            StaticSource::new("reviews", Category::Review)
                .with_batch(vec![draft(Category::Review, "r1", 1)]),
        );
        let engine = NotificationEngine::new(
            EngineSettings::default(),
            vec![reviews as Arc<dyn SourceAdapter>],
            Arc::new(BrokenKv),
        );
        engine.init().await;
        completed(engine.refresh_now().await);
        assert!(engine.mark_as_read("review-r1-1").await);
        assert_eq!(engine.state().await.counts.review, 0);
    }

    #[tokio::test]
    async fn seen_checkpoint_is_independent_of_read_flags() {
        let questions = Arc::new(StaticSource::new("questions", Category::Question).with_batch(vec![
            draft(Category::Question, "q1", 1),
            draft(Category::Question, "q2", 2),
        ]));
        let engine = engine_with(vec![Arc::clone(&questions)], 100);
        engine.init().await;
        completed(engine.refresh_now().await);

        assert_eq!(engine.fresh_counts().await[&Category::Question], 2);
        engine.mark_category_as_seen(Category::Question).await;
        engine.mark_category_as_seen(Category::Question).await;
        assert_eq!(engine.fresh_counts().await[&Category::Question], 0);
        assert_eq!(engine.state().await.counts.question, 2);

        questions.set_batch(vec![
            draft(Category::Question, "q1", 1),
            draft(Category::Question, "q2", 2),
            draft(Category::Question, "q3", 3),
        ]);
        completed(engine.refresh_now().await);
        assert_eq!(engine.fresh_counts().await[&Category::Question], 1);
    }

    #[tokio::test]
    async fn hidden_flag_round_trips_through_watch() {
        let engine = engine_with(vec![], 100);
        let mut rx = engine.visibility();
        assert!(engine.is_visible());
        engine.set_visible(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        engine.set_visible(false);
        assert!(!rx.has_changed().unwrap());
    }
}
