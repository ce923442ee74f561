//! Notification reconciliation engine: polls the back-office collections,
//! deduplicates into a persisted feed and tracks what the operator has seen.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use opsfeed_storage::{FileKvStore, HttpFetcher, KeyValueStore};

pub mod checkpoints;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod live;
pub mod poller;
pub mod store;

pub use checkpoints::{checkpoint_key, BatchPulse, Checkpoints};
pub use config::{EngineConfig, SourceConfig, SourceRegistry};
pub use dedup::{DedupCache, DedupPolicy};
pub use engine::{
    EngineSettings, FeedState, NotificationEngine, PassReport, RefreshOutcome, SourceOutcome,
    SourceReport,
};
pub use live::{
    BroadcastChannel, LiveListener, OperatorSession, PushChannel, PushEvent, PushKind,
    ReconnectPolicy, Toast, ToastBoard, WebSocketChannel,
};
pub use poller::{Poller, PollerConfig, PollerHandle};
pub use store::{NotificationStore, PersistedFeed, DEFAULT_STORE_CAP, NOTIFICATIONS_KEY};

pub const CRATE_NAME: &str = "opsfeed-sync";

/// Build an initialised engine from config. With `fixtures_dir`, sources read
/// captured responses from disk instead of calling the API.
pub async fn build_engine(
    config: &EngineConfig,
    fixtures_dir: Option<&Path>,
) -> Result<Arc<NotificationEngine>> {
    let registry = SourceRegistry::load_or_default(&config.registry_path()).await?;
    let adapters = match fixtures_dir {
        Some(dir) => registry.fixture_adapters(dir),
        None => {
            let http = HttpFetcher::new(config.http_client_config())
                .context("building http client")?;
            registry.rest_adapters(Arc::new(http))
        }
    };
    let kv: Arc<dyn KeyValueStore> = Arc::new(FileKvStore::new(config.state_dir.clone()));
    let engine = Arc::new(NotificationEngine::new(config.into(), adapters, kv));
    engine.init().await;
    Ok(engine)
}

pub fn poller_config(config: &EngineConfig) -> PollerConfig {
    PollerConfig {
        interval: config.poll_interval,
        min_interval: config.min_poll_interval,
    }
}

/// Listener for the configured push URL, if any.
pub fn live_listener(
    config: &EngineConfig,
    engine: &Arc<NotificationEngine>,
    toasts: Arc<ToastBoard>,
) -> Option<LiveListener> {
    let url = config.push_url.as_ref()?;
    let listener = LiveListener::new(
        Arc::new(WebSocketChannel::new(url.clone())),
        toasts,
        ReconnectPolicy {
            max_retries: config.push_max_retries,
            delay: config.push_retry_delay,
        },
        config.operator_role.clone(),
    );
    Some(if config.push_through_reconciler {
        listener.reconciling_into(Arc::clone(engine))
    } else {
        listener
    })
}

pub async fn run_pass_once_from_env(fixtures_dir: Option<&Path>) -> Result<RefreshOutcome> {
    let config = EngineConfig::from_env();
    let engine = build_engine(&config, fixtures_dir).await?;
    let outcome = engine.refresh_now().await;
    engine.dispose();
    Ok(outcome)
}
