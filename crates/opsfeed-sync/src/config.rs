//! Engine configuration (environment) and the source registry (`sources.yaml`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use opsfeed_adapters::{FixtureSource, RestSource, SourceAdapter, SourceKind};
use opsfeed_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde::Deserialize;

use crate::dedup::DedupPolicy;
use crate::store::DEFAULT_STORE_CAP;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub state_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub poll_interval: Duration,
    pub min_poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub page_size: usize,
    pub store_cap: usize,
    pub dedup_policy: DedupPolicy,
    pub push_url: Option<String>,
    pub push_max_retries: usize,
    pub push_retry_delay: Duration,
    pub push_through_reconciler: bool,
    pub operator_role: String,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".to_string(),
            api_token: None,
            state_dir: PathBuf::from("./state"),
            workspace_root: PathBuf::from("."),
            poll_interval: Duration::from_secs(30),
            min_poll_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(15),
            page_size: 100,
            store_cap: DEFAULT_STORE_CAP,
            dedup_policy: DedupPolicy::Unbounded,
            push_url: None,
            push_max_retries: 5,
            push_retry_delay: Duration::from_millis(2_000),
            push_through_reconciler: false,
            operator_role: "admin".to_string(),
            user_agent: "opsfeed/0.1".to_string(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: env_nonempty("OPSFEED_API_BASE_URL").unwrap_or(defaults.api_base_url),
            api_token: env_nonempty("OPSFEED_API_TOKEN"),
            state_dir: env_nonempty("OPSFEED_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            workspace_root: env_nonempty("OPSFEED_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            poll_interval: env_parse("OPSFEED_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            min_poll_interval: env_parse("OPSFEED_MIN_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.min_poll_interval),
            fetch_timeout: env_parse("OPSFEED_FETCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            page_size: env_parse("OPSFEED_PAGE_SIZE").unwrap_or(defaults.page_size),
            store_cap: env_parse("OPSFEED_STORE_CAP").unwrap_or(defaults.store_cap),
            dedup_policy: env_parse("OPSFEED_DEDUP_CAP")
                .map(DedupPolicy::Capped)
                .unwrap_or(defaults.dedup_policy),
            push_url: env_nonempty("OPSFEED_PUSH_URL"),
            push_max_retries: env_parse("OPSFEED_PUSH_MAX_RETRIES")
                .unwrap_or(defaults.push_max_retries),
            push_retry_delay: env_parse("OPSFEED_PUSH_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.push_retry_delay),
            push_through_reconciler: env_flag("OPSFEED_PUSH_THROUGH_RECONCILER")
                .unwrap_or(defaults.push_through_reconciler),
            operator_role: env_nonempty("OPSFEED_OPERATOR_ROLE").unwrap_or(defaults.operator_role),
            user_agent: env_nonempty("OPSFEED_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.api_base_url.clone(),
            bearer_token: self.api_token.clone(),
            timeout: self.fetch_timeout,
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    pub path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for SourceRegistry {
    fn default() -> Self {
        let source = |source_id: &str, kind, path: &str| SourceConfig {
            source_id: source_id.to_string(),
            kind,
            path: path.to_string(),
            enabled: true,
            query: BTreeMap::new(),
        };
        Self {
            sources: vec![
                source("orders", SourceKind::Orders, "/orders"),
                source("reviews", SourceKind::Reviews, "/reviews"),
                source("questions", SourceKind::Questions, "/questions"),
                source("leads", SourceKind::Leads, "/leads"),
                source("bulk-rfqs", SourceKind::BulkRfqs, "/bulk-rfqs"),
            ],
        }
    }
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Built-in collections when no registry file exists.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Live REST adapters for every enabled source.
    pub fn rest_adapters(&self, http: Arc<HttpFetcher>) -> Vec<Arc<dyn SourceAdapter>> {
        self.enabled()
            .map(|s| {
                Arc::new(
                    RestSource::new(s.source_id.clone(), s.kind, s.path.clone(), Arc::clone(&http))
                        .with_query(s.query.clone()),
                ) as Arc<dyn SourceAdapter>
            })
            .collect()
    }

    /// Captured responses at `<dir>/<source_id>.json` instead of the live API.
    pub fn fixture_adapters(&self, dir: &Path) -> Vec<Arc<dyn SourceAdapter>> {
        self.enabled()
            .map(|s| {
                Arc::new(FixtureSource::new(
                    s.source_id.clone(),
                    s.kind,
                    dir.join(format!("{}.json", s.source_id)),
                )) as Arc<dyn SourceAdapter>
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsfeed_core::Category;

    #[test]
    fn default_registry_covers_every_category() {
        let registry = SourceRegistry::default();
        for category in Category::ALL {
            assert!(registry.enabled().any(|s| s.kind.category() == category));
        }
        let lead_sources = registry
            .enabled()
            .filter(|s| s.kind.category() == Category::Lead)
            .count();
        assert_eq!(lead_sources, 2);
    }

    #[test]
    fn registry_yaml_parses_with_defaults() {
        let registry = SourceRegistry::parse(
            r#"
sources:
  - source_id: orders
    kind: orders
    path: /admin/orders
    query:
      sort: -createdAt
  - source_id: bulk-rfqs
    kind: bulk_rfqs
    path: /bulk-rfqs
    enabled: false
"#,
        )
        .expect("parse");
        assert_eq!(registry.sources.len(), 2);
        assert!(registry.sources[0].enabled);
        assert_eq!(registry.sources[0].query["sort"], "-createdAt");
        assert_eq!(registry.enabled().count(), 1);
    }

    #[tokio::test]
    async fn missing_registry_falls_back_to_defaults() {
        let registry = SourceRegistry::load_or_default(Path::new("/nonexistent/sources.yaml"))
            .await
            .expect("defaults");
        assert_eq!(registry.sources.len(), 5);
    }

    #[test]
    fn config_defaults_match_reference_cadence() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.page_size, 100);
        assert_eq!(config.store_cap, 100);
        assert_eq!(config.dedup_policy, DedupPolicy::Unbounded);
        assert!(!config.push_through_reconciler);
    }
}
