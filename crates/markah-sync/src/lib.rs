//! Sync engine: token upkeep, folder mapping, dedup/merge, the per-user run
//! state machine, and the sequential scheduler pass that drives it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use markah_adapters::{
    ExternalPlatform, PlatformError, TagProviderConfig, TagSuggester, XApiClient, XApiConfig,
    DEFAULT_MAX_RESULTS,
};
use markah_core::PassSummary;
use markah_storage::{build_http_client, HttpClientConfig, MemoryStore, PgStore, StoreError, SyncStore};
use thiserror::Error;
use tracing::info;

mod dedup;
mod folders;
mod lifecycle;
mod orchestrator;
mod scheduler;
mod tokens;

#[cfg(test)]
mod test_support;

pub use dedup::{make_title, normalize_url, Applied, DedupMerger, Resolution, MAX_AUTO_TAGS};
pub use folders::{FolderMapper, COLLECTION_CONFLICT_SUFFIX};
pub use lifecycle::{IntegrationService, IntegrationView};
pub use orchestrator::{RunGuard, RunPermit, SyncOrchestrator, RUN_IN_PROGRESS_MESSAGE};
pub use scheduler::{maybe_build_scheduler, SyncScheduler};
pub use tokens::TokenManager;

pub const CRATE_NAME: &str = "markah-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub max_results: usize,
    pub cron_secret: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_results: DEFAULT_MAX_RESULTS,
            cron_secret: None,
            scheduler_enabled: false,
            sync_cron: "0 */15 * * * *".to_string(),
            user_agent: "markah-sync/0.1".to_string(),
            http_timeout_secs: 20,
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            database_url: read("DATABASE_URL"),
            max_results: read("MAX_SYNC_BOOKMARKS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_results),
            cron_secret: read("CRON_SECRET"),
            scheduler_enabled: read("MARKAH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: read("SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: read("MARKAH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: read("MARKAH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            web_port: read("MARKAH_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("X account not connected")]
    NotConnected,
    #[error("token refresh failed: {0}")]
    TokenRefresh(#[source] PlatformError),
    #[error("{0}")]
    ExternalApi(#[source] PlatformError),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

/// Everything a host process needs: store, orchestrator, scheduler and the
/// settings-facing lifecycle operations, wired against one configuration.
#[derive(Clone)]
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub store: Arc<dyn SyncStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub scheduler: Arc<SyncScheduler>,
    pub integrations: IntegrationService,
}

impl SyncRuntime {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn SyncStore>,
        platform: Arc<dyn ExternalPlatform>,
        suggester: Arc<dyn TagSuggester>,
    ) -> Self {
        let orchestrator = Arc::new(
            SyncOrchestrator::new(store.clone(), platform, suggester)
                .with_max_results(config.max_results),
        );
        Self {
            scheduler: Arc::new(SyncScheduler::new(orchestrator.clone())),
            integrations: IntegrationService::new(orchestrator.clone()),
            config,
            store,
            orchestrator,
        }
    }

    /// Builds the runtime from the environment. `platform` overrides the live
    /// X client, e.g. with a fixture double.
    pub async fn from_env(platform: Option<Arc<dyn ExternalPlatform>>) -> Result<Self> {
        let config = SyncConfig::from_env();
        let store = open_store(&config).await?;

        let platform = match platform {
            Some(platform) => platform,
            None => {
                let x_config = XApiConfig::from_env()
                    .map_err(|err| SyncError::Configuration(err.to_string()))?
                    .with_http(config.http_config());
                let client =
                    XApiClient::new(x_config).map_err(|err| SyncError::Configuration(err.to_string()))?;
                Arc::new(client) as Arc<dyn ExternalPlatform>
            }
        };

        let http = build_http_client(&config.http_config())?;
        let suggester = TagProviderConfig::from_env().build(http);
        Ok(Self::new(config, store, platform, suggester))
    }
}

/// Postgres when `DATABASE_URL` is set, otherwise a process-local store.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn SyncStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<PassSummary> {
    let runtime = SyncRuntime::from_env(None).await?;
    runtime.scheduler.run_pass().await
}
