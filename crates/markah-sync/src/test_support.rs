//! Shared fixtures for the engine's unit tests.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use markah_adapters::{FixtureFeed, FixturePlatform, NoopTagSuggester, TagSuggester};
use markah_core::{ExternalItem, Integration, IntegrationGrant};
use markah_storage::{BackoffPolicy, MemoryStore, SyncStore};
use uuid::Uuid;

use crate::{DedupMerger, FolderMapper, SyncOrchestrator, TokenManager};

pub(crate) fn item(id: u64) -> ExternalItem {
    ExternalItem {
        external_id: id.to_string(),
        text: format!("post number {id}"),
        author_handle: "writer".into(),
        author_name: "Writer".into(),
        created_at: None,
        url: format!("https://x.com/writer/status/{id}"),
    }
}

pub(crate) fn feed(ids: impl IntoIterator<Item = u64>) -> FixtureFeed {
    FixtureFeed {
        items: ids.into_iter().map(item).collect(),
        ..Default::default()
    }
}

/// Returns canned tags, or fails every call.
pub(crate) struct StaticSuggester {
    tags: Vec<String>,
    fail: bool,
}

impl StaticSuggester {
    pub(crate) fn tags(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            fail: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            tags: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl TagSuggester for StaticSuggester {
    fn provider_id(&self) -> &'static str {
        "static"
    }

    async fn suggest_tags(&self, _title: &str, _description: &str, _url: &str) -> Result<Vec<String>> {
        if self.fail {
            return Err(anyhow!("provider unavailable"));
        }
        Ok(self.tags.clone())
    }
}

pub(crate) struct Harness {
    pub platform: Arc<FixturePlatform>,
    pub store: Arc<MemoryStore>,
    pub suggester: Arc<dyn TagSuggester>,
    pub user_id: Uuid,
}

impl Harness {
    /// A memory store with one connected, unexpired integration.
    pub(crate) async fn new(platform: FixturePlatform) -> Self {
        let harness = Self {
            platform: Arc::new(platform),
            store: Arc::new(MemoryStore::new()),
            suggester: Arc::new(NoopTagSuggester),
            user_id: Uuid::new_v4(),
        };
        harness.connect(harness.user_id).await;
        harness
    }

    pub(crate) fn with_suggester(mut self, suggester: Arc<dyn TagSuggester>) -> Self {
        self.suggester = suggester;
        self
    }

    async fn connect(&self, user_id: Uuid) {
        self.store
            .upsert_integration(
                user_id,
                &IntegrationGrant {
                    external_account_id: "42".into(),
                    external_handle: "reader".into(),
                    access_token: "stored-access".into(),
                    refresh_token: "stored-refresh".into(),
                    expires_at: Utc::now() + Duration::hours(2),
                },
            )
            .await
            .unwrap();
    }

    pub(crate) async fn connect_another_user(&self) -> Uuid {
        let user_id = Uuid::new_v4();
        self.connect(user_id).await;
        user_id
    }

    pub(crate) fn store_dyn(&self) -> Arc<dyn SyncStore> {
        self.store.clone()
    }

    pub(crate) fn tokens(&self) -> TokenManager {
        TokenManager::new(self.platform.clone(), self.store_dyn())
    }

    pub(crate) fn folders(&self) -> FolderMapper {
        FolderMapper::new(self.store_dyn())
    }

    pub(crate) fn merger(&self) -> DedupMerger {
        DedupMerger::new(self.store_dyn(), self.suggester.clone())
    }

    pub(crate) fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(self.store_dyn(), self.platform.clone(), self.suggester.clone())
            .with_membership_backoff(BackoffPolicy::immediate(3))
    }

    pub(crate) async fn integration(&self) -> Integration {
        self.store
            .get_integration(self.user_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub(crate) async fn expire_token(&self) {
        let current = self.integration().await;
        self.store
            .update_tokens(
                self.user_id,
                &current.access_token,
                &current.refresh_token,
                Utc::now() - Duration::minutes(1),
            )
            .await
            .unwrap();
    }
}
