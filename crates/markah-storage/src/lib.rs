//! Persistence boundary + HTTP retry utilities for the Markah sync engine.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use markah_core::{
    Bookmark, BookmarkSource, Folder, FolderLink, Integration, IntegrationGrant, NewBookmark,
    NewFolder, SyncStatus, Tag,
};
use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "markah-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Folder-link change applied together with a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderLinkChange {
    Keep,
    Add(Uuid),
    Replace { from: Uuid, to: Uuid },
}

/// Everything a merge writes, committed as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub bookmark_id: Uuid,
    pub source: BookmarkSource,
    pub external_id: String,
    pub folder_change: FolderLinkChange,
}

/// Records consumed and produced by the sync engine.
///
/// Every method is a single atomic unit; the orchestrator relies on this to
/// claim no progress for an item whose write failed.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    // Integrations
    async fn upsert_integration(
        &self,
        user_id: Uuid,
        grant: &IntegrationGrant,
    ) -> StoreResult<Integration>;
    async fn get_integration(&self, user_id: Uuid) -> StoreResult<Option<Integration>>;
    async fn list_sync_enabled_integrations(&self) -> StoreResult<Vec<Integration>>;
    async fn update_tokens(
        &self,
        user_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn set_cursor(&self, user_id: Uuid, external_id: &str) -> StoreResult<()>;
    /// Increments `retry_count` by one and returns the new value.
    async fn record_run_failure(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        error: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<i32>;
    async fn record_run_success(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn set_sync_enabled(&self, user_id: Uuid, enabled: bool) -> StoreResult<()>;
    async fn pause_integration(&self, user_id: Uuid, message: &str) -> StoreResult<()>;
    /// Clears `retry_count`/`last_error` and re-enables sync.
    async fn reset_failures(&self, user_id: Uuid) -> StoreResult<()>;
    /// Removes the integration, releases sync-managed folders and drops the status row.
    async fn delete_integration(&self, user_id: Uuid) -> StoreResult<bool>;

    // Bookmarks
    async fn get_bookmark(&self, bookmark_id: Uuid) -> StoreResult<Option<Bookmark>>;
    async fn find_bookmark_by_external_id(
        &self,
        user_id: Uuid,
        external_id: &str,
    ) -> StoreResult<Option<Bookmark>>;
    async fn list_bookmarks(&self, user_id: Uuid) -> StoreResult<Vec<Bookmark>>;
    async fn insert_bookmark(
        &self,
        bookmark: &NewBookmark,
        folder_id: Option<Uuid>,
    ) -> StoreResult<Bookmark>;
    async fn apply_merge(&self, plan: &MergePlan) -> StoreResult<()>;
    async fn link_folder(&self, bookmark_id: Uuid, folder_id: Uuid) -> StoreResult<()>;
    async fn bookmark_folder_links(&self, bookmark_id: Uuid) -> StoreResult<Vec<FolderLink>>;
    async fn bookmark_tags(&self, bookmark_id: Uuid) -> StoreResult<Vec<Tag>>;
    /// Upserts the tag by `(user, name)` and links it; an existing link is not an error.
    async fn attach_tag(&self, user_id: Uuid, bookmark_id: Uuid, name: &str) -> StoreResult<Tag>;

    // Folders
    async fn find_root_folder_by_name(&self, user_id: Uuid, name: &str)
        -> StoreResult<Option<Folder>>;
    async fn find_folder_by_collection(
        &self,
        user_id: Uuid,
        collection_id: &str,
    ) -> StoreResult<Option<Folder>>;
    async fn find_unmanaged_folder(
        &self,
        user_id: Uuid,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> StoreResult<Option<Folder>>;
    async fn create_folder(&self, folder: &NewFolder) -> StoreResult<Folder>;
    async fn mark_folder_sync_managed(&self, folder_id: Uuid) -> StoreResult<()>;
    async fn list_folders(&self, user_id: Uuid) -> StoreResult<Vec<Folder>>;

    // Sync status
    async fn upsert_sync_status(&self, status: &SyncStatus) -> StoreResult<()>;
    async fn get_sync_status(&self, user_id: Uuid) -> StoreResult<Option<SyncStatus>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    /// No waiting between attempts; used by tests and fixture runs.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}
