//! External platform contracts, the live X client, a fixture-first double,
//! and the paginating feed client the sync engine talks to.

use std::sync::Arc;

use async_trait::async_trait;
use markah_core::{ExternalCollection, ExternalItem};
use markah_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

mod fixture;
mod tags;
mod x_api;

pub use fixture::{FixtureFeed, FixturePlatform};
pub use tags::{
    build_user_prompt, parse_tags, AnthropicTagSuggester, NoopTagSuggester,
    OllamaTagSuggester, OpenAiTagSuggester, TagProviderConfig, TagSuggester,
};
pub use x_api::{XApiClient, XApiConfig, DEFAULT_X_API_BASE_URL};

pub const CRATE_NAME: &str = "markah-adapters";

/// Largest page the saved-items endpoint accepts.
pub const MAX_PAGE_SIZE: usize = 100;

/// Default `max_results` for one feed fetch.
pub const DEFAULT_MAX_RESULTS: usize = 50;

/// Upper bound on item ids read from a single collection.
pub const MAX_COLLECTION_ITEM_IDS: usize = 500;

/// Upper bound on collection-list pages read per run.
const MAX_COLLECTION_LIST_PAGES: usize = 10;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("rate limited by {endpoint}")]
    RateLimited { endpoint: String },
    #[error("X API error: {status} for {endpoint}")]
    Status { status: u16, endpoint: String },
    #[error("refresh grant rejected ({status}): {body}")]
    TokenRejected { status: u16, body: String },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// 403/404: the feature is not available for this account.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Status { status: 403 | 404, .. })
    }
}

/// Tokens returned by a refresh-token grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ItemsPageRequest<'a> {
    pub access_token: &'a str,
    pub account_id: &'a str,
    pub since_id: Option<&'a str>,
    pub page_size: usize,
    pub cursor: Option<&'a str>,
}

/// Page-level capability of an external platform.
///
/// A 429 is reported as [`PlatformError::RateLimited`]; pagination policy
/// lives in [`FeedClient`], so every implementation shares it.
#[async_trait]
pub trait ExternalPlatform: Send + Sync {
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError>;

    async fn fetch_items_page(
        &self,
        request: ItemsPageRequest<'_>,
    ) -> Result<Page<ExternalItem>, PlatformError>;

    async fn fetch_collections_page(
        &self,
        access_token: &str,
        account_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<ExternalCollection>, PlatformError>;

    async fn fetch_collection_items_page(
        &self,
        access_token: &str,
        account_id: &str,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<String>, PlatformError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchItemsResult {
    /// Newest first, as the platform returns them.
    pub items: Vec<ExternalItem>,
    pub has_more: bool,
    /// Pagination stopped on a 429.
    pub rate_limited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionsResult {
    pub collections: Vec<ExternalCollection>,
    /// 403/404: collections are not offered for this account.
    pub unavailable: bool,
    /// Listing stopped early on a rate limit or transient failure.
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionMembership {
    pub item_ids: Vec<String>,
    pub failed: bool,
}

/// Paginated retrieval of saved items and collections.
#[derive(Clone)]
pub struct FeedClient {
    platform: Arc<dyn ExternalPlatform>,
    membership_backoff: BackoffPolicy,
}

impl FeedClient {
    pub fn new(platform: Arc<dyn ExternalPlatform>) -> Self {
        Self {
            platform,
            membership_backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_membership_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.membership_backoff = backoff;
        self
    }

    pub async fn fetch_items(
        &self,
        access_token: &str,
        account_id: &str,
        since_id: Option<&str>,
        max_results: usize,
    ) -> Result<FetchItemsResult, PlatformError> {
        let mut result = FetchItemsResult::default();
        let mut cursor: Option<String> = None;

        while result.items.len() < max_results {
            let page_size = (max_results - result.items.len()).min(MAX_PAGE_SIZE);
            let request = ItemsPageRequest {
                access_token,
                account_id,
                since_id,
                page_size,
                cursor: cursor.as_deref(),
            };

            let page = match self.platform.fetch_items_page(request).await {
                Ok(page) => page,
                Err(err) if err.is_rate_limited() => {
                    warn!(
                        collected = result.items.len(),
                        "saved-items feed rate limited; returning partial page set"
                    );
                    result.has_more = true;
                    result.rate_limited = true;
                    break;
                }
                Err(err) => return Err(err),
            };

            if page.items.is_empty() {
                result.has_more = false;
                break;
            }

            for item in page.items {
                result.items.push(item);
                if result.items.len() >= max_results {
                    break;
                }
            }

            match page.next_cursor {
                Some(next) if result.items.len() < max_results => {
                    cursor = Some(next);
                    result.has_more = true;
                }
                Some(_) => {
                    result.has_more = true;
                    break;
                }
                None => {
                    result.has_more = false;
                    break;
                }
            }
        }

        debug!(
            items = result.items.len(),
            has_more = result.has_more,
            "fetched saved items"
        );
        Ok(result)
    }

    pub async fn fetch_collections(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> CollectionsResult {
        let mut result = CollectionsResult::default();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_COLLECTION_LIST_PAGES {
            match self
                .platform
                .fetch_collections_page(access_token, account_id, cursor.as_deref())
                .await
            {
                Ok(page) => {
                    result.collections.extend(page.items);
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => return result,
                    }
                }
                Err(err) if err.is_unavailable() => {
                    debug!(%err, "collections unavailable for account");
                    result.unavailable = true;
                    return result;
                }
                Err(err) => {
                    warn!(%err, "collection listing failed; folder placement degraded");
                    result.failed = true;
                    return result;
                }
            }
        }
        result
    }

    pub async fn fetch_item_ids_in_collection(
        &self,
        access_token: &str,
        account_id: &str,
        collection_id: &str,
    ) -> Result<CollectionMembership, PlatformError> {
        let mut membership = CollectionMembership::default();
        let mut cursor: Option<String> = None;

        loop {
            let mut attempt = 0usize;
            let page = loop {
                match self
                    .platform
                    .fetch_collection_items_page(
                        access_token,
                        account_id,
                        collection_id,
                        cursor.as_deref(),
                    )
                    .await
                {
                    Ok(page) => break page,
                    Err(err) if err.is_rate_limited() => {
                        if attempt >= self.membership_backoff.max_retries {
                            warn!(collection_id, attempts = attempt + 1, "collection rate limited; skipping");
                            membership.failed = true;
                            return Ok(membership);
                        }
                        tokio::time::sleep(self.membership_backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                    Err(err) if err.is_unavailable() => {
                        warn!(collection_id, %err, "collection membership unavailable; skipping");
                        membership.failed = true;
                        return Ok(membership);
                    }
                    Err(err) => return Err(err),
                }
            };

            membership.item_ids.extend(page.items);
            if membership.item_ids.len() >= MAX_COLLECTION_ITEM_IDS {
                membership.item_ids.truncate(MAX_COLLECTION_ITEM_IDS);
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(membership)
    }
}
