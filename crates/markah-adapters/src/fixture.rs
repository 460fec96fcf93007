use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use markah_core::{external_id_is_newer, ExternalCollection, ExternalItem};
use serde::{Deserialize, Serialize};

use crate::{ExternalPlatform, ItemsPageRequest, Page, PlatformError, TokenGrant, MAX_PAGE_SIZE};

/// Canned platform contents. Items are stored newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureFeed {
    #[serde(default)]
    pub items: Vec<ExternalItem>,
    #[serde(default)]
    pub collections: Vec<ExternalCollection>,
    #[serde(default)]
    pub memberships: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct FixtureState {
    feed: FixtureFeed,
    page_size: Option<usize>,
    items_rate_limited_after_pages: Option<usize>,
    items_failure: Option<u16>,
    collections_status: Option<u16>,
    membership_rate_limits: HashMap<String, usize>,
    membership_failures: HashMap<String, u16>,
    refresh_rejected: bool,
    refresh_grant: Option<TokenGrant>,
    refresh_calls: usize,
    item_page_calls: usize,
    requested_page_sizes: Vec<usize>,
    membership_calls: HashMap<String, usize>,
    access_tokens_seen: Vec<String>,
}

/// Deterministic in-process stand-in for the external platform.
#[derive(Debug, Default)]
pub struct FixturePlatform {
    state: Mutex<FixtureState>,
}

impl FixturePlatform {
    pub fn new(feed: FixtureFeed) -> Self {
        Self {
            state: Mutex::new(FixtureState {
                feed,
                ..Default::default()
            }),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let feed: FixtureFeed =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(feed))
    }

    fn with_state(self, apply: impl FnOnce(&mut FixtureState)) -> Self {
        apply(&mut self.lock());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Caps every page below the caller's requested size.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.with_state(|s| s.page_size = Some(page_size.max(1)))
    }

    /// Answer 429 on every saved-items page after `pages` successful ones.
    pub fn with_items_rate_limited_after_pages(self, pages: usize) -> Self {
        self.with_state(|s| s.items_rate_limited_after_pages = Some(pages))
    }

    pub fn with_items_failure(self, status: u16) -> Self {
        self.with_state(|s| s.items_failure = Some(status))
    }

    pub fn with_collections_status(self, status: u16) -> Self {
        self.with_state(|s| s.collections_status = Some(status))
    }

    /// Answer 429 to the first `count` membership requests for one collection.
    pub fn with_membership_rate_limits(self, collection_id: &str, count: usize) -> Self {
        self.with_state(|s| {
            s.membership_rate_limits
                .insert(collection_id.to_string(), count);
        })
    }

    /// Answer `status` to every membership request for one collection.
    pub fn with_membership_failure(self, collection_id: &str, status: u16) -> Self {
        self.with_state(|s| {
            s.membership_failures
                .insert(collection_id.to_string(), status);
        })
    }

    pub fn with_refresh_rejected(self) -> Self {
        self.with_state(|s| s.refresh_rejected = true)
    }

    pub fn with_refresh_grant(self, grant: TokenGrant) -> Self {
        self.with_state(|s| s.refresh_grant = Some(grant))
    }

    /// Replace the canned items, e.g. to simulate new saves between runs.
    pub fn set_items(&self, items: Vec<ExternalItem>) {
        self.lock().feed.items = items;
    }

    pub fn refresh_calls(&self) -> usize {
        self.lock().refresh_calls
    }

    pub fn item_page_calls(&self) -> usize {
        self.lock().item_page_calls
    }

    pub fn requested_page_sizes(&self) -> Vec<usize> {
        self.lock().requested_page_sizes.clone()
    }

    pub fn membership_calls(&self, collection_id: &str) -> usize {
        self.lock()
            .membership_calls
            .get(collection_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn access_tokens_seen(&self) -> Vec<String> {
        self.lock().access_tokens_seen.clone()
    }
}

fn offset_from(cursor: Option<&str>) -> Result<usize, PlatformError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| PlatformError::Decode(format!("bad fixture cursor {raw}"))),
    }
}

/// 429 surfaces as a rate limit, like the live client.
fn status_error(status: u16, endpoint: impl Into<String>) -> PlatformError {
    let endpoint = endpoint.into();
    if status == 429 {
        PlatformError::RateLimited { endpoint }
    } else {
        PlatformError::Status { status, endpoint }
    }
}

fn page_of<T: Clone>(all: &[T], offset: usize, size: usize) -> Page<T> {
    let end = (offset + size).min(all.len());
    let items = all.get(offset..end).map(<[T]>::to_vec).unwrap_or_default();
    let next_cursor = (end < all.len()).then(|| end.to_string());
    Page { items, next_cursor }
}

#[async_trait]
impl ExternalPlatform for FixturePlatform {
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        let mut state = self.lock();
        state.refresh_calls += 1;
        if state.refresh_rejected {
            return Err(PlatformError::TokenRejected {
                status: 400,
                body: "invalid_grant".to_string(),
            });
        }
        Ok(state.refresh_grant.clone().unwrap_or_else(|| TokenGrant {
            access_token: format!("fixture-access-{}", state.refresh_calls),
            refresh_token: format!("{refresh_token}-rotated"),
            expires_in: 7200,
        }))
    }

    async fn fetch_items_page(
        &self,
        request: ItemsPageRequest<'_>,
    ) -> Result<Page<ExternalItem>, PlatformError> {
        let mut state = self.lock();
        state.item_page_calls += 1;
        state.requested_page_sizes.push(request.page_size);
        state
            .access_tokens_seen
            .push(request.access_token.to_string());

        if let Some(status) = state.items_failure {
            return Err(status_error(status, "bookmarks"));
        }
        if let Some(limit) = state.items_rate_limited_after_pages {
            if state.item_page_calls > limit {
                return Err(PlatformError::RateLimited {
                    endpoint: "bookmarks".to_string(),
                });
            }
        }

        let visible = state
            .feed
            .items
            .iter()
            .filter(|item| {
                request
                    .since_id
                    .map_or(true, |since| external_id_is_newer(&item.external_id, since))
            })
            .cloned()
            .collect::<Vec<_>>();
        let size = request
            .page_size
            .min(MAX_PAGE_SIZE)
            .min(state.page_size.unwrap_or(MAX_PAGE_SIZE));
        Ok(page_of(&visible, offset_from(request.cursor)?, size))
    }

    async fn fetch_collections_page(
        &self,
        _access_token: &str,
        _account_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<ExternalCollection>, PlatformError> {
        let state = self.lock();
        if let Some(status) = state.collections_status {
            return Err(status_error(status, "bookmarks/folders"));
        }
        let size = state.page_size.unwrap_or(MAX_PAGE_SIZE);
        Ok(page_of(&state.feed.collections, offset_from(cursor)?, size))
    }

    async fn fetch_collection_items_page(
        &self,
        _access_token: &str,
        _account_id: &str,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<String>, PlatformError> {
        let mut state = self.lock();
        *state
            .membership_calls
            .entry(collection_id.to_string())
            .or_default() += 1;

        if let Some(&status) = state.membership_failures.get(collection_id) {
            return Err(status_error(status, format!("bookmarks/folders/{collection_id}")));
        }
        if let Some(remaining) = state.membership_rate_limits.get_mut(collection_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PlatformError::RateLimited {
                    endpoint: format!("bookmarks/folders/{collection_id}"),
                });
            }
        }

        let ids = state
            .feed
            .memberships
            .get(collection_id)
            .cloned()
            .unwrap_or_default();
        let size = state.page_size.unwrap_or(MAX_PAGE_SIZE);
        Ok(page_of(&ids, offset_from(cursor)?, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_fixture_feed_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "items": [{{
                    "external_id": "11",
                    "text": "hello",
                    "author_handle": "writer",
                    "author_name": "Writer",
                    "created_at": null,
                    "url": "https://x.com/writer/status/11"
                }}],
                "collections": [{{ "id": "c1", "name": "Reading" }}]
            }}"#
        )
        .unwrap();

        let platform = FixturePlatform::from_json_file(file.path()).unwrap();
        let state = platform.lock();
        assert_eq!(state.feed.items.len(), 1);
        assert_eq!(state.feed.collections[0].name, "Reading");
        assert!(state.feed.memberships.is_empty());
    }

    #[test]
    fn pages_carry_offset_cursors() {
        let all = vec![1, 2, 3, 4, 5];
        let first = page_of(&all, 0, 2);
        assert_eq!(first.items, vec![1, 2]);
        assert_eq!(first.next_cursor.as_deref(), Some("2"));
        let last = page_of(&all, 4, 2);
        assert_eq!(last.items, vec![5]);
        assert!(last.next_cursor.is_none());
    }

    #[tokio::test]
    async fn scripted_statuses_map_like_the_live_client() {
        let platform = FixturePlatform::default()
            .with_collections_status(429)
            .with_membership_failure("c1", 500);
        assert!(matches!(
            platform.fetch_collections_page("t", "42", None).await,
            Err(PlatformError::RateLimited { .. })
        ));
        assert!(matches!(
            platform.fetch_collection_items_page("t", "42", "c1", None).await,
            Err(PlatformError::Status { status: 500, .. })
        ));
        assert_eq!(platform.membership_calls("c1"), 1);
    }

    #[tokio::test]
    async fn refresh_rotates_tokens_unless_rejected() {
        let ok = FixturePlatform::default();
        let grant = ok.refresh_token("r1").await.unwrap();
        assert_eq!(grant.refresh_token, "r1-rotated");
        assert_eq!(ok.refresh_calls(), 1);

        let rejected = FixturePlatform::default().with_refresh_rejected();
        assert!(matches!(
            rejected.refresh_token("r1").await,
            Err(PlatformError::TokenRejected { .. })
        ));
    }
}
