use std::sync::Arc;

use markah_adapters::TagSuggester;
use markah_core::{Bookmark, BookmarkSource, ExternalItem, NewBookmark};
use markah_storage::{FolderLinkChange, MergePlan, StoreResult, SyncStore};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, Instrument};
use uuid::Uuid;

/// Suggested tags attached to one created bookmark.
pub const MAX_AUTO_TAGS: usize = 3;

const TITLE_MAX_CHARS: usize = 100;
const ALTERNATE_HOSTS: [&str; 3] = ["twitter.com/", "mobile.twitter.com/", "mobile.x.com/"];
const CANONICAL_HOST: &str = "x.com/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The external id is already stored locally.
    Skip(Uuid),
    /// A local bookmark points at the same normalized url.
    Merge(Uuid),
    Create,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Skipped,
    Merged(Uuid),
    Created(Bookmark),
}

/// Comparison key for urls: lower-cased, scheme, `www.` and one trailing
/// slash removed, alternate platform hosts mapped to `x.com`.
pub fn normalize_url(url: &str) -> String {
    let lowered = url.trim().to_lowercase();
    let mut rest = lowered.as_str();
    for scheme in ["https://", "http://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
            break;
        }
    }
    if let Some(stripped) = rest.strip_prefix("www.") {
        rest = stripped;
    }

    let mut key = ALTERNATE_HOSTS
        .iter()
        .find_map(|host| rest.strip_prefix(host))
        .map(|path| format!("{CANONICAL_HOST}{path}"))
        .unwrap_or_else(|| rest.to_string());
    if key.ends_with('/') {
        key.pop();
    }
    key
}

/// Item text cut to 100 characters, ellipsis included.
pub fn make_title(text: &str) -> String {
    if text.chars().count() > TITLE_MAX_CHARS {
        let head = text.chars().take(TITLE_MAX_CHARS - 3).collect::<String>();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// Decides and applies skip/merge/create for one external item.
#[derive(Clone)]
pub struct DedupMerger {
    store: Arc<dyn SyncStore>,
    suggester: Arc<dyn TagSuggester>,
}

impl DedupMerger {
    pub fn new(store: Arc<dyn SyncStore>, suggester: Arc<dyn TagSuggester>) -> Self {
        Self { store, suggester }
    }

    pub async fn resolve(&self, user_id: Uuid, item: &ExternalItem) -> StoreResult<Resolution> {
        if let Some(existing) = self
            .store
            .find_bookmark_by_external_id(user_id, &item.external_id)
            .await?
        {
            return Ok(Resolution::Skip(existing.id));
        }

        let key = normalize_url(&item.url);
        let matched = self
            .store
            .list_bookmarks(user_id)
            .await?
            .into_iter()
            .find(|bookmark| normalize_url(&bookmark.url) == key);

        Ok(match matched {
            Some(bookmark) => Resolution::Merge(bookmark.id),
            None => Resolution::Create,
        })
    }

    /// Writes the resolution. Each write is one atomic store call, so a
    /// failure here leaves nothing half-applied for this item.
    pub async fn apply(
        &self,
        user_id: Uuid,
        item: &ExternalItem,
        resolution: Resolution,
        target_folder: Uuid,
    ) -> StoreResult<Applied> {
        match resolution {
            Resolution::Skip(_) => Ok(Applied::Skipped),
            Resolution::Merge(bookmark_id) => {
                let links = self.store.bookmark_folder_links(bookmark_id).await?;
                let managed = links
                    .iter()
                    .filter(|link| link.is_sync_managed)
                    .map(|link| link.folder_id)
                    .collect::<Vec<_>>();
                let folder_change = match managed.as_slice() {
                    [] => FolderLinkChange::Add(target_folder),
                    [only] if *only == target_folder => FolderLinkChange::Keep,
                    [only] => FolderLinkChange::Replace {
                        from: *only,
                        to: target_folder,
                    },
                    _ => FolderLinkChange::Keep,
                };

                self.store
                    .apply_merge(&MergePlan {
                        bookmark_id,
                        source: BookmarkSource::X,
                        external_id: item.external_id.clone(),
                        folder_change,
                    })
                    .await?;
                debug!(%bookmark_id, external_id = %item.external_id, "merged into existing bookmark");
                Ok(Applied::Merged(bookmark_id))
            }
            Resolution::Create => {
                let bookmark = self
                    .store
                    .insert_bookmark(
                        &NewBookmark {
                            user_id,
                            url: item.url.clone(),
                            title: make_title(&item.text),
                            description: Some(item.text.clone()),
                            source: BookmarkSource::X,
                            external_id: Some(item.external_id.clone()),
                        },
                        Some(target_folder),
                    )
                    .await?;
                // Detached: the run never awaits tagging.
                drop(self.spawn_tag_suggestions(&bookmark));
                Ok(Applied::Created(bookmark))
            }
        }
    }

    /// Best-effort tagging in its own task. Every failure stays inside the
    /// task and is logged at debug level.
    pub fn spawn_tag_suggestions(&self, bookmark: &Bookmark) -> JoinHandle<()> {
        let store = self.store.clone();
        let suggester = self.suggester.clone();
        let user_id = bookmark.user_id;
        let bookmark_id = bookmark.id;
        let title = bookmark.title.clone();
        let description = bookmark.description.clone().unwrap_or_default();
        let url = bookmark.url.clone();

        tokio::spawn(
            async move {
                let tags = match suggester.suggest_tags(&title, &description, &url).await {
                    Ok(tags) => tags,
                    Err(err) => {
                        debug!(error = %err, "tag suggestion failed");
                        return;
                    }
                };
                for name in tags.into_iter().take(MAX_AUTO_TAGS) {
                    if let Err(err) = store.attach_tag(user_id, bookmark_id, &name).await {
                        debug!(error = %err, tag = %name, "attaching suggested tag failed");
                    }
                }
            }
            .instrument(debug_span!("auto_tag", %bookmark_id)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item, Harness, StaticSuggester};
    use markah_adapters::{FixtureFeed, FixturePlatform};
    use markah_core::NewFolder;

    #[test]
    fn url_variants_share_one_key() {
        let key = normalize_url("https://www.example.com/");
        assert_eq!(key, "example.com");
        assert_eq!(normalize_url("http://example.com"), key);
        assert_eq!(normalize_url("HTTPS://Example.com/"), key);

        let canonical = normalize_url("https://x.com/rustlang/status/1");
        assert_eq!(normalize_url("https://twitter.com/rustlang/status/1"), canonical);
        assert_eq!(normalize_url("https://mobile.twitter.com/rustlang/status/1/"), canonical);
        assert_eq!(normalize_url("http://www.twitter.com/rustlang/status/1"), canonical);
    }

    #[test]
    fn long_text_is_truncated_with_ellipsis() {
        let text = "é".repeat(150);
        let title = make_title(&text);
        assert_eq!(title.chars().count(), 100);
        assert!(title.ends_with("..."));
        assert_eq!(make_title("short"), "short");
        assert_eq!(make_title(&"a".repeat(100)).len(), 100);
    }

    async fn local_bookmark(harness: &Harness, url: &str) -> Bookmark {
        harness
            .store
            .insert_bookmark(
                &NewBookmark {
                    user_id: harness.user_id,
                    url: url.into(),
                    title: "saved by hand".into(),
                    description: None,
                    source: BookmarkSource::Local,
                    external_id: None,
                },
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn known_external_id_is_skipped_even_when_url_differs() {
        let harness = Harness::new(FixturePlatform::new(FixtureFeed::default())).await;
        let merger = harness.merger();
        let root = harness.folders().get_or_create_root(harness.user_id).await.unwrap();

        let first = item(10);
        let resolution = merger.resolve(harness.user_id, &first).await.unwrap();
        assert_eq!(resolution, Resolution::Create);
        merger
            .apply(harness.user_id, &first, resolution, root.id)
            .await
            .unwrap();

        let mut moved = item(10);
        moved.url = "https://example.com/elsewhere".into();
        assert!(matches!(
            merger.resolve(harness.user_id, &moved).await.unwrap(),
            Resolution::Skip(_)
        ));
    }

    #[tokio::test]
    async fn merge_keeps_tags_and_user_folders() {
        let harness = Harness::new(FixturePlatform::new(FixtureFeed::default())).await;
        let merger = harness.merger();
        let root = harness.folders().get_or_create_root(harness.user_id).await.unwrap();
        let user_folder = harness
            .store
            .create_folder(&NewFolder {
                user_id: harness.user_id,
                name: "Mine".into(),
                parent_id: None,
                is_sync_managed: false,
                external_collection_id: None,
            })
            .await
            .unwrap();

        let existing = local_bookmark(&harness, "https://twitter.com/writer/status/7/").await;
        harness
            .store
            .link_folder(existing.id, user_folder.id)
            .await
            .unwrap();
        harness
            .store
            .attach_tag(harness.user_id, existing.id, "keep-me")
            .await
            .unwrap();

        let incoming = item(7);
        let resolution = merger.resolve(harness.user_id, &incoming).await.unwrap();
        assert_eq!(resolution, Resolution::Merge(existing.id));
        merger
            .apply(harness.user_id, &incoming, resolution, root.id)
            .await
            .unwrap();

        let merged = harness.store.get_bookmark(existing.id).await.unwrap().unwrap();
        assert_eq!(merged.source, BookmarkSource::X);
        assert_eq!(merged.external_id.as_deref(), Some("7"));
        assert_eq!(merged.title, "saved by hand");

        let tags = harness.store.bookmark_tags(existing.id).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "keep-me");

        let mut folders = harness
            .store
            .bookmark_folder_links(existing.id)
            .await
            .unwrap()
            .into_iter()
            .map(|link| link.folder_id)
            .collect::<Vec<_>>();
        folders.sort();
        let mut expected = vec![user_folder.id, root.id];
        expected.sort();
        assert_eq!(folders, expected);
        assert_eq!(harness.store.bookmark_count(harness.user_id).await, 1);
    }

    #[tokio::test]
    async fn merge_moves_a_single_managed_link() {
        let harness = Harness::new(FixturePlatform::new(FixtureFeed::default())).await;
        let merger = harness.merger();
        let folders = harness.folders();
        let root = folders.get_or_create_root(harness.user_id).await.unwrap();
        let reading = folders
            .get_or_create_collection_folder(
                harness.user_id,
                &markah_core::ExternalCollection {
                    id: "c1".into(),
                    name: "Reading".into(),
                },
                root.id,
            )
            .await
            .unwrap();

        let existing = local_bookmark(&harness, "https://x.com/writer/status/8").await;
        harness.store.link_folder(existing.id, root.id).await.unwrap();

        let incoming = item(8);
        let resolution = merger.resolve(harness.user_id, &incoming).await.unwrap();
        merger
            .apply(harness.user_id, &incoming, resolution, reading.id)
            .await
            .unwrap();

        let links = harness.store.bookmark_folder_links(existing.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].folder_id, reading.id);
    }

    #[tokio::test]
    async fn suggested_tags_are_capped_at_three() {
        let suggester = Arc::new(StaticSuggester::tags(&["rust", "async", "tokio", "sqlx", "axum"]));
        let harness = Harness::new(FixturePlatform::new(FixtureFeed::default()))
            .await
            .with_suggester(suggester);
        let merger = harness.merger();
        let root = harness.folders().get_or_create_root(harness.user_id).await.unwrap();

        let created = match merger
            .apply(harness.user_id, &item(3), Resolution::Create, root.id)
            .await
            .unwrap()
        {
            Applied::Created(bookmark) => bookmark,
            other => panic!("expected create, got {other:?}"),
        };
        merger.spawn_tag_suggestions(&created).await.unwrap();

        let names = harness
            .store
            .bookmark_tags(created.id)
            .await
            .unwrap()
            .into_iter()
            .map(|tag| tag.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["rust", "async", "tokio"]);
    }

    #[tokio::test]
    async fn failing_suggester_is_contained() {
        let harness = Harness::new(FixturePlatform::new(FixtureFeed::default()))
            .await
            .with_suggester(Arc::new(StaticSuggester::failing()));
        let merger = harness.merger();
        let root = harness.folders().get_or_create_root(harness.user_id).await.unwrap();

        let applied = merger
            .apply(harness.user_id, &item(4), Resolution::Create, root.id)
            .await
            .unwrap();
        let Applied::Created(bookmark) = applied else {
            panic!("expected create");
        };
        assert!(merger.spawn_tag_suggestions(&bookmark).await.is_ok());
        assert!(harness.store.bookmark_tags(bookmark.id).await.unwrap().is_empty());
    }
}
