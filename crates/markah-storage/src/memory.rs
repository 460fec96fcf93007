use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use markah_core::{
    Bookmark, Folder, FolderLink, Integration, IntegrationGrant, NewBookmark, NewFolder,
    SyncStatus, Tag,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{FolderLinkChange, MergePlan, StoreError, StoreResult, SyncStore};

/// Process-local store used for development runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    integrations: HashMap<Uuid, Integration>,
    bookmarks: Vec<Bookmark>,
    folders: Vec<Folder>,
    bookmark_folders: Vec<(Uuid, Uuid)>,
    tags: Vec<Tag>,
    bookmark_tags: Vec<(Uuid, Uuid)>,
    statuses: HashMap<Uuid, SyncStatus>,
    /// Remaining bookmark writes before writes start failing.
    write_budget: Option<usize>,
}

impl MemoryState {
    fn integration_mut(&mut self, user_id: Uuid) -> StoreResult<&mut Integration> {
        self.integrations
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::not_found("integration", user_id))
    }

    fn spend_write(&mut self) -> StoreResult<()> {
        match self.write_budget {
            Some(0) => Err(StoreError::Unavailable(
                "bookmark write rejected".to_string(),
            )),
            Some(remaining) => {
                self.write_budget = Some(remaining - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn folder(&self, folder_id: Uuid) -> Option<&Folder> {
        self.folders.iter().find(|f| f.id == folder_id)
    }

    fn link(&mut self, bookmark_id: Uuid, folder_id: Uuid) {
        if !self.bookmark_folders.contains(&(bookmark_id, folder_id)) {
            self.bookmark_folders.push((bookmark_id, folder_id));
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: allow `count` more bookmark writes, then fail every later one.
    pub async fn fail_bookmark_writes_after(&self, count: usize) {
        self.state.lock().await.write_budget = Some(count);
    }

    pub async fn bookmark_count(&self, user_id: Uuid) -> usize {
        self.state
            .lock()
            .await
            .bookmarks
            .iter()
            .filter(|b| b.user_id == user_id)
            .count()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn upsert_integration(
        &self,
        user_id: Uuid,
        grant: &IntegrationGrant,
    ) -> StoreResult<Integration> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let integration = state
            .integrations
            .entry(user_id)
            .and_modify(|existing| {
                existing.external_account_id = grant.external_account_id.clone();
                existing.external_handle = grant.external_handle.clone();
                existing.access_token = grant.access_token.clone();
                existing.refresh_token = grant.refresh_token.clone();
                existing.expires_at = grant.expires_at;
                existing.sync_enabled = true;
                existing.retry_count = 0;
                existing.last_error = None;
                existing.updated_at = now;
            })
            .or_insert_with(|| Integration {
                id: Uuid::new_v4(),
                user_id,
                external_account_id: grant.external_account_id.clone(),
                external_handle: grant.external_handle.clone(),
                access_token: grant.access_token.clone(),
                refresh_token: grant.refresh_token.clone(),
                expires_at: grant.expires_at,
                sync_enabled: true,
                last_synced_external_id: None,
                last_error: None,
                retry_count: 0,
                last_synced_at: None,
                created_at: now,
                updated_at: now,
            });
        Ok(integration.clone())
    }

    async fn get_integration(&self, user_id: Uuid) -> StoreResult<Option<Integration>> {
        Ok(self.state.lock().await.integrations.get(&user_id).cloned())
    }

    async fn list_sync_enabled_integrations(&self) -> StoreResult<Vec<Integration>> {
        let state = self.state.lock().await;
        let mut rows = state
            .integrations
            .values()
            .filter(|i| i.sync_enabled)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|i| i.created_at);
        Ok(rows)
    }

    async fn update_tokens(
        &self,
        user_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let integration = state.integration_mut(user_id)?;
        integration.access_token = access_token.to_string();
        integration.refresh_token = refresh_token.to_string();
        integration.expires_at = expires_at;
        integration.updated_at = Utc::now();
        Ok(())
    }

    async fn set_cursor(&self, user_id: Uuid, external_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.integration_mut(user_id)?.last_synced_external_id = Some(external_id.to_string());
        Ok(())
    }

    async fn record_run_failure(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        error: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<i32> {
        let mut state = self.state.lock().await;
        let integration = state.integration_mut(user_id)?;
        if let Some(cursor) = cursor {
            integration.last_synced_external_id = Some(cursor.to_string());
        }
        integration.retry_count += 1;
        integration.last_error = Some(error.to_string());
        integration.last_synced_at = Some(at);
        integration.updated_at = at;
        Ok(integration.retry_count)
    }

    async fn record_run_success(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let integration = state.integration_mut(user_id)?;
        if let Some(cursor) = cursor {
            integration.last_synced_external_id = Some(cursor.to_string());
        }
        integration.retry_count = 0;
        integration.last_error = None;
        integration.last_synced_at = Some(at);
        integration.updated_at = at;
        Ok(())
    }

    async fn set_sync_enabled(&self, user_id: Uuid, enabled: bool) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.integration_mut(user_id)?.sync_enabled = enabled;
        Ok(())
    }

    async fn pause_integration(&self, user_id: Uuid, message: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let integration = state.integration_mut(user_id)?;
        integration.sync_enabled = false;
        integration.last_error = Some(message.to_string());
        Ok(())
    }

    async fn reset_failures(&self, user_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let integration = state.integration_mut(user_id)?;
        integration.retry_count = 0;
        integration.last_error = None;
        integration.sync_enabled = true;
        Ok(())
    }

    async fn delete_integration(&self, user_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.integrations.remove(&user_id).is_none() {
            return Ok(false);
        }
        for folder in state
            .folders
            .iter_mut()
            .filter(|f| f.user_id == user_id && f.is_sync_managed)
        {
            folder.is_sync_managed = false;
            folder.external_collection_id = None;
        }
        state.statuses.remove(&user_id);
        Ok(true)
    }

    async fn get_bookmark(&self, bookmark_id: Uuid) -> StoreResult<Option<Bookmark>> {
        let state = self.state.lock().await;
        Ok(state.bookmarks.iter().find(|b| b.id == bookmark_id).cloned())
    }

    async fn find_bookmark_by_external_id(
        &self,
        user_id: Uuid,
        external_id: &str,
    ) -> StoreResult<Option<Bookmark>> {
        let state = self.state.lock().await;
        Ok(state
            .bookmarks
            .iter()
            .find(|b| b.user_id == user_id && b.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn list_bookmarks(&self, user_id: Uuid) -> StoreResult<Vec<Bookmark>> {
        let state = self.state.lock().await;
        Ok(state
            .bookmarks
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_bookmark(
        &self,
        bookmark: &NewBookmark,
        folder_id: Option<Uuid>,
    ) -> StoreResult<Bookmark> {
        let mut state = self.state.lock().await;
        if let Some(external_id) = &bookmark.external_id {
            if state.bookmarks.iter().any(|b| {
                b.user_id == bookmark.user_id && b.external_id.as_ref() == Some(external_id)
            }) {
                return Err(StoreError::Conflict(format!(
                    "bookmark with external id {external_id} already exists"
                )));
            }
        }
        state.spend_write()?;

        let now = Utc::now();
        let row = Bookmark {
            id: Uuid::new_v4(),
            user_id: bookmark.user_id,
            url: bookmark.url.clone(),
            title: bookmark.title.clone(),
            description: bookmark.description.clone(),
            source: bookmark.source,
            external_id: bookmark.external_id.clone(),
            created_at: now,
            updated_at: now,
        };
        state.bookmarks.push(row.clone());
        if let Some(folder_id) = folder_id {
            state.link(row.id, folder_id);
        }
        Ok(row)
    }

    async fn apply_merge(&self, plan: &MergePlan) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(index) = state.bookmarks.iter().position(|b| b.id == plan.bookmark_id) else {
            return Err(StoreError::not_found("bookmark", plan.bookmark_id));
        };
        let user_id = state.bookmarks[index].user_id;
        if state.bookmarks.iter().any(|b| {
            b.user_id == user_id
                && b.id != plan.bookmark_id
                && b.external_id.as_deref() == Some(plan.external_id.as_str())
        }) {
            return Err(StoreError::Conflict(format!(
                "bookmark with external id {} already exists",
                plan.external_id
            )));
        }
        state.spend_write()?;

        let bookmark = &mut state.bookmarks[index];
        bookmark.source = plan.source;
        bookmark.external_id = Some(plan.external_id.clone());
        bookmark.updated_at = Utc::now();

        match plan.folder_change {
            FolderLinkChange::Keep => {}
            FolderLinkChange::Add(folder_id) => state.link(plan.bookmark_id, folder_id),
            FolderLinkChange::Replace { from, to } => {
                state
                    .bookmark_folders
                    .retain(|link| *link != (plan.bookmark_id, from));
                state.link(plan.bookmark_id, to);
            }
        }
        Ok(())
    }

    async fn link_folder(&self, bookmark_id: Uuid, folder_id: Uuid) -> StoreResult<()> {
        self.state.lock().await.link(bookmark_id, folder_id);
        Ok(())
    }

    async fn bookmark_folder_links(&self, bookmark_id: Uuid) -> StoreResult<Vec<FolderLink>> {
        let state = self.state.lock().await;
        Ok(state
            .bookmark_folders
            .iter()
            .filter(|(b, _)| *b == bookmark_id)
            .filter_map(|(_, folder_id)| {
                state.folder(*folder_id).map(|folder| FolderLink {
                    folder_id: folder.id,
                    is_sync_managed: folder.is_sync_managed,
                })
            })
            .collect())
    }

    async fn bookmark_tags(&self, bookmark_id: Uuid) -> StoreResult<Vec<Tag>> {
        let state = self.state.lock().await;
        Ok(state
            .bookmark_tags
            .iter()
            .filter(|(b, _)| *b == bookmark_id)
            .filter_map(|(_, tag_id)| state.tags.iter().find(|t| t.id == *tag_id).cloned())
            .collect())
    }

    async fn attach_tag(&self, user_id: Uuid, bookmark_id: Uuid, name: &str) -> StoreResult<Tag> {
        let mut state = self.state.lock().await;
        let existing = state
            .tags
            .iter()
            .find(|t| t.user_id == user_id && t.name == name)
            .cloned();
        let tag = match existing {
            Some(tag) => tag,
            None => {
                let tag = Tag {
                    id: Uuid::new_v4(),
                    user_id,
                    name: name.to_string(),
                };
                state.tags.push(tag.clone());
                tag
            }
        };
        if !state.bookmark_tags.contains(&(bookmark_id, tag.id)) {
            state.bookmark_tags.push((bookmark_id, tag.id));
        }
        Ok(tag)
    }

    async fn find_root_folder_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> StoreResult<Option<Folder>> {
        let state = self.state.lock().await;
        Ok(state
            .folders
            .iter()
            .find(|f| f.user_id == user_id && f.parent_id.is_none() && f.name == name)
            .cloned())
    }

    async fn find_folder_by_collection(
        &self,
        user_id: Uuid,
        collection_id: &str,
    ) -> StoreResult<Option<Folder>> {
        let state = self.state.lock().await;
        Ok(state
            .folders
            .iter()
            .find(|f| {
                f.user_id == user_id && f.external_collection_id.as_deref() == Some(collection_id)
            })
            .cloned())
    }

    async fn find_unmanaged_folder(
        &self,
        user_id: Uuid,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> StoreResult<Option<Folder>> {
        let state = self.state.lock().await;
        Ok(state
            .folders
            .iter()
            .find(|f| {
                f.user_id == user_id
                    && !f.is_sync_managed
                    && f.parent_id == parent_id
                    && f.name == name
            })
            .cloned())
    }

    async fn create_folder(&self, folder: &NewFolder) -> StoreResult<Folder> {
        let mut state = self.state.lock().await;
        if let Some(collection_id) = &folder.external_collection_id {
            if state.folders.iter().any(|f| {
                f.user_id == folder.user_id
                    && f.external_collection_id.as_ref() == Some(collection_id)
            }) {
                return Err(StoreError::Conflict(format!(
                    "folder for collection {collection_id} already exists"
                )));
            }
        }
        let row = Folder {
            id: Uuid::new_v4(),
            user_id: folder.user_id,
            name: folder.name.clone(),
            parent_id: folder.parent_id,
            is_sync_managed: folder.is_sync_managed,
            external_collection_id: folder.external_collection_id.clone(),
            created_at: Utc::now(),
        };
        state.folders.push(row.clone());
        Ok(row)
    }

    async fn mark_folder_sync_managed(&self, folder_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let folder = state
            .folders
            .iter_mut()
            .find(|f| f.id == folder_id)
            .ok_or_else(|| StoreError::not_found("folder", folder_id))?;
        folder.is_sync_managed = true;
        Ok(())
    }

    async fn list_folders(&self, user_id: Uuid) -> StoreResult<Vec<Folder>> {
        let state = self.state.lock().await;
        Ok(state
            .folders
            .iter()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert_sync_status(&self, status: &SyncStatus) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .statuses
            .insert(status.user_id, status.clone());
        Ok(())
    }

    async fn get_sync_status(&self, user_id: Uuid) -> StoreResult<Option<SyncStatus>> {
        Ok(self.state.lock().await.statuses.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use markah_core::{BookmarkSource, SyncState};

    fn grant() -> IntegrationGrant {
        IntegrationGrant {
            external_account_id: "1001".into(),
            external_handle: "reader".into(),
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + Duration::hours(2),
        }
    }

    fn external(user_id: Uuid, external_id: &str) -> NewBookmark {
        NewBookmark {
            user_id,
            url: format!("https://x.com/reader/status/{external_id}"),
            title: "t".into(),
            description: None,
            source: BookmarkSource::X,
            external_id: Some(external_id.into()),
        }
    }

    #[tokio::test]
    async fn one_integration_per_user_and_reconnect_resets_failures() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let first = store.upsert_integration(user, &grant()).await.unwrap();
        store
            .record_run_failure(user, None, "boom", Utc::now())
            .await
            .unwrap();
        let second = store.upsert_integration(user, &grant()).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.retry_count, 0);
        assert!(second.last_error.is_none());
        assert_eq!(store.list_sync_enabled_integrations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn external_id_is_unique_per_user() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.insert_bookmark(&external(user, "7"), None).await.unwrap();
        let err = store
            .insert_bookmark(&external(user, "7"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let other_user = Uuid::new_v4();
        store
            .insert_bookmark(&external(other_user, "7"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failure_counter_increments_by_one_and_keeps_cursor() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.upsert_integration(user, &grant()).await.unwrap();
        let count = store
            .record_run_failure(user, Some("44"), "api down", Utc::now())
            .await
            .unwrap();
        assert_eq!(count, 1);
        let row = store.get_integration(user).await.unwrap().unwrap();
        assert_eq!(row.last_synced_external_id.as_deref(), Some("44"));
        assert_eq!(row.last_error.as_deref(), Some("api down"));
    }

    #[tokio::test]
    async fn disconnect_releases_managed_folders_and_status() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.upsert_integration(user, &grant()).await.unwrap();
        let managed = store
            .create_folder(&NewFolder {
                user_id: user,
                name: "Reading".into(),
                parent_id: None,
                is_sync_managed: true,
                external_collection_id: Some("c1".into()),
            })
            .await
            .unwrap();
        let now = Utc::now();
        store
            .upsert_sync_status(&SyncStatus {
                user_id: user,
                status: SyncState::Success,
                error_message: None,
                collections_note: false,
                last_synced_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        assert!(store.delete_integration(user).await.unwrap());
        assert!(!store.delete_integration(user).await.unwrap());

        let folders = store.list_folders(user).await.unwrap();
        let released = folders.iter().find(|f| f.id == managed.id).unwrap();
        assert!(!released.is_sync_managed);
        assert!(released.external_collection_id.is_none());
        assert!(store.get_sync_status(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merge_replaces_only_the_named_link() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let mk = |name: &str, managed: bool| NewFolder {
            user_id: user,
            name: name.into(),
            parent_id: None,
            is_sync_managed: managed,
            external_collection_id: None,
        };
        let personal = store.create_folder(&mk("Personal", false)).await.unwrap();
        let old = store.create_folder(&mk("Old", true)).await.unwrap();
        let new = store.create_folder(&mk("New", true)).await.unwrap();
        let bookmark = store
            .insert_bookmark(
                &NewBookmark {
                    user_id: user,
                    url: "https://example.com".into(),
                    title: "Example".into(),
                    description: None,
                    source: BookmarkSource::Local,
                    external_id: None,
                },
                Some(personal.id),
            )
            .await
            .unwrap();
        store.link_folder(bookmark.id, old.id).await.unwrap();

        store
            .apply_merge(&MergePlan {
                bookmark_id: bookmark.id,
                source: BookmarkSource::X,
                external_id: "9".into(),
                folder_change: FolderLinkChange::Replace {
                    from: old.id,
                    to: new.id,
                },
            })
            .await
            .unwrap();

        let links = store.bookmark_folder_links(bookmark.id).await.unwrap();
        let ids = links.iter().map(|l| l.folder_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![personal.id, new.id]);
    }

    #[tokio::test]
    async fn write_budget_rejects_later_writes() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.fail_bookmark_writes_after(1).await;
        store.insert_bookmark(&external(user, "1"), None).await.unwrap();
        let err = store
            .insert_bookmark(&external(user, "2"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.bookmark_count(user).await, 1);
    }
}
