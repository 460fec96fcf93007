use std::sync::Arc;

use markah_core::{ExternalCollection, Folder, NewFolder, SYNC_ROOT_FOLDER_NAME};
use markah_storage::{StoreError, StoreResult, SyncStore};
use tracing::debug;
use uuid::Uuid;

/// Appended to a collection folder's name when a user folder already owns it.
pub const COLLECTION_CONFLICT_SUFFIX: &str = " (X)";

/// Provisions the sync-owned folder tree.
#[derive(Clone)]
pub struct FolderMapper {
    store: Arc<dyn SyncStore>,
}

impl FolderMapper {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Finds or creates the root folder and (re)marks it sync-managed.
    pub async fn get_or_create_root(&self, user_id: Uuid) -> StoreResult<Folder> {
        if let Some(mut existing) = self
            .store
            .find_root_folder_by_name(user_id, SYNC_ROOT_FOLDER_NAME)
            .await?
        {
            if !existing.is_sync_managed {
                self.store.mark_folder_sync_managed(existing.id).await?;
                existing.is_sync_managed = true;
            }
            return Ok(existing);
        }

        debug!(%user_id, "creating sync root folder");
        self.store
            .create_folder(&NewFolder {
                user_id,
                name: SYNC_ROOT_FOLDER_NAME.to_string(),
                parent_id: None,
                is_sync_managed: true,
                external_collection_id: None,
            })
            .await
    }

    /// Idempotent by collection id. A new folder whose name is already taken
    /// by a user folder under `root_id` gets [`COLLECTION_CONFLICT_SUFFIX`].
    pub async fn get_or_create_collection_folder(
        &self,
        user_id: Uuid,
        collection: &ExternalCollection,
        root_id: Uuid,
    ) -> StoreResult<Folder> {
        if let Some(existing) = self
            .store
            .find_folder_by_collection(user_id, &collection.id)
            .await?
        {
            return Ok(existing);
        }

        let name_taken = self
            .store
            .find_unmanaged_folder(user_id, &collection.name, Some(root_id))
            .await?
            .is_some();
        let name = if name_taken {
            format!("{}{COLLECTION_CONFLICT_SUFFIX}", collection.name)
        } else {
            collection.name.clone()
        };

        let created = self
            .store
            .create_folder(&NewFolder {
                user_id,
                name,
                parent_id: Some(root_id),
                is_sync_managed: true,
                external_collection_id: Some(collection.id.clone()),
            })
            .await;

        match created {
            Ok(folder) => Ok(folder),
            // Lost a race with another writer for the same collection.
            Err(StoreError::Conflict(_)) => self
                .store
                .find_folder_by_collection(user_id, &collection.id)
                .await?
                .ok_or_else(|| StoreError::not_found("folder", &collection.id)),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use markah_adapters::{FixtureFeed, FixturePlatform};

    fn collection(id: &str, name: &str) -> ExternalCollection {
        ExternalCollection {
            id: id.into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn root_is_created_once_and_stays_managed() {
        let harness = Harness::new(FixturePlatform::new(FixtureFeed::default())).await;
        let mapper = harness.folders();

        let first = mapper.get_or_create_root(harness.user_id).await.unwrap();
        let second = mapper.get_or_create_root(harness.user_id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.is_sync_managed);
        assert_eq!(harness.store.list_folders(harness.user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn existing_user_root_is_adopted_as_managed() {
        let harness = Harness::new(FixturePlatform::new(FixtureFeed::default())).await;
        let user_folder = harness
            .store
            .create_folder(&NewFolder {
                user_id: harness.user_id,
                name: SYNC_ROOT_FOLDER_NAME.into(),
                parent_id: None,
                is_sync_managed: false,
                external_collection_id: None,
            })
            .await
            .unwrap();

        let root = harness.folders().get_or_create_root(harness.user_id).await.unwrap();
        assert_eq!(root.id, user_folder.id);
        assert!(root.is_sync_managed);
        let stored = harness.store.list_folders(harness.user_id).await.unwrap();
        assert!(stored[0].is_sync_managed);
    }

    #[tokio::test]
    async fn collection_folder_is_idempotent() {
        let harness = Harness::new(FixturePlatform::new(FixtureFeed::default())).await;
        let mapper = harness.folders();
        let root = mapper.get_or_create_root(harness.user_id).await.unwrap();
        let reading = collection("c1", "Reading");

        let first = mapper
            .get_or_create_collection_folder(harness.user_id, &reading, root.id)
            .await
            .unwrap();
        let second = mapper
            .get_or_create_collection_folder(harness.user_id, &reading, root.id)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.parent_id, Some(root.id));
        assert_eq!(first.external_collection_id.as_deref(), Some("c1"));
        assert_eq!(harness.store.list_folders(harness.user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn user_folder_name_clash_gets_suffix() {
        let harness = Harness::new(FixturePlatform::new(FixtureFeed::default())).await;
        let mapper = harness.folders();
        let root = mapper.get_or_create_root(harness.user_id).await.unwrap();
        harness
            .store
            .create_folder(&NewFolder {
                user_id: harness.user_id,
                name: "Reading".into(),
                parent_id: Some(root.id),
                is_sync_managed: false,
                external_collection_id: None,
            })
            .await
            .unwrap();

        let folder = mapper
            .get_or_create_collection_folder(harness.user_id, &collection("c1", "Reading"), root.id)
            .await
            .unwrap();
        assert_eq!(folder.name, "Reading (X)");
        assert!(folder.is_sync_managed);
    }
}
