use async_trait::async_trait;
use chrono::{DateTime, Utc};
use markah_core::{
    Bookmark, BookmarkSource, Folder, FolderLink, Integration, IntegrationGrant, NewBookmark,
    NewFolder, SyncState, SyncStatus, Tag,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{FolderLinkChange, MergePlan, StoreError, StoreResult, SyncStore};

const INTEGRATION_COLUMNS: &str = r#"
    id, user_id, external_account_id, external_handle, access_token, refresh_token,
    expires_at, sync_enabled, last_synced_external_id, last_error, retry_count,
    last_synced_at, created_at, updated_at
"#;

const BOOKMARK_COLUMNS: &str =
    "id, user_id, url, title, description, source, external_id, created_at, updated_at";

const FOLDER_COLUMNS: &str =
    "id, user_id, name, parent_id, is_sync_managed, external_collection_id, created_at";

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn integration_from_row(row: &PgRow) -> StoreResult<Integration> {
    Ok(Integration {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        external_account_id: row.try_get("external_account_id")?,
        external_handle: row.try_get("external_handle")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        expires_at: row.try_get("expires_at")?,
        sync_enabled: row.try_get("sync_enabled")?,
        last_synced_external_id: row.try_get("last_synced_external_id")?,
        last_error: row.try_get("last_error")?,
        retry_count: row.try_get("retry_count")?,
        last_synced_at: row.try_get("last_synced_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bookmark_from_row(row: &PgRow) -> StoreResult<Bookmark> {
    let source: String = row.try_get("source")?;
    Ok(Bookmark {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        source: BookmarkSource::parse(&source)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown bookmark source {source}")))?,
        external_id: row.try_get("external_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn folder_from_row(row: &PgRow) -> StoreResult<Folder> {
    Ok(Folder {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        is_sync_managed: row.try_get("is_sync_managed")?,
        external_collection_id: row.try_get("external_collection_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

#[async_trait]
impl SyncStore for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_integration(
        &self,
        user_id: Uuid,
        grant: &IntegrationGrant,
    ) -> StoreResult<Integration> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO integrations
                (id, user_id, external_account_id, external_handle, access_token,
                 refresh_token, expires_at, sync_enabled, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, 0)
            ON CONFLICT (user_id) DO UPDATE
               SET external_account_id = EXCLUDED.external_account_id,
                   external_handle = EXCLUDED.external_handle,
                   access_token = EXCLUDED.access_token,
                   refresh_token = EXCLUDED.refresh_token,
                   expires_at = EXCLUDED.expires_at,
                   sync_enabled = TRUE,
                   retry_count = 0,
                   last_error = NULL,
                   updated_at = now()
            RETURNING {INTEGRATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&grant.external_account_id)
        .bind(&grant.external_handle)
        .bind(&grant.access_token)
        .bind(&grant.refresh_token)
        .bind(grant.expires_at)
        .fetch_one(&self.pool)
        .await?;
        integration_from_row(&row)
    }

    async fn get_integration(&self, user_id: Uuid) -> StoreResult<Option<Integration>> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(integration_from_row).transpose()
    }

    async fn list_sync_enabled_integrations(&self) -> StoreResult<Vec<Integration>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INTEGRATION_COLUMNS}
              FROM integrations
             WHERE sync_enabled
             ORDER BY created_at
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(integration_from_row).collect()
    }

    async fn update_tokens(
        &self,
        user_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE integrations
               SET access_token = $2, refresh_token = $3, expires_at = $4, updated_at = now()
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("integration", user_id));
        }
        Ok(())
    }

    async fn set_cursor(&self, user_id: Uuid, external_id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE integrations SET last_synced_external_id = $2, updated_at = now() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_run_failure(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        error: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<i32> {
        let row = sqlx::query(
            r#"
            UPDATE integrations
               SET last_synced_external_id = COALESCE($2, last_synced_external_id),
                   retry_count = retry_count + 1,
                   last_error = $3,
                   last_synced_at = $4,
                   updated_at = $4
             WHERE user_id = $1
            RETURNING retry_count
            "#,
        )
        .bind(user_id)
        .bind(cursor)
        .bind(error)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("integration", user_id))?;
        Ok(row.try_get("retry_count")?)
    }

    async fn record_run_success(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE integrations
               SET last_synced_external_id = COALESCE($2, last_synced_external_id),
                   retry_count = 0,
                   last_error = NULL,
                   last_synced_at = $3,
                   updated_at = $3
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(cursor)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_sync_enabled(&self, user_id: Uuid, enabled: bool) -> StoreResult<()> {
        sqlx::query("UPDATE integrations SET sync_enabled = $2, updated_at = now() WHERE user_id = $1")
            .bind(user_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pause_integration(&self, user_id: Uuid, message: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE integrations
               SET sync_enabled = FALSE, last_error = $2, updated_at = now()
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_failures(&self, user_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE integrations
               SET retry_count = 0, last_error = NULL, sync_enabled = TRUE, updated_at = now()
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_integration(&self, user_id: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM integrations WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE folders
               SET is_sync_managed = FALSE, external_collection_id = NULL
             WHERE user_id = $1 AND is_sync_managed
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sync_statuses WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_bookmark(&self, bookmark_id: Uuid) -> StoreResult<Option<Bookmark>> {
        let row = sqlx::query(&format!("SELECT {BOOKMARK_COLUMNS} FROM bookmarks WHERE id = $1"))
            .bind(bookmark_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bookmark_from_row).transpose()
    }

    async fn find_bookmark_by_external_id(
        &self,
        user_id: Uuid,
        external_id: &str,
    ) -> StoreResult<Option<Bookmark>> {
        let row = sqlx::query(&format!(
            "SELECT {BOOKMARK_COLUMNS} FROM bookmarks WHERE user_id = $1 AND external_id = $2"
        ))
        .bind(user_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bookmark_from_row).transpose()
    }

    async fn list_bookmarks(&self, user_id: Uuid) -> StoreResult<Vec<Bookmark>> {
        let rows = sqlx::query(&format!(
            "SELECT {BOOKMARK_COLUMNS} FROM bookmarks WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bookmark_from_row).collect()
    }

    async fn insert_bookmark(
        &self,
        bookmark: &NewBookmark,
        folder_id: Option<Uuid>,
    ) -> StoreResult<Bookmark> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO bookmarks (id, user_id, url, title, description, source, external_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {BOOKMARK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(bookmark.user_id)
        .bind(&bookmark.url)
        .bind(&bookmark.title)
        .bind(&bookmark.description)
        .bind(bookmark.source.as_str())
        .bind(&bookmark.external_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(format!(
                    "bookmark with external id {} already exists",
                    bookmark.external_id.as_deref().unwrap_or_default()
                ))
            } else {
                StoreError::Database(err)
            }
        })?;
        let created = bookmark_from_row(&row)?;

        if let Some(folder_id) = folder_id {
            sqlx::query(
                "INSERT INTO bookmark_folders (bookmark_id, folder_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(created.id)
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn apply_merge(&self, plan: &MergePlan) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE bookmarks SET source = $2, external_id = $3, updated_at = now() WHERE id = $1",
        )
        .bind(plan.bookmark_id)
        .bind(plan.source.as_str())
        .bind(&plan.external_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(format!(
                    "bookmark with external id {} already exists",
                    plan.external_id
                ))
            } else {
                StoreError::Database(err)
            }
        })?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("bookmark", plan.bookmark_id));
        }

        let add = match plan.folder_change {
            FolderLinkChange::Keep => None,
            FolderLinkChange::Add(folder_id) => Some(folder_id),
            FolderLinkChange::Replace { from, to } => {
                sqlx::query("DELETE FROM bookmark_folders WHERE bookmark_id = $1 AND folder_id = $2")
                    .bind(plan.bookmark_id)
                    .bind(from)
                    .execute(&mut *tx)
                    .await?;
                Some(to)
            }
        };
        if let Some(folder_id) = add {
            sqlx::query(
                "INSERT INTO bookmark_folders (bookmark_id, folder_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(plan.bookmark_id)
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn link_folder(&self, bookmark_id: Uuid, folder_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO bookmark_folders (bookmark_id, folder_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(bookmark_id)
        .bind(folder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bookmark_folder_links(&self, bookmark_id: Uuid) -> StoreResult<Vec<FolderLink>> {
        let rows = sqlx::query(
            r#"
            SELECT bf.folder_id, f.is_sync_managed
              FROM bookmark_folders bf
              JOIN folders f ON f.id = bf.folder_id
             WHERE bf.bookmark_id = $1
             ORDER BY bf.created_at
            "#,
        )
        .bind(bookmark_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FolderLink {
                folder_id: row.try_get("folder_id")?,
                is_sync_managed: row.try_get("is_sync_managed")?,
            });
        }
        Ok(out)
    }

    async fn bookmark_tags(&self, bookmark_id: Uuid) -> StoreResult<Vec<Tag>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.user_id, t.name
              FROM bookmark_tags bt
              JOIN tags t ON t.id = bt.tag_id
             WHERE bt.bookmark_id = $1
             ORDER BY t.name
            "#,
        )
        .bind(bookmark_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Tag {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    async fn attach_tag(&self, user_id: Uuid, bookmark_id: Uuid, name: &str) -> StoreResult<Tag> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO tags (id, user_id, name) VALUES ($1, $2, $3)
            ON CONFLICT (user_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, user_id, name
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;
        let tag = Tag {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
        };
        sqlx::query(
            "INSERT INTO bookmark_tags (bookmark_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(bookmark_id)
        .bind(tag.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(tag)
    }

    async fn find_root_folder_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> StoreResult<Option<Folder>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {FOLDER_COLUMNS}
              FROM folders
             WHERE user_id = $1 AND parent_id IS NULL AND name = $2
             ORDER BY created_at
             LIMIT 1
            "#
        ))
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    async fn find_folder_by_collection(
        &self,
        user_id: Uuid,
        collection_id: &str,
    ) -> StoreResult<Option<Folder>> {
        let row = sqlx::query(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE user_id = $1 AND external_collection_id = $2"
        ))
        .bind(user_id)
        .bind(collection_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    async fn find_unmanaged_folder(
        &self,
        user_id: Uuid,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> StoreResult<Option<Folder>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {FOLDER_COLUMNS}
              FROM folders
             WHERE user_id = $1
               AND name = $2
               AND parent_id IS NOT DISTINCT FROM $3
               AND NOT is_sync_managed
             LIMIT 1
            "#
        ))
        .bind(user_id)
        .bind(name)
        .bind(parent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    async fn create_folder(&self, folder: &NewFolder) -> StoreResult<Folder> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO folders (id, user_id, name, parent_id, is_sync_managed, external_collection_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {FOLDER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(folder.user_id)
        .bind(&folder.name)
        .bind(folder.parent_id)
        .bind(folder.is_sync_managed)
        .bind(&folder.external_collection_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(format!(
                    "folder for collection {} already exists",
                    folder.external_collection_id.as_deref().unwrap_or_default()
                ))
            } else {
                StoreError::Database(err)
            }
        })?;
        folder_from_row(&row)
    }

    async fn mark_folder_sync_managed(&self, folder_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE folders SET is_sync_managed = TRUE WHERE id = $1")
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_folders(&self, user_id: Uuid) -> StoreResult<Vec<Folder>> {
        let rows = sqlx::query(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(folder_from_row).collect()
    }

    async fn upsert_sync_status(&self, status: &SyncStatus) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_statuses
                (user_id, status, error_message, collections_note, last_synced_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
               SET status = EXCLUDED.status,
                   error_message = EXCLUDED.error_message,
                   collections_note = EXCLUDED.collections_note,
                   last_synced_at = EXCLUDED.last_synced_at,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(status.user_id)
        .bind(status.status.as_str())
        .bind(&status.error_message)
        .bind(status.collections_note)
        .bind(status.last_synced_at)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_sync_status(&self, user_id: Uuid) -> StoreResult<Option<SyncStatus>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, status, error_message, collections_note, last_synced_at, updated_at
              FROM sync_statuses
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        Ok(Some(SyncStatus {
            user_id: row.try_get("user_id")?,
            status: SyncState::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown sync status {status}")))?,
            error_message: row.try_get("error_message")?,
            collections_note: row.try_get("collections_note")?,
            last_synced_at: row.try_get("last_synced_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}
