use std::sync::Arc;

use chrono::{DateTime, Utc};
use markah_core::{Integration, IntegrationGrant, SyncOutcome, SyncStatus};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{SyncError, SyncOrchestrator};

/// What the settings surface shows for a connected account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrationView {
    pub connected: bool,
    pub external_handle: String,
    pub sync_enabled: bool,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_status: Option<SyncStatus>,
}

impl IntegrationView {
    fn new(integration: Integration, last_status: Option<SyncStatus>) -> Self {
        Self {
            connected: true,
            external_handle: integration.external_handle,
            sync_enabled: integration.sync_enabled,
            last_error: integration.last_error,
            retry_count: integration.retry_count,
            last_synced_at: integration.last_synced_at,
            last_status,
        }
    }
}

/// User-initiated integration operations.
#[derive(Clone)]
pub struct IntegrationService {
    orchestrator: Arc<SyncOrchestrator>,
}

impl IntegrationService {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn require_integration(&self, user_id: Uuid) -> Result<Integration, SyncError> {
        self.orchestrator
            .store()
            .get_integration(user_id)
            .await?
            .ok_or(SyncError::NotConnected)
    }

    /// Stores the result of a completed OAuth handshake. Reconnecting replaces
    /// the tokens and re-enables sync.
    pub async fn connect(
        &self,
        user_id: Uuid,
        grant: &IntegrationGrant,
    ) -> Result<Integration, SyncError> {
        let integration = self
            .orchestrator
            .store()
            .upsert_integration(user_id, grant)
            .await?;
        info!(%user_id, handle = %integration.external_handle, "integration connected");
        Ok(integration)
    }

    pub async fn status(&self, user_id: Uuid) -> Result<Option<IntegrationView>, SyncError> {
        let store = self.orchestrator.store();
        let Some(integration) = store.get_integration(user_id).await? else {
            return Ok(None);
        };
        let last_status = store.get_sync_status(user_id).await?;
        Ok(Some(IntegrationView::new(integration, last_status)))
    }

    pub async fn sync_now(&self, user_id: Uuid) -> SyncOutcome {
        self.orchestrator.run_for_user(user_id).await
    }

    pub async fn toggle_sync(&self, user_id: Uuid, enabled: bool) -> Result<(), SyncError> {
        self.require_integration(user_id).await?;
        self.orchestrator
            .store()
            .set_sync_enabled(user_id, enabled)
            .await?;
        info!(%user_id, enabled, "sync toggled");
        Ok(())
    }

    /// Clears the failure state, re-enables sync and runs once immediately.
    pub async fn retry(&self, user_id: Uuid) -> Result<SyncOutcome, SyncError> {
        self.require_integration(user_id).await?;
        self.orchestrator.store().reset_failures(user_id).await?;
        info!(%user_id, "failure state cleared; retrying");
        Ok(self.orchestrator.run_for_user(user_id).await)
    }

    /// Deletes the integration. Sync-managed folders become regular folders
    /// and the status row is dropped; `false` when nothing was connected.
    pub async fn disconnect(&self, user_id: Uuid) -> Result<bool, SyncError> {
        let removed = self
            .orchestrator
            .store()
            .delete_integration(user_id)
            .await?;
        if removed {
            info!(%user_id, "integration disconnected");
        }
        Ok(removed)
    }
}
