use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use markah_adapters::ExternalPlatform;
use markah_core::Integration;
use markah_storage::SyncStore;
use tracing::{debug, info};

use crate::SyncError;

/// Keeps an integration's access token usable.
#[derive(Clone)]
pub struct TokenManager {
    platform: Arc<dyn ExternalPlatform>,
    store: Arc<dyn SyncStore>,
}

impl TokenManager {
    pub fn new(platform: Arc<dyn ExternalPlatform>, store: Arc<dyn SyncStore>) -> Self {
        Self { platform, store }
    }

    pub async fn ensure_valid_token(&self, integration: &Integration) -> Result<String, SyncError> {
        self.ensure_valid_token_at(integration, Utc::now()).await
    }

    /// Returns the stored token while it is unexpired; otherwise refreshes and
    /// persists the new access/refresh/expiry triple before returning it.
    pub async fn ensure_valid_token_at(
        &self,
        integration: &Integration,
        now: DateTime<Utc>,
    ) -> Result<String, SyncError> {
        if !integration.token_expired_at(now) {
            debug!(user_id = %integration.user_id, "access token still valid");
            return Ok(integration.access_token.clone());
        }

        let grant = self
            .platform
            .refresh_token(&integration.refresh_token)
            .await
            .map_err(SyncError::TokenRefresh)?;
        let expires_at = now + Duration::seconds(grant.expires_in);
        self.store
            .update_tokens(
                integration.user_id,
                &grant.access_token,
                &grant.refresh_token,
                expires_at,
            )
            .await?;

        info!(user_id = %integration.user_id, %expires_at, "refreshed access token");
        Ok(grant.access_token)
    }
}
