//! Core domain model for the Markah bookmark sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "markah-core";

/// Name of the well-known root folder the sync engine writes into.
pub const SYNC_ROOT_FOLDER_NAME: &str = "X Bookmarks";

/// `lastError` written by the circuit breaker when it disables an integration.
pub const SYNC_PAUSED_MESSAGE: &str =
    "Sync paused after 3 consecutive failures. Re-enable from settings.";

/// Consecutive failed runs tolerated before the integration is paused.
pub const MAX_CONSECUTIVE_FAILURES: i32 = 3;

/// A user's linked external account plus its sync credentials and state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    pub user_id: Uuid,
    pub external_account_id: String,
    pub external_handle: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub sync_enabled: bool,
    /// Resume cursor: the external id of the newest committed item.
    pub last_synced_external_id: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    pub fn token_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Token pair and account identity handed over by the OAuth handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationGrant {
    pub external_account_id: String,
    pub external_handle: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkSource {
    Local,
    X,
}

impl BookmarkSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::X => "x",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "x" => Some(Self::X),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: Uuid,
    pub user_id: Uuid,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub source: BookmarkSource,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a bookmark created by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBookmark {
    pub user_id: Uuid,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub source: BookmarkSource,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub is_sync_managed: bool,
    /// Set only for sync-managed folders mirroring a remote collection.
    pub external_collection_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFolder {
    pub user_id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub is_sync_managed: bool,
    pub external_collection_id: Option<String>,
}

/// A bookmark's membership in one folder, with the folder's ownership flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderLink {
    pub folder_id: Uuid,
    pub is_sync_managed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Success,
    Partial,
    Error,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Outcome of the most recent run, as shown on the settings surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub user_id: Uuid,
    pub status: SyncState,
    pub error_message: Option<String>,
    /// True when collection mapping was unavailable for this account.
    pub collections_note: bool,
    pub last_synced_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One saved item pulled from the external platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalItem {
    pub external_id: String,
    pub text: String,
    pub author_handle: String,
    pub author_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub url: String,
}

/// A named remote grouping of saved items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCollection {
    pub id: String,
    pub name: String,
}

/// Orders external ids by recency.
///
/// Platform ids are time-ordered integers serialized as strings; ids that do
/// not parse fall back to length-then-lexicographic order, which agrees with
/// numeric order for unsigned decimal strings.
pub fn compare_external_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

/// True when `candidate` is strictly more recent than `than`.
pub fn external_id_is_newer(candidate: &str, than: &str) -> bool {
    compare_external_ids(candidate, than) == std::cmp::Ordering::Greater
}

/// Result returned by one orchestrator run for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncOutcome {
    pub success: bool,
    pub imported: usize,
    pub merged: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncState>,
}

impl SyncOutcome {
    pub fn not_connected() -> Self {
        Self {
            success: false,
            error: Some("X account not connected".to_string()),
            ..Default::default()
        }
    }

    pub fn made_progress(&self) -> bool {
        self.imported > 0 || self.merged > 0
    }
}

/// Aggregate counts reported by one scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PassSummary {
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn enums_round_trip_through_their_storage_names() {
        for source in [BookmarkSource::Local, BookmarkSource::X] {
            assert_eq!(BookmarkSource::parse(source.as_str()), Some(source));
        }
        for state in [SyncState::Success, SyncState::Partial, SyncState::Error] {
            assert_eq!(SyncState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SyncState::parse("unknown"), None);
    }

    #[test]
    fn external_ids_compare_numerically() {
        assert!(external_id_is_newer("10", "9"));
        assert!(external_id_is_newer("1890000000000000001", "1890000000000000000"));
        assert!(!external_id_is_newer("5", "5"));
        assert!(!external_id_is_newer("4", "5"));
        assert!(external_id_is_newer("ab", "a"));
    }

    #[test]
    fn outcome_serializes_without_empty_optionals() {
        let outcome = SyncOutcome {
            success: true,
            imported: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["imported"], 2);
    }

    #[test]
    fn token_expiry_is_strictly_in_the_past() {
        let now = Utc::now();
        let integration = Integration {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            external_account_id: "42".into(),
            external_handle: "someone".into(),
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: now + Duration::minutes(5),
            sync_enabled: true,
            last_synced_external_id: None,
            last_error: None,
            retry_count: 0,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!integration.token_expired_at(now));
        assert!(integration.token_expired_at(now + Duration::minutes(6)));
    }
}
