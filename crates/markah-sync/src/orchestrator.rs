use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use markah_adapters::{ExternalPlatform, FeedClient, TagSuggester, DEFAULT_MAX_RESULTS};
use markah_core::{
    compare_external_ids, external_id_is_newer, Integration, SyncOutcome, SyncState, SyncStatus,
};
use markah_storage::{BackoffPolicy, SyncStore};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{Applied, DedupMerger, FolderMapper, SyncError, TokenManager};

pub const RUN_IN_PROGRESS_MESSAGE: &str = "sync already in progress";

const COLLECTIONS_PARTIAL_MESSAGE: &str =
    "Some collections could not be fetched due to rate limits.";
const FEED_RATE_LIMITED_MESSAGE: &str =
    "X rate limit reached; remaining bookmarks will sync on the next run.";

/// At most one run per user inside this process.
#[derive(Debug, Default)]
pub struct RunGuard {
    per_user: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

/// Held for the length of one run; releasing the last holder drops the
/// user's entry from the guard.
#[derive(Debug)]
pub struct RunPermit<'a> {
    guard: &'a RunGuard,
    user_id: Uuid,
    permit: Option<OwnedSemaphorePermit>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Semaphore>>> {
        self.per_user
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `None` while another run for the same user holds the permit.
    pub fn try_acquire(&self, user_id: Uuid) -> Option<RunPermit<'_>> {
        let permit = self
            .lock()
            .entry(user_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
            .try_acquire_owned()
            .ok()?;
        Some(RunPermit {
            guard: self,
            user_id,
            permit: Some(permit),
        })
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.lock().len()
    }
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        let mut map = self.guard.lock();
        drop(self.permit.take());
        // Only the map still holds the semaphore.
        if map
            .get(&self.user_id)
            .is_some_and(|semaphore| Arc::strong_count(semaphore) == 1)
        {
            map.remove(&self.user_id);
        }
    }
}

#[derive(Debug, Default)]
struct RunProgress {
    start_cursor: Option<String>,
    committed_cursor: Option<String>,
    newest_seen: Option<String>,
    imported: usize,
    merged: usize,
    skipped: usize,
}

impl RunProgress {
    fn new(start_cursor: Option<String>) -> Self {
        Self {
            start_cursor,
            ..Default::default()
        }
    }

    fn observe(&mut self, external_id: &str) {
        let newer = self
            .newest_seen
            .as_deref()
            .map_or(true, |seen| external_id_is_newer(external_id, seen));
        if newer {
            self.newest_seen = Some(external_id.to_string());
        }
    }

    fn advances_start(&self, external_id: &str) -> bool {
        self.start_cursor
            .as_deref()
            .map_or(true, |start| external_id_is_newer(external_id, start))
    }

    /// Cursor after a clean finish: never behind where the run started.
    fn final_cursor(&self) -> Option<String> {
        match (&self.start_cursor, &self.newest_seen) {
            (Some(start), Some(seen)) => {
                if compare_external_ids(seen, start) == Ordering::Greater {
                    Some(seen.clone())
                } else {
                    Some(start.clone())
                }
            }
            (start, seen) => seen.clone().or_else(|| start.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct Completion {
    feed_rate_limited: bool,
    collections_unavailable: bool,
    collections_partial: bool,
}

/// Runs one user's sync from token check to final bookkeeping.
pub struct SyncOrchestrator {
    store: Arc<dyn SyncStore>,
    feed: FeedClient,
    tokens: TokenManager,
    folders: FolderMapper,
    merger: DedupMerger,
    max_results: usize,
    guard: RunGuard,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn SyncStore>,
        platform: Arc<dyn ExternalPlatform>,
        suggester: Arc<dyn TagSuggester>,
    ) -> Self {
        Self {
            feed: FeedClient::new(platform.clone()),
            tokens: TokenManager::new(platform, store.clone()),
            folders: FolderMapper::new(store.clone()),
            merger: DedupMerger::new(store.clone(), suggester),
            store,
            max_results: DEFAULT_MAX_RESULTS,
            guard: RunGuard::new(),
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub fn with_membership_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.feed = self.feed.with_membership_backoff(backoff);
        self
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn guard(&self) -> &RunGuard {
        &self.guard
    }

    /// One run for `user_id`. Every failure is folded into persisted state and
    /// the returned outcome; a run refused by the guard reports
    /// [`RUN_IN_PROGRESS_MESSAGE`].
    pub async fn run_for_user(&self, user_id: Uuid) -> SyncOutcome {
        match self.try_run_for_user(user_id).await {
            Some(outcome) => outcome,
            None => SyncOutcome {
                success: false,
                error: Some(RUN_IN_PROGRESS_MESSAGE.to_string()),
                ..Default::default()
            },
        }
    }

    /// Like [`Self::run_for_user`], but `None` when a run for this user is
    /// already in flight.
    pub async fn try_run_for_user(&self, user_id: Uuid) -> Option<SyncOutcome> {
        let _permit = self.guard.try_acquire(user_id)?;
        let outcome = self
            .run_locked(user_id)
            .instrument(info_span!("sync_run", %user_id))
            .await;
        Some(outcome)
    }

    async fn run_locked(&self, user_id: Uuid) -> SyncOutcome {
        let integration = match self.store.get_integration(user_id).await {
            Ok(Some(integration)) => integration,
            Ok(None) => return SyncOutcome::not_connected(),
            Err(err) => {
                warn!(error = %err, "could not load integration");
                return SyncOutcome {
                    success: false,
                    error: Some(SyncError::from(err).to_string()),
                    status: Some(SyncState::Error),
                    ..Default::default()
                };
            }
        };

        let mut progress = RunProgress::new(integration.last_synced_external_id.clone());
        let finished = match self.execute(&integration, &mut progress).await {
            Ok(completion) => self.finish_success(user_id, &progress, &completion).await,
            Err(err) => Err(err),
        };

        match finished {
            Ok(outcome) => outcome,
            Err(err) => self.finish_failure(user_id, &progress, err).await,
        }
    }

    async fn execute(
        &self,
        integration: &Integration,
        progress: &mut RunProgress,
    ) -> Result<Completion, SyncError> {
        let user_id = integration.user_id;
        let account_id = integration.external_account_id.as_str();
        let token = self.tokens.ensure_valid_token(integration).await?;

        let fetched = self
            .feed
            .fetch_items(
                &token,
                account_id,
                progress.start_cursor.as_deref(),
                self.max_results,
            )
            .await
            .map_err(SyncError::ExternalApi)?;
        let mut completion = Completion {
            feed_rate_limited: fetched.rate_limited,
            ..Default::default()
        };
        if fetched.items.is_empty() {
            return Ok(completion);
        }

        let root = self.folders.get_or_create_root(user_id).await?;
        let mut target_by_item: HashMap<String, Uuid> = HashMap::new();

        let collections = self.feed.fetch_collections(&token, account_id).await;
        completion.collections_unavailable = collections.unavailable;
        completion.collections_partial = collections.failed;
        for collection in &collections.collections {
            let membership = self
                .feed
                .fetch_item_ids_in_collection(&token, account_id, &collection.id)
                .await
                .map_err(SyncError::ExternalApi)?;
            if membership.failed {
                completion.collections_partial = true;
                continue;
            }
            let folder = self
                .folders
                .get_or_create_collection_folder(user_id, collection, root.id)
                .await?;
            for item_id in membership.item_ids {
                target_by_item.entry(item_id).or_insert(folder.id);
            }
        }

        for item in &fetched.items {
            progress.observe(&item.external_id);
            let resolution = self.merger.resolve(user_id, item).await?;
            let target = target_by_item
                .get(&item.external_id)
                .copied()
                .unwrap_or(root.id);

            match self.merger.apply(user_id, item, resolution, target).await? {
                Applied::Skipped => {
                    progress.skipped += 1;
                    continue;
                }
                Applied::Merged(_) => progress.merged += 1,
                Applied::Created(_) => progress.imported += 1,
            }

            if progress.advances_start(&item.external_id) {
                self.store.set_cursor(user_id, &item.external_id).await?;
                progress.committed_cursor = Some(item.external_id.clone());
            }
        }

        Ok(completion)
    }

    async fn finish_success(
        &self,
        user_id: Uuid,
        progress: &RunProgress,
        completion: &Completion,
    ) -> Result<SyncOutcome, SyncError> {
        let now = Utc::now();
        let partial = completion.collections_partial || completion.feed_rate_limited;
        let (state, message) = if completion.collections_partial {
            (SyncState::Partial, Some(COLLECTIONS_PARTIAL_MESSAGE))
        } else if completion.feed_rate_limited {
            (SyncState::Partial, Some(FEED_RATE_LIMITED_MESSAGE))
        } else {
            (SyncState::Success, None)
        };

        let cursor = progress.final_cursor();
        self.store
            .record_run_success(user_id, cursor.as_deref(), now)
            .await?;
        self.store
            .upsert_sync_status(&SyncStatus {
                user_id,
                status: state,
                error_message: message.map(str::to_string),
                collections_note: completion.collections_unavailable,
                last_synced_at: now,
                updated_at: now,
            })
            .await?;

        info!(
            imported = progress.imported,
            merged = progress.merged,
            skipped = progress.skipped,
            status = state.as_str(),
            "sync run finished"
        );
        Ok(SyncOutcome {
            success: true,
            imported: progress.imported,
            merged: progress.merged,
            skipped: progress.skipped,
            error: None,
            partial,
            status: Some(state),
        })
    }

    async fn finish_failure(
        &self,
        user_id: Uuid,
        progress: &RunProgress,
        err: SyncError,
    ) -> SyncOutcome {
        let now = Utc::now();
        let message = err.to_string();
        warn!(error = %message, imported = progress.imported, merged = progress.merged, "sync run failed");

        match self
            .store
            .record_run_failure(user_id, progress.committed_cursor.as_deref(), &message, now)
            .await
        {
            Ok(retry_count) => info!(retry_count, "recorded failed run"),
            Err(store_err) => warn!(error = %store_err, "could not record failed run"),
        }
        let status = SyncStatus {
            user_id,
            status: SyncState::Error,
            error_message: Some(message.clone()),
            collections_note: false,
            last_synced_at: now,
            updated_at: now,
        };
        if let Err(store_err) = self.store.upsert_sync_status(&status).await {
            warn!(error = %store_err, "could not write sync status");
        }

        let mut outcome = SyncOutcome {
            success: false,
            imported: progress.imported,
            merged: progress.merged,
            skipped: progress.skipped,
            error: Some(message),
            partial: false,
            status: Some(SyncState::Error),
        };
        outcome.success = outcome.made_progress();
        outcome
    }
}
