use std::sync::Arc;

use anyhow::{Context, Result};
use markah_core::{PassSummary, MAX_CONSECUTIVE_FAILURES, SYNC_PAUSED_MESSAGE};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{SyncConfig, SyncOrchestrator};

/// Walks every enabled integration, one user at a time.
pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// One sequential pass. Users whose run is already in flight count as
    /// skipped; after every failed run the circuit breaker is checked.
    pub async fn run_pass(&self) -> Result<PassSummary> {
        let integrations = self
            .orchestrator
            .store()
            .list_sync_enabled_integrations()
            .await
            .context("listing sync-enabled integrations")?;

        let mut summary = PassSummary::default();
        for integration in integrations {
            let user_id = integration.user_id;
            let Some(outcome) = self.orchestrator.try_run_for_user(user_id).await else {
                info!(%user_id, "run already in progress; skipping");
                summary.skipped += 1;
                continue;
            };

            if outcome.success {
                info!(
                    %user_id,
                    imported = outcome.imported,
                    merged = outcome.merged,
                    skipped = outcome.skipped,
                    "synced user"
                );
                summary.synced += 1;
            } else {
                warn!(%user_id, error = outcome.error.as_deref().unwrap_or_default(), "sync failed");
                summary.failed += 1;
            }

            if outcome.error.is_some() {
                self.apply_circuit_breaker(user_id).await;
            }
        }

        info!(
            synced = summary.synced,
            failed = summary.failed,
            skipped = summary.skipped,
            "sync pass complete"
        );
        Ok(summary)
    }

    /// Pauses the integration once its consecutive-failure count reaches the
    /// limit. The orchestrator is the only writer of that count.
    async fn apply_circuit_breaker(&self, user_id: Uuid) {
        let store = self.orchestrator.store();
        let integration = match store.get_integration(user_id).await {
            Ok(Some(integration)) => integration,
            Ok(None) => return,
            Err(err) => {
                warn!(%user_id, error = %err, "could not reload integration for circuit breaker");
                return;
            }
        };
        if integration.retry_count < MAX_CONSECUTIVE_FAILURES {
            return;
        }
        match store.pause_integration(user_id, SYNC_PAUSED_MESSAGE).await {
            Ok(()) => warn!(
                %user_id,
                retry_count = integration.retry_count,
                "auto-disabled sync after consecutive failures"
            ),
            Err(err) => warn!(%user_id, error = %err, "could not pause integration"),
        }
    }
}

/// In-process cron driver; `None` unless `MARKAH_SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    scheduler: Arc<SyncScheduler>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let scheduler = scheduler.clone();
        Box::pin(async move {
            if let Err(err) = scheduler.run_pass().await {
                warn!(error = %err, "scheduled sync pass failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
