//! Retention reaper.
//!
//! A periodic housekeeper enforcing retention policy: terminal-run pruning
//! (count and age, per pipeline with merged overrides), stuck-run failure,
//! log and audit aging, quality-result top-N, hard-purging soft-deleted
//! pipelines, orphan catalog branches, and processed landing files. Phase
//! failures are logged and never abort the tick; counters land in the
//! reaper-status singleton.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use smelter_core::ports::{CatalogClient, LeaderGate, ObjectStore, Stores};
use smelter_core::types::ReaperStatus;

use crate::leader::{confirm_leader, jittered};

/// Default housekeeping cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Leader-election component name.
const COMPONENT: &str = "reaper";

/// Catalog branches created per run carry this prefix.
const RUN_BRANCH_PREFIX: &str = "run-";

pub struct Reaper {
    stores: Stores,
    catalog: Option<Arc<dyn CatalogClient>>,
    objects: Option<Arc<dyn ObjectStore>>,
    leader: Arc<dyn LeaderGate>,
    tick_interval: Duration,
}

impl Reaper {
    pub fn new(
        stores: Stores,
        catalog: Option<Arc<dyn CatalogClient>>,
        objects: Option<Arc<dyn ObjectStore>>,
        leader: Arc<dyn LeaderGate>,
    ) -> Self {
        Self {
            stores,
            catalog,
            objects,
            leader,
            tick_interval: TICK_INTERVAL,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("reaper started");
            loop {
                let delay = if confirm_leader(&self.leader, COMPONENT).await {
                    let status = self.tick().await;
                    tracing::info!(
                        runs_pruned = status.runs_pruned + status.runs_age_pruned,
                        stuck = status.stuck_runs_failed,
                        logs = status.logs_pruned,
                        "reaper tick finished"
                    );
                    self.tick_interval
                } else {
                    jittered(self.tick_interval)
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("reaper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One full housekeeping pass. Config is re-read every tick so admin
    /// changes apply without restart.
    pub async fn tick(&self) -> ReaperStatus {
        let now = Utc::now();
        let mut status = ReaperStatus {
            last_run_at: Some(now),
            ..Default::default()
        };

        let system = match self.stores.retention.system().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "retention config read failed, skipping tick");
                return status;
            }
        };

        // Per-pipeline phases honor merged overrides.
        match self.stores.pipelines.list_ids().await {
            Ok(ids) => {
                for pipeline_id in ids {
                    let merged = match self.stores.retention.merged(pipeline_id).await {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::warn!(
                                pipeline_id = %pipeline_id,
                                error = %e,
                                "retention merge failed, using system defaults"
                            );
                            system.clone()
                        }
                    };

                    match self
                        .stores
                        .runs
                        .delete_terminal_beyond(pipeline_id, merged.runs_max_per_pipeline)
                        .await
                    {
                        Ok(n) => status.runs_pruned += n as i64,
                        Err(e) => {
                            tracing::warn!(pipeline_id = %pipeline_id, error = %e, "run-count prune failed");
                        }
                    }

                    let age_cutoff = now - ChronoDuration::days(merged.runs_max_age_days);
                    match self
                        .stores
                        .runs
                        .delete_terminal_before(pipeline_id, age_cutoff)
                        .await
                    {
                        Ok(n) => status.runs_age_pruned += n as i64,
                        Err(e) => {
                            tracing::warn!(pipeline_id = %pipeline_id, error = %e, "run-age prune failed");
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "pipeline listing failed, run phases skipped"),
        }

        // Stuck runs: pending/running past the timeout become failed.
        let stuck_cutoff = now - ChronoDuration::minutes(system.stuck_run_timeout_minutes);
        match self.stores.runs.fail_stuck(stuck_cutoff).await {
            Ok(n) => {
                status.stuck_runs_failed = n as i64;
                if n > 0 {
                    tracing::warn!(count = n, "marked stuck runs as failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "stuck-run phase failed"),
        }

        // Logs.
        let log_cutoff = now - ChronoDuration::days(system.logs_max_age_days);
        match self.stores.logs.delete_for_runs_finished_before(log_cutoff).await {
            Ok(n) => status.logs_pruned = n as i64,
            Err(e) => tracing::warn!(error = %e, "log prune failed"),
        }

        // Quality results: top N per test by recency.
        match self
            .stores
            .quality
            .prune_results(system.quality_results_max_per_test)
            .await
        {
            Ok(n) => status.quality_results_pruned = n as i64,
            Err(e) => tracing::warn!(error = %e, "quality-result prune failed"),
        }

        // Soft-deleted pipelines past the purge window are hard-deleted;
        // the storage collaborator owns the file-tree cleanup.
        let purge_cutoff = now - ChronoDuration::days(system.soft_delete_purge_days);
        match self.stores.pipelines.list_soft_deleted_before(purge_cutoff).await {
            Ok(doomed) => {
                for pipeline in doomed {
                    match self.stores.pipelines.hard_delete(pipeline.id).await {
                        Ok(true) => status.pipelines_purged += 1,
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(pipeline_id = %pipeline.id, error = %e, "pipeline purge failed");
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "soft-delete listing failed"),
        }

        // Audit log.
        let audit_cutoff = now - ChronoDuration::days(system.audit_log_max_age_days);
        match self.stores.audit.delete_before(audit_cutoff).await {
            Ok(n) => status.audit_entries_pruned = n as i64,
            Err(e) => tracing::warn!(error = %e, "audit prune failed"),
        }

        // Orphan catalog branches, best effort.
        if let Some(catalog) = &self.catalog {
            status.orphan_branches_deleted = self
                .prune_orphan_branches(
                    catalog,
                    system.nessie_orphan_branch_max_age_hours,
                )
                .await;
        }

        // Processed landing files for auto-purge zones.
        if let Some(objects) = &self.objects {
            status.landing_files_purged =
                self.prune_processed_files(objects, system.processed_max_age_days).await;
        }

        status.updated_at = Some(Utc::now());
        if let Err(e) = self.stores.retention.update_reaper_status(status.clone()).await {
            tracing::warn!(error = %e, "reaper status write failed");
        }
        status
    }

    /// Delete `run-*` branches whose run is gone or finished long ago.
    /// Branches backing a live run are never touched.
    async fn prune_orphan_branches(
        &self,
        catalog: &Arc<dyn CatalogClient>,
        max_age_hours: i64,
    ) -> i64 {
        let branches = match catalog.list_branches().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "catalog branch listing failed");
                return 0;
            }
        };
        let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours);
        let mut deleted = 0;

        for branch in branches {
            let Some(run_id) = branch
                .strip_prefix(RUN_BRANCH_PREFIX)
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            let orphaned = match self.stores.runs.get(run_id).await {
                Ok(Some(run)) if !run.status.is_terminal() => false,
                Ok(Some(run)) => run.finished_at.is_some_and(|f| f < cutoff),
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(branch = %branch, error = %e, "run lookup failed");
                    false
                }
            };
            if !orphaned {
                continue;
            }
            match catalog.delete_branch(&branch).await {
                Ok(()) => {
                    deleted += 1;
                    tracing::info!(branch = %branch, "deleted orphan branch");
                }
                Err(e) => tracing::warn!(branch = %branch, error = %e, "branch delete failed"),
            }
        }
        deleted
    }

    /// For auto-purge zones, delete objects under `_processed/` older than
    /// the configured window.
    async fn prune_processed_files(
        &self,
        objects: &Arc<dyn ObjectStore>,
        max_age_days: i64,
    ) -> i64 {
        let zones = match self.stores.landing.list_auto_purge_zones().await {
            Ok(z) => z,
            Err(e) => {
                tracing::warn!(error = %e, "auto-purge zone listing failed");
                return 0;
            }
        };
        let cutoff = Utc::now() - ChronoDuration::days(max_age_days);
        let mut purged = 0;

        for zone in zones {
            let prefix = format!("{}/{}/_processed/", zone.namespace, zone.name);
            let listed = match objects.list_prefix(&prefix).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(prefix = %prefix, error = %e, "object listing failed");
                    continue;
                }
            };
            for object in listed {
                if object.last_modified >= cutoff {
                    continue;
                }
                match objects.delete_object(&object.key).await {
                    Ok(()) => purged += 1,
                    Err(e) => {
                        tracing::warn!(key = %object.key, error = %e, "object delete failed");
                    }
                }
            }
        }
        purged
    }

}
