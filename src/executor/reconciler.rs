//! Status reconciliation: push-primary, poll-fallback.
//!
//! Two paths drive a run to its terminal state. The push path is a status
//! callback POSTed by the worker; the poll path walks each client's active
//! map every 60 s and asks the worker directly. Both converge on
//! `apply_terminal`, whose ordering per run is fixed: store write first, then
//! the completion callback, then log persistence, then resource cleanup,
//! with active-map removal last. The store is always the source of truth;
//! the in-flight claim set plus the one-shot store transition make the
//! completion callback fire at most once per run no matter how the paths
//! race.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use smelter_core::events::{EventBus, RunCompletedEvent, CHANNEL_RUN_COMPLETED};
use smelter_core::ports::{Executor, LandingStore, LogStore, Result, RunStore};
use smelter_core::types::{Run, RunStatus, TerminalUpdate};
use smelter_core::SmelterError;

use super::client::{WorkerClient, POLL_INTERVAL};
use super::types::RunStatusReport;

/// Completion callbacks run on a fresh context with this timeout; the HTTP
/// request that delivered the status may be cancelled right after response.
const ON_COMPLETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Push status update from a worker.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusUpdate {
    pub run_id: Uuid,
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub rows_written: Option<i64>,
    #[serde(default)]
    pub archived_landing_zones: Vec<String>,
}

pub type RunCompleteHook = Arc<dyn Fn(Run) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Reconciler {
    clients: Vec<Arc<WorkerClient>>,
    runs: Arc<dyn RunStore>,
    logs: Arc<dyn LogStore>,
    landing: Arc<dyn LandingStore>,
    bus: Arc<dyn EventBus>,
    on_run_complete: Mutex<Option<RunCompleteHook>>,
    /// Claim set: the first path to insert a run id performs the terminal
    /// sequence; the other path finds nothing to do.
    in_flight: Mutex<HashSet<Uuid>>,
    poll_interval: Duration,
}

impl Reconciler {
    pub fn new(
        clients: Vec<Arc<WorkerClient>>,
        runs: Arc<dyn RunStore>,
        logs: Arc<dyn LogStore>,
        landing: Arc<dyn LandingStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            clients,
            runs,
            logs,
            landing,
            bus,
            on_run_complete: Mutex::new(None),
            in_flight: Mutex::new(HashSet::new()),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Shrink the poll interval (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn set_on_run_complete(&self, hook: RunCompleteHook) {
        *self.on_run_complete.lock().unwrap() = Some(hook);
    }

    /// Push path. Unknown runs are accepted idempotently, whatever their
    /// payload says: they were already reconciled by the poll path, or
    /// belong to a previous process life and the reaper will settle them.
    pub async fn handle_status_callback(&self, update: StatusUpdate) -> Result<()> {
        let Some(client) = self.owner_of(update.run_id) else {
            tracing::debug!(run_id = %update.run_id, "callback for unknown run, accepting");
            return Ok(());
        };

        if !update.status.is_terminal() {
            return Err(SmelterError::InvalidArgument(format!(
                "callback status must be terminal, got {}",
                update.status
            )));
        }

        self.apply_terminal(client, update).await
    }

    /// The client holding an active mapping for the run, if any.
    pub fn owner_of(&self, run_id: Uuid) -> Option<Arc<WorkerClient>> {
        self.clients.iter().find(|c| c.owns(run_id)).cloned()
    }

    /// Terminal sequence shared by push and poll.
    async fn apply_terminal(
        &self,
        client: Arc<WorkerClient>,
        update: StatusUpdate,
    ) -> Result<()> {
        let run_id = update.run_id;

        // Claim. A concurrent push/poll for the same run backs off here.
        if !self.in_flight.lock().unwrap().insert(run_id) {
            tracing::debug!(run_id = %run_id, "terminal update already in flight");
            return Ok(());
        }
        let result = self.apply_terminal_claimed(&client, update).await;
        self.in_flight.lock().unwrap().remove(&run_id);
        result
    }

    async fn apply_terminal_claimed(
        &self,
        client: &Arc<WorkerClient>,
        update: StatusUpdate,
    ) -> Result<()> {
        let run_id = update.run_id;

        // 1. Terminal store write, one operation. `None` means another
        //    writer won (poll vs push vs API cancel); clean up and accept.
        let finished = self
            .runs
            .finish(
                run_id,
                TerminalUpdate {
                    status: update.status,
                    error: update.error.clone(),
                    duration_ms: update.duration_ms,
                    rows_written: update.rows_written,
                },
            )
            .await?;

        let Some(run) = finished else {
            client.remove_active(run_id);
            return Ok(());
        };

        tracing::info!(
            run_id = %run_id,
            status = %run.status,
            duration_ms = ?run.duration_ms,
            "run reached terminal state"
        );

        // 2. Completion callback on a fresh, bounded context.
        let hook = self.on_run_complete.lock().unwrap().clone();
        if let Some(hook) = hook {
            let callback_run = run.clone();
            tokio::spawn(async move {
                if tokio::time::timeout(ON_COMPLETE_TIMEOUT, hook(callback_run))
                    .await
                    .is_err()
                {
                    tracing::warn!(run_id = %run_id, "run-complete callback timed out");
                }
            });
        }

        // 3. Pull and persist worker logs. Best-effort: a failure here never
        //    fails the terminal transition.
        match client.fetch_logs(run_id).await {
            Ok(entries) if !entries.is_empty() => {
                if let Err(e) = self.logs.persist(run_id, &entries).await {
                    tracing::warn!(run_id = %run_id, error = %e, "log persistence failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "log pull failed"),
        }

        // 4. Landing-zone cleanup on success.
        if run.status == RunStatus::Success {
            self.cleanup_landing(&run, &update.archived_landing_zones).await;
        }

        // 5. Publish; the store row is already committed, so a publish
        //    failure is log-only.
        let event = RunCompletedEvent {
            run_id,
            pipeline_id: run.pipeline_id,
            status: run.status,
        };
        if let Err(e) = self
            .bus
            .publish(
                CHANNEL_RUN_COMPLETED,
                serde_json::to_value(&event).unwrap_or_default(),
            )
            .await
        {
            tracing::warn!(run_id = %run_id, error = %e, "run_completed publish failed");
        }

        // 6. Forget the run. Last, per the ordering contract.
        client.remove_active(run_id);
        Ok(())
    }

    /// Delete landing-file records for zones the worker archived. When the
    /// worker predates the archived-zones field, fall back to parsing the
    /// run's upload-trigger descriptor.
    async fn cleanup_landing(&self, run: &Run, archived: &[String]) {
        let zones: Vec<(String, String)> = if !archived.is_empty() {
            archived.iter().filter_map(|z| split_zone(z)).collect()
        } else {
            run.trigger
                .strip_prefix("trigger:landing_zone_upload:")
                .and_then(split_zone)
                .into_iter()
                .collect()
        };

        for (namespace, zone_name) in zones {
            let zone = match self.landing.get_zone(&namespace, &zone_name).await {
                Ok(Some(zone)) => zone,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "landing zone lookup failed during cleanup");
                    continue;
                }
            };
            match self.landing.delete_files_for_zone(zone.id).await {
                Ok(n) if n > 0 => {
                    tracing::info!(
                        zone = format!("{namespace}/{zone_name}"),
                        files = n,
                        "cleared processed landing files"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "landing file cleanup failed"),
            }
        }
    }

    /// Cancel requested through the API. The terminal row is written before
    /// the worker call, so cancellation is visible even when the worker is
    /// gone.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        let Some(run) = self.runs.get(run_id).await? else {
            return Err(SmelterError::NotFound(format!("run {run_id}")));
        };
        if run.status.is_terminal() {
            return Err(SmelterError::Conflict(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }

        let finished = self
            .runs
            .finish(
                run_id,
                TerminalUpdate {
                    status: RunStatus::Cancelled,
                    error: None,
                    duration_ms: None,
                    rows_written: None,
                },
            )
            .await?;
        let Some(run) = finished else {
            // Lost the race to a worker callback; surface the settled row.
            return Err(SmelterError::Conflict(format!(
                "run {run_id} finished before it could be cancelled"
            )));
        };

        if let Some(client) = self.owner_of(run_id) {
            if let Err(e) = client.cancel(run_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "worker cancel failed");
            }
            client.remove_active(run_id);
        }

        let event = RunCompletedEvent {
            run_id,
            pipeline_id: run.pipeline_id,
            status: run.status,
        };
        if let Err(e) = self
            .bus
            .publish(
                CHANNEL_RUN_COMPLETED,
                serde_json::to_value(&event).unwrap_or_default(),
            )
            .await
        {
            tracing::warn!(run_id = %run_id, error = %e, "run_completed publish failed");
        }

        Ok(run)
    }

    /// Spawn one fallback poll loop per worker client.
    pub fn spawn_pollers(
        self: Arc<Self>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.clients
            .iter()
            .cloned()
            .map(|client| {
                let reconciler = self.clone();
                let mut shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    tracing::info!(worker = client.base_url(), "status poller started");
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(reconciler.poll_interval) => {}
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    tracing::info!(
                                        worker = client.base_url(),
                                        "status poller shutting down"
                                    );
                                    break;
                                }
                            }
                        }
                        reconciler.poll_client(&client).await;
                    }
                })
            })
            .collect()
    }

    /// One poll pass over a client's active map.
    pub async fn poll_client(&self, client: &Arc<WorkerClient>) {
        for run_id in client.active_ids() {
            let report = match client.fetch_status(run_id).await {
                Ok(Some(report)) => report,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "status poll failed");
                    continue;
                }
            };
            if !report.status.is_terminal() {
                continue;
            }
            let update = status_update_from_report(run_id, report);
            if let Err(e) = self.apply_terminal(client.clone(), update).await {
                tracing::warn!(run_id = %run_id, error = %e, "poll reconciliation failed");
            }
        }
    }
}

fn status_update_from_report(run_id: Uuid, report: RunStatusReport) -> StatusUpdate {
    StatusUpdate {
        run_id,
        status: report.status,
        error: report.error,
        duration_ms: report.duration_ms,
        rows_written: report.rows_written,
        archived_landing_zones: report.archived_landing_zones,
    }
}

/// Split `<namespace>/<zone>` into its parts.
fn split_zone(descriptor: &str) -> Option<(String, String)> {
    let (namespace, zone) = descriptor.split_once('/')?;
    if namespace.is_empty() || zone.is_empty() {
        return None;
    }
    Some((namespace.to_string(), zone.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_descriptor_splits() {
        assert_eq!(
            split_zone("sales/incoming"),
            Some(("sales".into(), "incoming".into()))
        );
        assert_eq!(split_zone("no-slash"), None);
        assert_eq!(split_zone("/zone"), None);
    }
}
