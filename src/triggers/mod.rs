//! Event-driven trigger evaluation.
//!
//! Six trigger kinds map external events to pipeline runs:
//! upload and file-pattern triggers react to landing-zone uploads, webhook
//! triggers to token-authenticated POSTs, pipeline-success triggers to
//! `run_completed` bus events, and the cron / cron-dependency kinds are
//! evaluated on a short ticker. Every fire path goes through the same gate:
//! enabled, past cooldown, pipeline alive. Then create the run, dispatch
//! best-effort, and stamp `last_triggered_at`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use globset::Glob;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use smelter_core::events::{EventBus, RunCompletedEvent, CHANNEL_RUN_COMPLETED};
use smelter_core::ports::{
    Executor, LeaderGate, PipelineStore, Result, RunStore, TriggerStore,
};
use smelter_core::types::{Layer, NewRun, Run, RunStatus, Trigger, TriggerKind};
use smelter_core::SmelterError;

use crate::cron_util::{next_after, parse_cron};
use crate::leader::{confirm_leader, jittered};

/// Cadence for cron / cron-dependency evaluation.
pub const CRON_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Leader-election component name.
const COMPONENT: &str = "trigger-evaluator";

// ============================================================================
// Per-kind config blobs
// ============================================================================

#[derive(Debug, Deserialize)]
struct UploadConfig {
    namespace: String,
    zone: String,
}

#[derive(Debug, Deserialize)]
struct FilePatternConfig {
    namespace: String,
    zone: String,
    pattern: String,
}

#[derive(Debug, Deserialize)]
struct CronConfig {
    cron: String,
}

#[derive(Debug, Deserialize)]
struct DependencyKey {
    namespace: String,
    layer: Layer,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CronDependencyConfig {
    cron: String,
    depends_on: Vec<DependencyKey>,
}

#[derive(Debug, Deserialize)]
struct PipelineSuccessConfig {
    namespace: String,
    layer: Layer,
    name: String,
}

// ============================================================================
// Outcomes
// ============================================================================

/// What a fire attempt did. Skips are ordinary outcomes, not errors: the
/// webhook ingress needs to distinguish a cooldown from a missing pipeline.
#[derive(Debug)]
pub enum FireOutcome {
    Fired(Run),
    CooldownActive,
    Disabled,
    PipelineMissing,
}

// ============================================================================
// Evaluator
// ============================================================================

pub struct TriggerEvaluator {
    triggers: Arc<dyn TriggerStore>,
    pipelines: Arc<dyn PipelineStore>,
    runs: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
    bus: Arc<dyn EventBus>,
    leader: Arc<dyn LeaderGate>,
    cron_tick_interval: Duration,
}

impl TriggerEvaluator {
    pub fn new(
        triggers: Arc<dyn TriggerStore>,
        pipelines: Arc<dyn PipelineStore>,
        runs: Arc<dyn RunStore>,
        executor: Arc<dyn Executor>,
        bus: Arc<dyn EventBus>,
        leader: Arc<dyn LeaderGate>,
    ) -> Self {
        Self {
            triggers,
            pipelines,
            runs,
            executor,
            bus,
            leader,
            cron_tick_interval: CRON_TICK_INTERVAL,
        }
    }

    pub fn with_cron_tick_interval(mut self, interval: Duration) -> Self {
        self.cron_tick_interval = interval;
        self
    }

    // ------------------------------------------------------------------
    // Fire gate
    // ------------------------------------------------------------------

    /// The single gate every path funnels through.
    pub async fn fire(&self, trigger: &Trigger, descriptor: &str) -> Result<FireOutcome> {
        if !trigger.enabled {
            return Ok(FireOutcome::Disabled);
        }
        let now = Utc::now();
        if !trigger.past_cooldown(now) {
            return Ok(FireOutcome::CooldownActive);
        }

        let pipeline = match self.pipelines.get(trigger.pipeline_id).await? {
            Some(p) if !p.is_deleted() => p,
            _ => return Ok(FireOutcome::PipelineMissing),
        };

        let run = self
            .runs
            .create(NewRun {
                pipeline_id: pipeline.id,
                trigger: format!("trigger:{}:{descriptor}", trigger.kind),
                s3_credentials: None,
            })
            .await?;

        match self.executor.submit(&run, &pipeline).await {
            Ok(()) => {}
            Err(e) if e.is_runner_busy() => {
                tracing::info!(
                    trigger_id = %trigger.id,
                    run_id = %run.id,
                    "runners at capacity, triggered run stays pending"
                );
            }
            Err(e) => {
                tracing::warn!(
                    trigger_id = %trigger.id,
                    run_id = %run.id,
                    error = %e,
                    "triggered dispatch failed"
                );
            }
        }

        self.triggers.record_fire(trigger.id, run.id, now).await?;
        tracing::info!(
            trigger_id = %trigger.id,
            kind = %trigger.kind,
            run_id = %run.id,
            "trigger fired"
        );
        Ok(FireOutcome::Fired(run))
    }

    // ------------------------------------------------------------------
    // Upload path
    // ------------------------------------------------------------------

    /// Evaluate upload-reactive triggers for a freshly landed file. Called
    /// fire-and-forget from the upload handler on a server-scoped task.
    pub async fn evaluate_upload(
        &self,
        namespace: &str,
        zone: &str,
        filename: &str,
    ) -> Result<Vec<FireOutcome>> {
        let mut outcomes = Vec::new();

        for trigger in self
            .triggers
            .list_enabled(Some(TriggerKind::LandingZoneUpload))
            .await?
        {
            let config: UploadConfig = match serde_json::from_value(trigger.config.clone()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(trigger_id = %trigger.id, error = %e, "bad upload config");
                    continue;
                }
            };
            if config.namespace == namespace && config.zone == zone {
                outcomes.push(self.fire(&trigger, &format!("{namespace}/{zone}")).await?);
            }
        }

        for trigger in self
            .triggers
            .list_enabled(Some(TriggerKind::FilePattern))
            .await?
        {
            let config: FilePatternConfig = match serde_json::from_value(trigger.config.clone()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(trigger_id = %trigger.id, error = %e, "bad file-pattern config");
                    continue;
                }
            };
            if config.namespace != namespace || config.zone != zone {
                continue;
            }
            let matcher = match Glob::new(&config.pattern) {
                Ok(glob) => glob.compile_matcher(),
                Err(e) => {
                    tracing::warn!(
                        trigger_id = %trigger.id,
                        pattern = %config.pattern,
                        error = %e,
                        "bad file pattern"
                    );
                    continue;
                }
            };
            if matcher.is_match(filename) {
                outcomes.push(self.fire(&trigger, &config.pattern).await?);
            }
        }

        Ok(outcomes)
    }

    // ------------------------------------------------------------------
    // Webhook path
    // ------------------------------------------------------------------

    /// Look up the webhook trigger by token digest and fire it. The stored
    /// digest is re-compared in constant time after the lookup.
    pub async fn fire_webhook(&self, token: &str) -> Result<FireOutcome> {
        let digest = token_sha256_hex(token);
        let trigger = self
            .triggers
            .find_by_token_hash(&digest)
            .await?
            .ok_or_else(|| SmelterError::NotFound("webhook token not recognized".into()))?;

        let stored = trigger.token_sha256.as_deref().unwrap_or_default();
        if stored.as_bytes().ct_eq(digest.as_bytes()).unwrap_u8() != 1 {
            return Err(SmelterError::NotFound("webhook token not recognized".into()));
        }

        self.fire(&trigger, &trigger.id.to_string()).await
    }

    // ------------------------------------------------------------------
    // Cron kinds
    // ------------------------------------------------------------------

    /// One pass over cron and cron-dependency triggers.
    pub async fn tick_crons(&self) -> Result<()> {
        let now = Utc::now();

        for trigger in self.triggers.list_enabled(Some(TriggerKind::Cron)).await? {
            let config: CronConfig = match serde_json::from_value(trigger.config.clone()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(trigger_id = %trigger.id, error = %e, "bad cron config");
                    continue;
                }
            };
            if self.cron_due(&trigger, &config.cron, now) {
                self.fire_logged(&trigger, &config.cron).await;
            }
        }

        for trigger in self
            .triggers
            .list_enabled(Some(TriggerKind::CronDependency))
            .await?
        {
            let config: CronDependencyConfig = match serde_json::from_value(trigger.config.clone())
            {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(trigger_id = %trigger.id, error = %e, "bad cron-dependency config");
                    continue;
                }
            };
            if !self.cron_due(&trigger, &config.cron, now) {
                continue;
            }
            match self.dependencies_satisfied(&trigger, &config).await {
                Ok(true) => self.fire_logged(&trigger, &config.cron).await,
                Ok(false) => {
                    tracing::debug!(
                        trigger_id = %trigger.id,
                        "cron-dependency slot due but dependencies unsatisfied"
                    );
                }
                Err(e) => {
                    tracing::warn!(trigger_id = %trigger.id, error = %e, "dependency check failed");
                }
            }
        }
        Ok(())
    }

    /// A cron trigger is due when the next occurrence after its last fire
    /// (or creation) is in the past.
    fn cron_due(&self, trigger: &Trigger, expr: &str, now: DateTime<Utc>) -> bool {
        let schedule = match parse_cron(expr) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(trigger_id = %trigger.id, error = %e, "bad cron expression");
                return false;
            }
        };
        let base = trigger.last_triggered_at.unwrap_or(trigger.created_at);
        matches!(next_after(&schedule, base), Some(next) if next <= now)
    }

    /// All dependencies' most recent terminal runs must be successful and
    /// newer than this trigger's previous fire.
    async fn dependencies_satisfied(
        &self,
        trigger: &Trigger,
        config: &CronDependencyConfig,
    ) -> Result<bool> {
        let mut dependency_ids = Vec::with_capacity(config.depends_on.len());
        for key in &config.depends_on {
            match self
                .pipelines
                .get_by_key(&key.namespace, key.layer, &key.name)
                .await?
            {
                Some(p) => dependency_ids.push(p.id),
                None => return Ok(false),
            }
        }

        let latest = self.runs.latest_terminal_for_pipelines(&dependency_ids).await?;
        let previous_fire = trigger.last_triggered_at;
        Ok(dependency_ids.iter().all(|id| {
            latest.get(id).is_some_and(|run| {
                run.status == RunStatus::Success
                    && match previous_fire {
                        Some(fired) => run.finished_at.is_some_and(|f| f > fired),
                        None => true,
                    }
            })
        }))
    }

    async fn fire_logged(&self, trigger: &Trigger, descriptor: &str) {
        if let Err(e) = self.fire(trigger, descriptor).await {
            tracing::warn!(trigger_id = %trigger.id, error = %e, "cron trigger fire failed");
        }
    }

    // ------------------------------------------------------------------
    // Pipeline-success subscription
    // ------------------------------------------------------------------

    /// React to a `run_completed` event: fire every pipeline-success trigger
    /// whose configured upstream key matches the completed run's pipeline.
    pub async fn handle_run_completed(&self, event: RunCompletedEvent) -> Result<()> {
        if event.status != RunStatus::Success {
            return Ok(());
        }
        let Some(upstream) = self.pipelines.get(event.pipeline_id).await? else {
            return Ok(());
        };

        for trigger in self
            .triggers
            .list_enabled(Some(TriggerKind::PipelineSuccess))
            .await?
        {
            // A pipeline's own success must not re-fire it.
            if trigger.pipeline_id == upstream.id {
                continue;
            }
            let config: PipelineSuccessConfig = match serde_json::from_value(trigger.config.clone())
            {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(trigger_id = %trigger.id, error = %e, "bad pipeline-success config");
                    continue;
                }
            };
            if config.namespace == upstream.namespace
                && config.layer == upstream.layer
                && config.name == upstream.name
            {
                let descriptor =
                    format!("{}/{}/{}", upstream.namespace, upstream.layer, upstream.name);
                if let Err(e) = self.fire(&trigger, &descriptor).await {
                    tracing::warn!(trigger_id = %trigger.id, error = %e, "downstream fire failed");
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Spawn the cron ticker and the `run_completed` consumer, both behind
    /// the leader gate.
    pub fn spawn(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let evaluator = self.clone();
        let mut cron_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            tracing::info!("trigger cron ticker started");
            loop {
                let delay = if confirm_leader(&evaluator.leader, COMPONENT).await {
                    if let Err(e) = evaluator.tick_crons().await {
                        tracing::warn!(error = %e, "cron trigger tick failed");
                    }
                    evaluator.cron_tick_interval
                } else {
                    jittered(evaluator.cron_tick_interval)
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cron_shutdown.changed() => {
                        if *cron_shutdown.borrow() {
                            tracing::info!("trigger cron ticker shutting down");
                            break;
                        }
                    }
                }
            }
        }));

        let evaluator = self.clone();
        let mut bus_shutdown = shutdown_rx;
        handles.push(tokio::spawn(async move {
            let mut subscription = match evaluator.bus.subscribe(CHANNEL_RUN_COMPLETED).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "run_completed subscription failed");
                    return;
                }
            };
            tracing::info!("run_completed consumer started");
            loop {
                tokio::select! {
                    event = subscription.next() => {
                        let Some(payload) = event else {
                            tracing::warn!("run_completed channel closed");
                            break;
                        };
                        if !confirm_leader(&evaluator.leader, COMPONENT).await {
                            continue;
                        }
                        match serde_json::from_value::<RunCompletedEvent>(payload) {
                            Ok(event) => {
                                if let Err(e) = evaluator.handle_run_completed(event).await {
                                    tracing::warn!(error = %e, "run_completed handling failed");
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "malformed run_completed payload");
                            }
                        }
                    }
                    _ = bus_shutdown.changed() => {
                        if *bus_shutdown.borrow() {
                            tracing::info!("run_completed consumer shutting down");
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }
}

/// SHA-256 hex digest of a webhook token. The plaintext is never stored.
pub fn token_sha256_hex(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_digest_is_stable_hex() {
        let digest = token_sha256_hex("hunter2");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, token_sha256_hex("hunter2"));
        assert_ne!(digest, token_sha256_hex("hunter3"));
    }
}
