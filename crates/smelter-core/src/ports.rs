//! Store and collaborator port traits.
//! Implemented by smelter-postgres; services depend only on these traits,
//! injected at startup, which is also how the store→bus→evaluator→store
//! cycle is broken: no component holds a handle to the one that holds it.
//!
//! Contracts shared by every store:
//! - list = filter + limit/offset pushed into the query layer;
//! - get-by-key returns `Ok(None)` on not-found;
//! - create returns `SmelterError::AlreadyExists` on uniqueness violations;
//! - bulk queries exist wherever a caller would otherwise loop (N+1).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SmelterError;
pub use crate::types::*;

pub type Result<T> = std::result::Result<T, SmelterError>;

// ============================================================================
// Pipelines
// ============================================================================

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn create(&self, new: NewPipeline) -> Result<Pipeline>;

    async fn get(&self, id: Uuid) -> Result<Option<Pipeline>>;

    /// Lookup by natural key over non-deleted rows.
    async fn get_by_key(&self, namespace: &str, layer: Layer, name: &str)
        -> Result<Option<Pipeline>>;

    async fn list(&self, filter: PipelineFilter, page: Page) -> Result<Vec<Pipeline>>;

    /// Ids of all non-deleted pipelines (reaper per-pipeline phases).
    async fn list_ids(&self) -> Result<Vec<Uuid>>;

    async fn update(&self, id: Uuid, patch: PipelinePatch) -> Result<Option<Pipeline>>;

    /// Replace `published_versions` with the given snapshot and clear
    /// `draft_dirty`.
    async fn publish(&self, id: Uuid, versions: HashMap<String, String>)
        -> Result<Option<Pipeline>>;

    /// Mark deleted by timestamp; the partial unique index permits
    /// re-creating the same `(namespace, layer, name)` afterwards.
    async fn soft_delete(&self, id: Uuid) -> Result<bool>;

    async fn list_soft_deleted_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Pipeline>>;

    async fn hard_delete(&self, id: Uuid) -> Result<bool>;
}

// ============================================================================
// Runs
// ============================================================================

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, new: NewRun) -> Result<Run>;

    async fn get(&self, id: Uuid) -> Result<Option<Run>>;

    async fn list(&self, filter: RunFilter, page: Page) -> Result<Vec<Run>>;

    async fn count(&self, filter: RunFilter) -> Result<i64>;

    /// `pending → running`; sets `started_at` server-side.
    async fn mark_running(&self, id: Uuid) -> Result<()>;

    /// One-shot terminal write. Only applies when the run is not already
    /// terminal (first writer wins); returns the updated run, or `None` when
    /// the run was missing or already terminal. Sets `finished_at`, clamps
    /// `duration_ms`, and computes it from `started_at` when absent.
    async fn finish(&self, id: Uuid, update: TerminalUpdate) -> Result<Option<Run>>;

    /// Most recent terminal run per pipeline, one query.
    async fn latest_terminal_for_pipelines(
        &self,
        pipeline_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Run>>;

    /// Runs still pending/running whose `created_at` is older than the
    /// cutoff.
    async fn list_stuck(&self, older_than: DateTime<Utc>) -> Result<Vec<Run>>;

    /// Transition stuck runs to failed with `error = "stuck"`. Returns the
    /// number transitioned.
    async fn fail_stuck(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Delete terminal runs beyond the `keep` most recent for one pipeline.
    async fn delete_terminal_beyond(&self, pipeline_id: Uuid, keep: i64) -> Result<u64>;

    /// Delete terminal runs for one pipeline finished before the cutoff.
    async fn delete_terminal_before(&self, pipeline_id: Uuid, cutoff: DateTime<Utc>)
        -> Result<u64>;
}

// ============================================================================
// Schedules
// ============================================================================

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create(&self, new: NewSchedule) -> Result<Schedule>;

    async fn get(&self, id: Uuid) -> Result<Option<Schedule>>;

    async fn list(&self, pipeline_id: Option<Uuid>, page: Page) -> Result<Vec<Schedule>>;

    /// Every schedule, for the scheduler tick.
    async fn list_all(&self) -> Result<Vec<Schedule>>;

    async fn update(&self, id: Uuid, patch: SchedulePatch) -> Result<Option<Schedule>>;

    async fn set_next_run_at(&self, id: Uuid, next: DateTime<Utc>) -> Result<()>;

    /// Record a fire: `last_run_id`, `last_run_at`, and the advanced
    /// `next_run_at` in one write.
    async fn record_fire(
        &self,
        id: Uuid,
        run_id: Uuid,
        fired_at: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

// ============================================================================
// Triggers
// ============================================================================

#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn create(&self, new: NewTrigger) -> Result<Trigger>;

    async fn get(&self, id: Uuid) -> Result<Option<Trigger>>;

    async fn list(&self, pipeline_id: Option<Uuid>, page: Page) -> Result<Vec<Trigger>>;

    /// Enabled triggers, optionally narrowed to one kind.
    async fn list_enabled(&self, kind: Option<TriggerKind>) -> Result<Vec<Trigger>>;

    /// Webhook lookup by SHA-256 hex digest of the presented token.
    async fn find_by_token_hash(&self, token_sha256: &str) -> Result<Option<Trigger>>;

    async fn update(&self, id: Uuid, patch: TriggerPatch) -> Result<Option<Trigger>>;

    async fn record_fire(&self, id: Uuid, run_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

// ============================================================================
// Landing zones
// ============================================================================

#[async_trait]
pub trait LandingStore: Send + Sync {
    async fn create_zone(&self, new: NewLandingZone) -> Result<LandingZone>;

    async fn get_zone(&self, namespace: &str, name: &str) -> Result<Option<LandingZone>>;

    async fn list_zones(&self, page: Page) -> Result<Vec<LandingZone>>;

    async fn list_auto_purge_zones(&self) -> Result<Vec<LandingZone>>;

    /// Deleting a zone cascades its file records.
    async fn delete_zone(&self, id: Uuid) -> Result<bool>;

    async fn add_file(&self, new: NewLandingFile) -> Result<LandingFile>;

    async fn list_files(&self, zone_id: Uuid, page: Page) -> Result<Vec<LandingFile>>;

    async fn delete_files_for_zone(&self, zone_id: Uuid) -> Result<u64>;
}

// ============================================================================
// Logs
// ============================================================================

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn persist(&self, run_id: Uuid, entries: &[LogEntry]) -> Result<u64>;

    async fn list(&self, run_id: Uuid, page: Page) -> Result<Vec<LogEntry>>;

    /// Delete log rows whose run finished before the cutoff.
    async fn delete_for_runs_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

// ============================================================================
// Audit
// ============================================================================

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry>;

    async fn list(&self, entity_kind: Option<String>, page: Page) -> Result<Vec<AuditEntry>>;

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

// ============================================================================
// Pipeline versions
// ============================================================================

#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Assign the next monotonic version number, snapshot the published map,
    /// and prune history to the `keep` most recent.
    async fn record(
        &self,
        pipeline_id: Uuid,
        versions: HashMap<String, String>,
        published_by: Option<String>,
        keep: i64,
    ) -> Result<PipelineVersion>;

    async fn list(&self, pipeline_id: Uuid, page: Page) -> Result<Vec<PipelineVersion>>;
}

// ============================================================================
// Quality tests
// ============================================================================

#[async_trait]
pub trait QualityStore: Send + Sync {
    async fn create_test(&self, pipeline_id: Uuid, name: &str, config: serde_json::Value)
        -> Result<QualityTest>;

    async fn list_tests(&self, pipeline_id: Uuid, page: Page) -> Result<Vec<QualityTest>>;

    async fn record_result(
        &self,
        test_id: Uuid,
        run_id: Option<Uuid>,
        passed: bool,
        detail: serde_json::Value,
    ) -> Result<QualityResult>;

    /// Keep the `keep` most recent results per test; returns rows deleted.
    async fn prune_results(&self, keep: i64) -> Result<u64>;
}

// ============================================================================
// Retention & reaper status
// ============================================================================

#[async_trait]
pub trait RetentionStore: Send + Sync {
    /// System-wide singleton, defaults when the row is absent.
    async fn system(&self) -> Result<RetentionConfig>;

    async fn update_system(&self, patch: RetentionPatch) -> Result<RetentionConfig>;

    /// System config overlaid with the pipeline's override blob, merged at
    /// read time.
    async fn merged(&self, pipeline_id: Uuid) -> Result<RetentionConfig>;

    async fn reaper_status(&self) -> Result<ReaperStatus>;

    async fn update_reaper_status(&self, status: ReaperStatus) -> Result<()>;
}

// ============================================================================
// Feature flags
// ============================================================================

#[async_trait]
pub trait FeatureFlagStore: Send + Sync {
    async fn all(&self) -> Result<serde_json::Value>;

    async fn get(&self, name: &str) -> Result<Option<serde_json::Value>>;

    async fn set(&self, name: &str, value: serde_json::Value) -> Result<()>;
}

// ============================================================================
// Executor capability
// ============================================================================

/// Worker dispatch capability: implemented once by the per-worker client and
/// wrapped once by the round-robin dispatcher. Submit owns the store
/// transitions (`pending → running` on success, `pending → failed` on fatal
/// error) and returns `SmelterError::RunnerBusy` on capacity exhaustion
/// without touching the store.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn submit(&self, run: &Run, pipeline: &Pipeline) -> Result<()>;

    /// Cancel on whichever worker owns the run; true when a worker
    /// acknowledged the cancel.
    async fn cancel(&self, run_id: Uuid) -> Result<bool>;

    /// Collect the run's log stream (non-follow) from the owning worker.
    async fn get_logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>>;

    async fn preview(&self, pipeline: &Pipeline, sql: &str) -> Result<QueryResult>;

    async fn validate(&self, pipeline: &Pipeline) -> Result<QueryResult>;
}

/// Decoded preview/validate result: columnar payload flattened into row maps.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, serde_json::Value>>,
    pub phases: Vec<String>,
    pub explain: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

// ============================================================================
// Leader election
// ============================================================================

/// Single-instance gate for the scheduler, reaper, and trigger evaluator in
/// multi-replica deployments. Writers (API, callback ingress) never take it.
#[async_trait]
pub trait LeaderGate: Send + Sync {
    /// Try to become, or confirm still being, the leader for a component.
    /// Idempotent for the holder; non-holders get `false` and retry later.
    async fn try_lead(&self, component: &str) -> Result<bool>;

    /// Release a held lease. No-op when not held.
    async fn release(&self, component: &str) -> Result<()>;
}

// ============================================================================
// External collaborators
// ============================================================================

/// Metadata catalog (branch bookkeeping). Only the reaper's orphan-branch
/// phase talks to it; absence disables that phase.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn list_branches(&self) -> Result<Vec<String>>;

    async fn delete_branch(&self, name: &str) -> Result<()>;
}

/// Object storage listing/deletion for landing-zone cleanup. The control
/// plane never reads object bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: i64,
}

// ============================================================================
// Store bundle
// ============================================================================

/// Every port handle the services need, wired once at startup.
#[derive(Clone)]
pub struct Stores {
    pub pipelines: Arc<dyn PipelineStore>,
    pub runs: Arc<dyn RunStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub triggers: Arc<dyn TriggerStore>,
    pub landing: Arc<dyn LandingStore>,
    pub logs: Arc<dyn LogStore>,
    pub audit: Arc<dyn AuditStore>,
    pub versions: Arc<dyn VersionStore>,
    pub quality: Arc<dyn QualityStore>,
    pub retention: Arc<dyn RetentionStore>,
    pub flags: Arc<dyn FeatureFlagStore>,
}
