//! Domain entities for the Smelter control plane.
//!
//! Every entity here is owned by the durable store; in-memory structures
//! elsewhere (active-run maps, subscriber lists) hold only ids. Status and
//! kind enums round-trip through lowercase/snake_case strings so the wire
//! form and the database form stay identical.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Medallion layer a pipeline writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
        }
    }

    /// Parse a layer name; unknown layers are a validation error at the API
    /// boundary, so this returns `None` rather than defaulting.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bronze" => Some(Self::Bronze),
            "silver" => Some(Self::Silver),
            "gold" => Some(Self::Gold),
            _ => None,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Exactly one terminal transition is ever persisted per run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger variants. Each kind interprets the trigger's opaque config blob
/// with its own shape; see the evaluator for the per-kind structs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    LandingZoneUpload,
    Cron,
    PipelineSuccess,
    Webhook,
    FilePattern,
    CronDependency,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LandingZoneUpload => "landing_zone_upload",
            Self::Cron => "cron",
            Self::PipelineSuccess => "pipeline_success",
            Self::Webhook => "webhook",
            Self::FilePattern => "file_pattern",
            Self::CronDependency => "cron_dependency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "landing_zone_upload" => Some(Self::LandingZoneUpload),
            "cron" => Some(Self::Cron),
            "pipeline_success" => Some(Self::PipelineSuccess),
            "webhook" => Some(Self::Webhook),
            "file_pattern" => Some(Self::FilePattern),
            "cron_dependency" => Some(Self::CronDependency),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Natural key of a pipeline: unique over non-deleted rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineKey {
    pub namespace: String,
    pub layer: Layer,
    pub name: String,
}

impl std::fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.layer, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub namespace: String,
    pub layer: Layer,
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    /// File path → immutable storage version id, snapshot taken at publish.
    pub published_versions: HashMap<String, String>,
    /// True whenever anything under the pipeline's prefix was written since
    /// the last publish.
    pub draft_dirty: bool,
    /// Opaque per-pipeline retention override, merged over the system config
    /// at read time.
    pub retention_override: Option<serde_json::Value>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn key(&self) -> PipelineKey {
        PipelineKey {
            namespace: self.namespace.clone(),
            layer: self.layer,
            name: self.name.clone(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewPipeline {
    pub namespace: String,
    pub layer: Layer,
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
}

/// Per-field optional overrides for a pipeline update.
#[derive(Debug, Clone, Default)]
pub struct PipelinePatch {
    pub description: Option<Option<String>>,
    pub owner: Option<Option<String>>,
    pub draft_dirty: Option<bool>,
    pub retention_override: Option<Option<serde_json::Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineFilter {
    pub namespace: Option<String>,
    pub layer: Option<Layer>,
    /// Substring match on the pipeline name.
    pub name_contains: Option<String>,
    /// Include soft-deleted rows (admin views only).
    pub include_deleted: bool,
}

// ============================================================================
// Run
// ============================================================================

/// Transient S3 credential overrides carried on a submission. Never persisted
/// and never serialized externally; `Debug` redacts the secret.
#[derive(Clone, Serialize, Deserialize)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: RunStatus,
    /// Provenance string: `manual`, `schedule:<cron>`, or
    /// `trigger:<type>:<descriptor>`.
    pub trigger: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub rows_written: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Per-run credential override, carried to the worker on submit only.
    #[serde(skip)]
    pub s3_credentials: Option<S3Credentials>,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub pipeline_id: Uuid,
    pub trigger: String,
    pub s3_credentials: Option<S3Credentials>,
}

/// One-shot terminal write: status plus the optional measurements the worker
/// reported. The store computes `finished_at` (and `duration_ms` from
/// `started_at` when the worker did not report one).
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub status: RunStatus,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub rows_written: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub pipeline_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub trigger_prefix: Option<String>,
}

/// Durations are stored in a 32-bit-safe range: values beyond `i32::MAX`
/// clamp to the maximum on write rather than erroring.
pub fn clamp_duration_ms(ms: i64) -> i64 {
    ms.clamp(0, i32::MAX as i64)
}

// ============================================================================
// Schedule
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    /// 5-field crontab expression.
    pub cron_expr: String,
    pub enabled: bool,
    pub last_run_id: Option<Uuid>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// When null, the next scheduler tick computes it from now and does not
    /// fire.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub pipeline_id: Uuid,
    pub cron_expr: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulePatch {
    pub cron_expr: Option<String>,
    pub enabled: Option<bool>,
    /// `Some(None)` clears `next_run_at`, forcing recomputation on the next
    /// tick.
    pub next_run_at: Option<Option<DateTime<Utc>>>,
}

// ============================================================================
// Trigger
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub kind: TriggerKind,
    /// Opaque per-kind config blob; the evaluator deserializes it.
    pub config: serde_json::Value,
    pub enabled: bool,
    pub cooldown_seconds: i64,
    /// SHA-256 hex digest of the webhook token; only set for webhook
    /// triggers, and the plaintext token is never stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_sha256: Option<String>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    /// Cooldown gate: true when the trigger may fire at `now`.
    pub fn past_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered_at {
            None => true,
            Some(last) => (now - last).num_seconds() >= self.cooldown_seconds,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub pipeline_id: Uuid,
    pub kind: TriggerKind,
    pub config: serde_json::Value,
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub token_sha256: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerPatch {
    pub config: Option<serde_json::Value>,
    pub enabled: Option<bool>,
    pub cooldown_seconds: Option<i64>,
}

// ============================================================================
// Landing zones
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandingZone {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    /// Zones with auto-purge get their `_processed/` prefix cleaned by the
    /// reaper.
    pub auto_purge: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLandingZone {
    pub namespace: String,
    pub name: String,
    pub auto_purge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandingFile {
    pub id: Uuid,
    pub zone_id: Uuid,
    /// Timestamp-prefixed on upload to avoid collisions.
    pub file_name: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub uploaded_by: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLandingFile {
    pub zone_id: Uuid,
    pub file_name: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub uploaded_by: Option<String>,
}

// ============================================================================
// Logs
// ============================================================================

/// A single worker log line, as streamed and as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_kind: String,
    pub entity_id: Option<Uuid>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor: String,
    pub action: String,
    pub entity_kind: String,
    pub entity_id: Option<Uuid>,
    pub detail: serde_json::Value,
}

// ============================================================================
// Pipeline versions
// ============================================================================

/// Snapshot of `published_versions` taken at publish time. Version numbers
/// are monotonic per pipeline; history is pruned to the most recent N.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineVersion {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub version_number: i32,
    pub published_versions: HashMap<String, String>,
    pub published_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Quality tests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityTest {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub name: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityResult {
    pub id: Uuid,
    pub test_id: Uuid,
    pub run_id: Option<Uuid>,
    pub passed: bool,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Retention
// ============================================================================

/// Retention policy. The system-wide singleton carries every field; a
/// per-pipeline override blob may shadow any subset, merged at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub runs_max_per_pipeline: i64,
    pub runs_max_age_days: i64,
    pub stuck_run_timeout_minutes: i64,
    pub logs_max_age_days: i64,
    pub quality_results_max_per_test: i64,
    pub soft_delete_purge_days: i64,
    pub audit_log_max_age_days: i64,
    pub nessie_orphan_branch_max_age_hours: i64,
    pub processed_max_age_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            runs_max_per_pipeline: 100,
            runs_max_age_days: 90,
            stuck_run_timeout_minutes: 120,
            logs_max_age_days: 30,
            quality_results_max_per_test: 50,
            soft_delete_purge_days: 30,
            audit_log_max_age_days: 365,
            nessie_orphan_branch_max_age_hours: 24,
            processed_max_age_days: 7,
        }
    }
}

impl RetentionConfig {
    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &RetentionPatch) {
        if let Some(v) = patch.runs_max_per_pipeline {
            self.runs_max_per_pipeline = v;
        }
        if let Some(v) = patch.runs_max_age_days {
            self.runs_max_age_days = v;
        }
        if let Some(v) = patch.stuck_run_timeout_minutes {
            self.stuck_run_timeout_minutes = v;
        }
        if let Some(v) = patch.logs_max_age_days {
            self.logs_max_age_days = v;
        }
        if let Some(v) = patch.quality_results_max_per_test {
            self.quality_results_max_per_test = v;
        }
        if let Some(v) = patch.soft_delete_purge_days {
            self.soft_delete_purge_days = v;
        }
        if let Some(v) = patch.audit_log_max_age_days {
            self.audit_log_max_age_days = v;
        }
        if let Some(v) = patch.nessie_orphan_branch_max_age_hours {
            self.nessie_orphan_branch_max_age_hours = v;
        }
        if let Some(v) = patch.processed_max_age_days {
            self.processed_max_age_days = v;
        }
    }

    /// Overlay a partial override blob (unknown keys ignored, present keys
    /// shadow).
    pub fn merged_with(&self, override_blob: &serde_json::Value) -> Self {
        let mut base = serde_json::to_value(self).unwrap_or_default();
        if let (Some(base_map), Some(over_map)) = (base.as_object_mut(), override_blob.as_object())
        {
            for (k, v) in over_map {
                if base_map.contains_key(k) && v.is_i64() {
                    base_map.insert(k.clone(), v.clone());
                }
            }
        }
        serde_json::from_value(base).unwrap_or_else(|_| self.clone())
    }
}

/// Per-field partial update for the system retention config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetentionPatch {
    pub runs_max_per_pipeline: Option<i64>,
    pub runs_max_age_days: Option<i64>,
    pub stuck_run_timeout_minutes: Option<i64>,
    pub logs_max_age_days: Option<i64>,
    pub quality_results_max_per_test: Option<i64>,
    pub soft_delete_purge_days: Option<i64>,
    pub audit_log_max_age_days: Option<i64>,
    pub nessie_orphan_branch_max_age_hours: Option<i64>,
    pub processed_max_age_days: Option<i64>,
}

/// Singleton row of last-tick reaper counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReaperStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub runs_pruned: i64,
    pub runs_age_pruned: i64,
    pub stuck_runs_failed: i64,
    pub logs_pruned: i64,
    pub quality_results_pruned: i64,
    pub pipelines_purged: i64,
    pub audit_entries_pruned: i64,
    pub orphan_branches_deleted: i64,
    pub landing_files_purged: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Pagination
// ============================================================================

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;

/// Filter-and-limit pagination, pushed into the query layer. Stores never
/// slice in memory.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    /// Clamp caller-supplied values into the allowed range.
    pub fn clamped(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_rejects_unknown() {
        assert_eq!(Layer::parse("bronze"), Some(Layer::Bronze));
        assert_eq!(Layer::parse("platinum"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn duration_clamps_to_i32_range() {
        assert_eq!(clamp_duration_ms(5_000), 5_000);
        assert_eq!(clamp_duration_ms(i64::MAX), i32::MAX as i64);
        assert_eq!(clamp_duration_ms(-1), 0);
    }

    #[test]
    fn s3_credentials_debug_redacts_secret() {
        let creds = S3Credentials {
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "supersecret".into(),
            session_token: Some("tok".into()),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKIAEXAMPLE"));
        assert!(!rendered.contains("supersecret"));
        assert!(!rendered.contains("tok\""));
    }

    #[test]
    fn run_serializes_without_credentials() {
        let run = Run {
            id: Uuid::new_v4(),
            pipeline_id: Uuid::new_v4(),
            status: RunStatus::Pending,
            trigger: "manual".into(),
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            rows_written: None,
            created_at: Utc::now(),
            s3_credentials: Some(S3Credentials {
                access_key_id: "AKIAEXAMPLE".into(),
                secret_access_key: "supersecret".into(),
                session_token: None,
            }),
        };
        let json = serde_json::to_string(&run).unwrap();
        assert!(!json.contains("supersecret"));
        assert!(!json.contains("s3_credentials"));
    }

    #[test]
    fn cooldown_boundary() {
        let now = Utc::now();
        let trigger = Trigger {
            id: Uuid::new_v4(),
            pipeline_id: Uuid::new_v4(),
            kind: TriggerKind::Webhook,
            config: serde_json::json!({}),
            enabled: true,
            cooldown_seconds: 60,
            token_sha256: None,
            last_triggered_at: Some(now - chrono::Duration::seconds(30)),
            last_run_id: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!trigger.past_cooldown(now));
        let mut later = trigger.clone();
        later.last_triggered_at = Some(now - chrono::Duration::seconds(61));
        assert!(later.past_cooldown(now));
    }

    #[test]
    fn retention_merge_shadows_present_keys() {
        let base = RetentionConfig::default();
        let merged = base.merged_with(&serde_json::json!({
            "runs_max_per_pipeline": 10,
            "unknown_key": 99
        }));
        assert_eq!(merged.runs_max_per_pipeline, 10);
        assert_eq!(merged.runs_max_age_days, base.runs_max_age_days);
    }

    #[test]
    fn page_clamps_limit() {
        let page = Page::clamped(Some(10_000), Some(-5));
        assert_eq!(page.limit, MAX_PAGE_LIMIT);
        assert_eq!(page.offset, 0);
    }
}
