//! In-memory implementations of every port, sharing the Postgres
//! implementations' observable semantics: unique-key conflicts, soft-delete
//! visibility, first-writer-wins terminal transitions, bounded event-bus
//! buffers. Unit and integration tests run against these instead of a live
//! database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SmelterError;
use crate::events::{EventBus, Subscription, SUBSCRIBER_BUFFER};
use crate::ports::*;
use crate::types::*;

// ============================================================================
// Pipelines
// ============================================================================

#[derive(Default)]
pub struct MemoryPipelineStore {
    rows: Mutex<Vec<Pipeline>>,
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn create(&self, new: NewPipeline) -> Result<Pipeline> {
        let mut rows = self.rows.lock().unwrap();
        let dup = rows.iter().any(|p| {
            p.deleted_at.is_none()
                && p.namespace == new.namespace
                && p.layer == new.layer
                && p.name == new.name
        });
        if dup {
            return Err(SmelterError::AlreadyExists(format!(
                "pipeline {}/{}/{}",
                new.namespace, new.layer, new.name
            )));
        }
        let now = Utc::now();
        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            namespace: new.namespace,
            layer: new.layer,
            name: new.name,
            description: new.description,
            owner: new.owner,
            published_versions: HashMap::new(),
            draft_dirty: false,
            retention_override: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        rows.push(pipeline.clone());
        Ok(pipeline)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Pipeline>> {
        Ok(self.rows.lock().unwrap().iter().find(|p| p.id == id).cloned())
    }

    async fn get_by_key(
        &self,
        namespace: &str,
        layer: Layer,
        name: &str,
    ) -> Result<Option<Pipeline>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|p| {
                p.deleted_at.is_none()
                    && p.namespace == namespace
                    && p.layer == layer
                    && p.name == name
            })
            .cloned())
    }

    async fn list(&self, filter: PipelineFilter, page: Page) -> Result<Vec<Pipeline>> {
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<Pipeline> = rows
            .iter()
            .filter(|p| filter.include_deleted || p.deleted_at.is_none())
            .filter(|p| filter.namespace.as_deref().is_none_or(|ns| p.namespace == ns))
            .filter(|p| filter.layer.is_none_or(|l| p.layer == l))
            .filter(|p| {
                filter
                    .name_contains
                    .as_deref()
                    .is_none_or(|q| p.name.contains(q))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(matched, page))
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.deleted_at.is_none())
            .map(|p| p.id)
            .collect())
    }

    async fn update(&self, id: Uuid, patch: PipelinePatch) -> Result<Option<Pipeline>> {
        let mut rows = self.rows.lock().unwrap();
        let Some(p) = rows.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        if let Some(description) = patch.description {
            p.description = description;
        }
        if let Some(owner) = patch.owner {
            p.owner = owner;
        }
        if let Some(dirty) = patch.draft_dirty {
            p.draft_dirty = dirty;
        }
        if let Some(retention) = patch.retention_override {
            p.retention_override = retention;
        }
        p.updated_at = Utc::now();
        Ok(Some(p.clone()))
    }

    async fn publish(
        &self,
        id: Uuid,
        versions: HashMap<String, String>,
    ) -> Result<Option<Pipeline>> {
        let mut rows = self.rows.lock().unwrap();
        let Some(p) = rows.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        p.published_versions = versions;
        p.draft_dirty = false;
        p.updated_at = Utc::now();
        Ok(Some(p.clone()))
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|p| p.id == id && p.deleted_at.is_none()) {
            Some(p) => {
                p.deleted_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_soft_deleted_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Pipeline>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.deleted_at.is_some_and(|d| d < cutoff))
            .cloned()
            .collect())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|p| p.id != id);
        Ok(rows.len() < before)
    }
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Default)]
pub struct MemoryRunStore {
    rows: Mutex<Vec<Run>>,
}

impl MemoryRunStore {
    fn matches(filter: &RunFilter, run: &Run) -> bool {
        filter.pipeline_id.is_none_or(|id| run.pipeline_id == id)
            && filter.status.is_none_or(|s| run.status == s)
            && filter
                .trigger_prefix
                .as_deref()
                .is_none_or(|p| run.trigger.starts_with(p))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, new: NewRun) -> Result<Run> {
        let run = Run {
            id: Uuid::new_v4(),
            pipeline_id: new.pipeline_id,
            status: RunStatus::Pending,
            trigger: new.trigger,
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            rows_written: None,
            created_at: Utc::now(),
            s3_credentials: new.s3_credentials,
        };
        self.rows.lock().unwrap().push(run.clone());
        Ok(run)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, filter: RunFilter, page: Page) -> Result<Vec<Run>> {
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<Run> = rows
            .iter()
            .filter(|r| Self::matches(&filter, r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(matched, page))
    }

    async fn count(&self, filter: RunFilter) -> Result<i64> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| Self::matches(&filter, r))
            .count() as i64)
    }

    async fn mark_running(&self, id: Uuid) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.iter_mut().find(|r| r.id == id && r.status == RunStatus::Pending) {
            r.status = RunStatus::Running;
            r.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn finish(&self, id: Uuid, update: TerminalUpdate) -> Result<Option<Run>> {
        if !update.status.is_terminal() {
            return Err(SmelterError::InvalidArgument(format!(
                "finish requires a terminal status, got {}",
                update.status
            )));
        }
        let mut rows = self.rows.lock().unwrap();
        let Some(r) = rows
            .iter_mut()
            .find(|r| r.id == id && !r.status.is_terminal())
        else {
            return Ok(None);
        };
        let now = Utc::now();
        r.status = update.status;
        r.error = update.error;
        r.finished_at = Some(now);
        r.duration_ms = update
            .duration_ms
            .or_else(|| r.started_at.map(|s| (now - s).num_milliseconds()))
            .map(clamp_duration_ms);
        r.rows_written = update.rows_written;
        Ok(Some(r.clone()))
    }

    async fn latest_terminal_for_pipelines(
        &self,
        pipeline_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Run>> {
        let rows = self.rows.lock().unwrap();
        let mut latest: HashMap<Uuid, Run> = HashMap::new();
        for run in rows.iter() {
            if !run.status.is_terminal() || !pipeline_ids.contains(&run.pipeline_id) {
                continue;
            }
            let newer = latest
                .get(&run.pipeline_id)
                .is_none_or(|cur| run.finished_at > cur.finished_at);
            if newer {
                latest.insert(run.pipeline_id, run.clone());
            }
        }
        Ok(latest)
    }

    async fn list_stuck(&self, older_than: DateTime<Utc>) -> Result<Vec<Run>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.status.is_terminal() && r.created_at < older_than)
            .cloned()
            .collect())
    }

    async fn fail_stuck(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let now = Utc::now();
        let mut n = 0;
        for r in rows
            .iter_mut()
            .filter(|r| !r.status.is_terminal() && r.created_at < older_than)
        {
            r.status = RunStatus::Failed;
            r.error = Some("stuck".into());
            r.finished_at = Some(now);
            n += 1;
        }
        Ok(n)
    }

    async fn delete_terminal_beyond(&self, pipeline_id: Uuid, keep: i64) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut terminal: Vec<(Uuid, DateTime<Utc>)> = rows
            .iter()
            .filter(|r| r.pipeline_id == pipeline_id && r.status.is_terminal())
            .map(|r| (r.id, r.created_at))
            .collect();
        terminal.sort_by(|a, b| b.1.cmp(&a.1));
        let doomed: Vec<Uuid> = terminal
            .into_iter()
            .skip(keep.max(0) as usize)
            .map(|(id, _)| id)
            .collect();
        let before = rows.len();
        rows.retain(|r| !doomed.contains(&r.id));
        Ok((before - rows.len()) as u64)
    }

    async fn delete_terminal_before(
        &self,
        pipeline_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| {
            !(r.pipeline_id == pipeline_id
                && r.status.is_terminal()
                && r.finished_at.is_some_and(|f| f < cutoff))
        });
        Ok((before - rows.len()) as u64)
    }
}

// ============================================================================
// Schedules
// ============================================================================

#[derive(Default)]
pub struct MemoryScheduleStore {
    rows: Mutex<Vec<Schedule>>,
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn create(&self, new: NewSchedule) -> Result<Schedule> {
        let now = Utc::now();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            pipeline_id: new.pipeline_id,
            cron_expr: new.cron_expr,
            enabled: new.enabled,
            last_run_id: None,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().unwrap().push(schedule.clone());
        Ok(schedule)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Schedule>> {
        Ok(self.rows.lock().unwrap().iter().find(|s| s.id == id).cloned())
    }

    async fn list(&self, pipeline_id: Option<Uuid>, page: Page) -> Result<Vec<Schedule>> {
        let rows = self.rows.lock().unwrap();
        let matched: Vec<Schedule> = rows
            .iter()
            .filter(|s| pipeline_id.is_none_or(|id| s.pipeline_id == id))
            .cloned()
            .collect();
        Ok(paginate(matched, page))
    }

    async fn list_all(&self) -> Result<Vec<Schedule>> {
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn update(&self, id: Uuid, patch: SchedulePatch) -> Result<Option<Schedule>> {
        let mut rows = self.rows.lock().unwrap();
        let Some(s) = rows.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };
        if let Some(expr) = patch.cron_expr {
            s.cron_expr = expr;
        }
        if let Some(enabled) = patch.enabled {
            s.enabled = enabled;
        }
        if let Some(next) = patch.next_run_at {
            s.next_run_at = next;
        }
        s.updated_at = Utc::now();
        Ok(Some(s.clone()))
    }

    async fn set_next_run_at(&self, id: Uuid, next: DateTime<Utc>) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(s) = rows.iter_mut().find(|s| s.id == id) {
            s.next_run_at = Some(next);
            s.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_fire(
        &self,
        id: Uuid,
        run_id: Uuid,
        fired_at: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(s) = rows.iter_mut().find(|s| s.id == id) {
            s.last_run_id = Some(run_id);
            s.last_run_at = Some(fired_at);
            s.next_run_at = Some(next);
            s.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|s| s.id != id);
        Ok(rows.len() < before)
    }
}

// ============================================================================
// Triggers
// ============================================================================

#[derive(Default)]
pub struct MemoryTriggerStore {
    rows: Mutex<Vec<Trigger>>,
}

#[async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn create(&self, new: NewTrigger) -> Result<Trigger> {
        let now = Utc::now();
        let trigger = Trigger {
            id: Uuid::new_v4(),
            pipeline_id: new.pipeline_id,
            kind: new.kind,
            config: new.config,
            enabled: new.enabled,
            cooldown_seconds: new.cooldown_seconds,
            token_sha256: new.token_sha256,
            last_triggered_at: None,
            last_run_id: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().unwrap().push(trigger.clone());
        Ok(trigger)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Trigger>> {
        Ok(self.rows.lock().unwrap().iter().find(|t| t.id == id).cloned())
    }

    async fn list(&self, pipeline_id: Option<Uuid>, page: Page) -> Result<Vec<Trigger>> {
        let rows = self.rows.lock().unwrap();
        let matched: Vec<Trigger> = rows
            .iter()
            .filter(|t| pipeline_id.is_none_or(|id| t.pipeline_id == id))
            .cloned()
            .collect();
        Ok(paginate(matched, page))
    }

    async fn list_enabled(&self, kind: Option<TriggerKind>) -> Result<Vec<Trigger>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.enabled && kind.is_none_or(|k| t.kind == k))
            .cloned()
            .collect())
    }

    async fn find_by_token_hash(&self, token_sha256: &str) -> Result<Option<Trigger>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.token_sha256.as_deref() == Some(token_sha256))
            .cloned())
    }

    async fn update(&self, id: Uuid, patch: TriggerPatch) -> Result<Option<Trigger>> {
        let mut rows = self.rows.lock().unwrap();
        let Some(t) = rows.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        if let Some(config) = patch.config {
            t.config = config;
        }
        if let Some(enabled) = patch.enabled {
            t.enabled = enabled;
        }
        if let Some(cooldown) = patch.cooldown_seconds {
            t.cooldown_seconds = cooldown;
        }
        t.updated_at = Utc::now();
        Ok(Some(t.clone()))
    }

    async fn record_fire(&self, id: Uuid, run_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(t) = rows.iter_mut().find(|t| t.id == id) {
            t.last_triggered_at = Some(at);
            t.last_run_id = Some(run_id);
            t.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|t| t.id != id);
        Ok(rows.len() < before)
    }
}

// ============================================================================
// Landing zones
// ============================================================================

#[derive(Default)]
pub struct MemoryLandingStore {
    zones: Mutex<Vec<LandingZone>>,
    files: Mutex<Vec<LandingFile>>,
}

#[async_trait]
impl LandingStore for MemoryLandingStore {
    async fn create_zone(&self, new: NewLandingZone) -> Result<LandingZone> {
        let mut zones = self.zones.lock().unwrap();
        if zones
            .iter()
            .any(|z| z.namespace == new.namespace && z.name == new.name)
        {
            return Err(SmelterError::AlreadyExists(format!(
                "landing zone {}/{}",
                new.namespace, new.name
            )));
        }
        let zone = LandingZone {
            id: Uuid::new_v4(),
            namespace: new.namespace,
            name: new.name,
            auto_purge: new.auto_purge,
            created_at: Utc::now(),
        };
        zones.push(zone.clone());
        Ok(zone)
    }

    async fn get_zone(&self, namespace: &str, name: &str) -> Result<Option<LandingZone>> {
        Ok(self
            .zones
            .lock()
            .unwrap()
            .iter()
            .find(|z| z.namespace == namespace && z.name == name)
            .cloned())
    }

    async fn list_zones(&self, page: Page) -> Result<Vec<LandingZone>> {
        Ok(paginate(self.zones.lock().unwrap().clone(), page))
    }

    async fn list_auto_purge_zones(&self) -> Result<Vec<LandingZone>> {
        Ok(self
            .zones
            .lock()
            .unwrap()
            .iter()
            .filter(|z| z.auto_purge)
            .cloned()
            .collect())
    }

    async fn delete_zone(&self, id: Uuid) -> Result<bool> {
        let mut zones = self.zones.lock().unwrap();
        let before = zones.len();
        zones.retain(|z| z.id != id);
        if zones.len() < before {
            self.files.lock().unwrap().retain(|f| f.zone_id != id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn add_file(&self, new: NewLandingFile) -> Result<LandingFile> {
        let file = LandingFile {
            id: Uuid::new_v4(),
            zone_id: new.zone_id,
            file_name: new.file_name,
            size_bytes: new.size_bytes,
            content_type: new.content_type,
            uploaded_by: new.uploaded_by,
            uploaded_at: Utc::now(),
        };
        self.files.lock().unwrap().push(file.clone());
        Ok(file)
    }

    async fn list_files(&self, zone_id: Uuid, page: Page) -> Result<Vec<LandingFile>> {
        let files = self.files.lock().unwrap();
        let matched: Vec<LandingFile> = files
            .iter()
            .filter(|f| f.zone_id == zone_id)
            .cloned()
            .collect();
        Ok(paginate(matched, page))
    }

    async fn delete_files_for_zone(&self, zone_id: Uuid) -> Result<u64> {
        let mut files = self.files.lock().unwrap();
        let before = files.len();
        files.retain(|f| f.zone_id != zone_id);
        Ok((before - files.len()) as u64)
    }
}

// ============================================================================
// Logs
// ============================================================================

#[derive(Default)]
pub struct MemoryLogStore {
    rows: Mutex<Vec<(Uuid, LogEntry)>>,
    /// run id → finished_at, mirrored in for age-based pruning.
    finished: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl MemoryLogStore {
    /// Test helper: record when a run finished so age pruning has a basis.
    pub fn set_run_finished_at(&self, run_id: Uuid, at: DateTime<Utc>) {
        self.finished.lock().unwrap().insert(run_id, at);
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn persist(&self, run_id: Uuid, entries: &[LogEntry]) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        for e in entries {
            rows.push((run_id, e.clone()));
        }
        Ok(entries.len() as u64)
    }

    async fn list(&self, run_id: Uuid, page: Page) -> Result<Vec<LogEntry>> {
        let rows = self.rows.lock().unwrap();
        let matched: Vec<LogEntry> = rows
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, e)| e.clone())
            .collect();
        Ok(paginate(matched, page))
    }

    async fn delete_for_runs_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let finished = self.finished.lock().unwrap();
        let doomed: Vec<Uuid> = finished
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        drop(finished);
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|(id, _)| !doomed.contains(id));
        Ok((before - rows.len()) as u64)
    }
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Default)]
pub struct MemoryAuditStore {
    rows: Mutex<Vec<AuditEntry>>,
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let row = AuditEntry {
            id: Uuid::new_v4(),
            actor: entry.actor,
            action: entry.action,
            entity_kind: entry.entity_kind,
            entity_id: entry.entity_id,
            detail: entry.detail,
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn list(&self, entity_kind: Option<String>, page: Page) -> Result<Vec<AuditEntry>> {
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<AuditEntry> = rows
            .iter()
            .filter(|e| entity_kind.as_deref().is_none_or(|k| e.entity_kind == k))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(matched, page))
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|e| e.created_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

// ============================================================================
// Pipeline versions
// ============================================================================

#[derive(Default)]
pub struct MemoryVersionStore {
    rows: Mutex<Vec<PipelineVersion>>,
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn record(
        &self,
        pipeline_id: Uuid,
        versions: HashMap<String, String>,
        published_by: Option<String>,
        keep: i64,
    ) -> Result<PipelineVersion> {
        let mut rows = self.rows.lock().unwrap();
        let next_number = rows
            .iter()
            .filter(|v| v.pipeline_id == pipeline_id)
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;
        let version = PipelineVersion {
            id: Uuid::new_v4(),
            pipeline_id,
            version_number: next_number,
            published_versions: versions,
            published_by,
            created_at: Utc::now(),
        };
        rows.push(version.clone());

        // Prune to the most recent `keep` for this pipeline.
        let mut numbers: Vec<i32> = rows
            .iter()
            .filter(|v| v.pipeline_id == pipeline_id)
            .map(|v| v.version_number)
            .collect();
        numbers.sort_unstable_by(|a, b| b.cmp(a));
        if let Some(&floor) = numbers.get(keep.max(1) as usize - 1) {
            rows.retain(|v| v.pipeline_id != pipeline_id || v.version_number >= floor);
        }
        Ok(version)
    }

    async fn list(&self, pipeline_id: Uuid, page: Page) -> Result<Vec<PipelineVersion>> {
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<PipelineVersion> = rows
            .iter()
            .filter(|v| v.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.version_number.cmp(&a.version_number));
        Ok(paginate(matched, page))
    }
}

// ============================================================================
// Quality tests
// ============================================================================

#[derive(Default)]
pub struct MemoryQualityStore {
    tests: Mutex<Vec<QualityTest>>,
    results: Mutex<Vec<QualityResult>>,
}

#[async_trait]
impl QualityStore for MemoryQualityStore {
    async fn create_test(
        &self,
        pipeline_id: Uuid,
        name: &str,
        config: serde_json::Value,
    ) -> Result<QualityTest> {
        let test = QualityTest {
            id: Uuid::new_v4(),
            pipeline_id,
            name: name.to_string(),
            config,
            created_at: Utc::now(),
        };
        self.tests.lock().unwrap().push(test.clone());
        Ok(test)
    }

    async fn list_tests(&self, pipeline_id: Uuid, page: Page) -> Result<Vec<QualityTest>> {
        let tests = self.tests.lock().unwrap();
        let matched: Vec<QualityTest> = tests
            .iter()
            .filter(|t| t.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        Ok(paginate(matched, page))
    }

    async fn record_result(
        &self,
        test_id: Uuid,
        run_id: Option<Uuid>,
        passed: bool,
        detail: serde_json::Value,
    ) -> Result<QualityResult> {
        let result = QualityResult {
            id: Uuid::new_v4(),
            test_id,
            run_id,
            passed,
            detail,
            created_at: Utc::now(),
        };
        self.results.lock().unwrap().push(result.clone());
        Ok(result)
    }

    async fn prune_results(&self, keep: i64) -> Result<u64> {
        let mut results = self.results.lock().unwrap();
        let mut by_test: HashMap<Uuid, Vec<(Uuid, DateTime<Utc>)>> = HashMap::new();
        for r in results.iter() {
            by_test.entry(r.test_id).or_default().push((r.id, r.created_at));
        }
        let mut doomed: Vec<Uuid> = Vec::new();
        for entries in by_test.values_mut() {
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            doomed.extend(entries.iter().skip(keep.max(0) as usize).map(|(id, _)| *id));
        }
        let before = results.len();
        results.retain(|r| !doomed.contains(&r.id));
        Ok((before - results.len()) as u64)
    }
}

// ============================================================================
// Retention
// ============================================================================

pub struct MemoryRetentionStore {
    system: Mutex<RetentionConfig>,
    status: Mutex<ReaperStatus>,
    /// Pipeline override lookups delegate here.
    pipelines: Arc<dyn PipelineStore>,
}

impl MemoryRetentionStore {
    pub fn new(pipelines: Arc<dyn PipelineStore>) -> Self {
        Self {
            system: Mutex::new(RetentionConfig::default()),
            status: Mutex::new(ReaperStatus::default()),
            pipelines,
        }
    }
}

#[async_trait]
impl RetentionStore for MemoryRetentionStore {
    async fn system(&self) -> Result<RetentionConfig> {
        Ok(self.system.lock().unwrap().clone())
    }

    async fn update_system(&self, patch: RetentionPatch) -> Result<RetentionConfig> {
        let mut system = self.system.lock().unwrap();
        system.apply(&patch);
        Ok(system.clone())
    }

    async fn merged(&self, pipeline_id: Uuid) -> Result<RetentionConfig> {
        let system = self.system.lock().unwrap().clone();
        let pipeline = self.pipelines.get(pipeline_id).await?;
        Ok(match pipeline.and_then(|p| p.retention_override) {
            Some(blob) => system.merged_with(&blob),
            None => system,
        })
    }

    async fn reaper_status(&self) -> Result<ReaperStatus> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn update_reaper_status(&self, status: ReaperStatus) -> Result<()> {
        *self.status.lock().unwrap() = status;
        Ok(())
    }
}

// ============================================================================
// Feature flags
// ============================================================================

#[derive(Default)]
pub struct MemoryFeatureFlagStore {
    flags: Mutex<serde_json::Map<String, serde_json::Value>>,
}

#[async_trait]
impl FeatureFlagStore for MemoryFeatureFlagStore {
    async fn all(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Object(self.flags.lock().unwrap().clone()))
    }

    async fn get(&self, name: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.flags.lock().unwrap().get(name).cloned())
    }

    async fn set(&self, name: &str, value: serde_json::Value) -> Result<()> {
        self.flags.lock().unwrap().insert(name.to_string(), value);
        Ok(())
    }
}

// ============================================================================
// Event bus
// ============================================================================

/// Broadcast-style bus with bounded per-subscriber buffers. Full buffers
/// drop the event with a warn; closed receivers are pruned on publish.
#[derive(Default)]
pub struct MemoryEventBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<serde_json::Value>>>>,
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()> {
        // Snapshot under the lock, deliver outside it.
        let senders: Vec<mpsc::Sender<serde_json::Value>> = {
            let subs = self.subscribers.lock().unwrap();
            subs.get(channel).cloned().unwrap_or_default()
        };
        let mut closed = false;
        for tx in &senders {
            match tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(channel, "event-bus subscriber buffer full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
            }
        }
        if closed {
            let mut subs = self.subscribers.lock().unwrap();
            if let Some(list) = subs.get_mut(channel) {
                list.retain(|tx| !tx.is_closed());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription { receiver: rx })
    }
}

// ============================================================================
// Leader election
// ============================================================================

/// Single-process gate: always wins. Multi-replica semantics only exist with
/// the advisory-lock implementation.
#[derive(Default)]
pub struct AlwaysLeader;

#[async_trait]
impl LeaderGate for AlwaysLeader {
    async fn try_lead(&self, _component: &str) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self, _component: &str) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// External collaborators
// ============================================================================

#[derive(Default)]
pub struct MemoryCatalogClient {
    pub branches: Mutex<Vec<String>>,
}

#[async_trait]
impl CatalogClient for MemoryCatalogClient {
    async fn list_branches(&self) -> Result<Vec<String>> {
        Ok(self.branches.lock().unwrap().clone())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        self.branches.lock().unwrap().retain(|b| b != name);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<Vec<ObjectMeta>>,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().retain(|o| o.key != key);
        Ok(())
    }
}

// ============================================================================
// Wiring helper
// ============================================================================

/// A complete in-memory store bundle for tests.
pub fn memory_stores() -> Stores {
    let pipelines: Arc<dyn PipelineStore> = Arc::new(MemoryPipelineStore::default());
    Stores {
        pipelines: pipelines.clone(),
        runs: Arc::new(MemoryRunStore::default()),
        schedules: Arc::new(MemoryScheduleStore::default()),
        triggers: Arc::new(MemoryTriggerStore::default()),
        landing: Arc::new(MemoryLandingStore::default()),
        logs: Arc::new(MemoryLogStore::default()),
        audit: Arc::new(MemoryAuditStore::default()),
        versions: Arc::new(MemoryVersionStore::default()),
        quality: Arc::new(MemoryQualityStore::default()),
        retention: Arc::new(MemoryRetentionStore::new(pipelines)),
        flags: Arc::new(MemoryFeatureFlagStore::default()),
    }
}

fn paginate<T>(rows: Vec<T>, page: Page) -> Vec<T> {
    rows.into_iter()
        .skip(page.offset.max(0) as usize)
        .take(page.limit.max(0) as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_pipeline(name: &str) -> NewPipeline {
        NewPipeline {
            namespace: "sales".into(),
            layer: Layer::Bronze,
            name: name.into(),
            description: None,
            owner: None,
        }
    }

    #[tokio::test]
    async fn duplicate_pipeline_key_is_already_exists() {
        let store = MemoryPipelineStore::default();
        store.create(new_pipeline("orders")).await.unwrap();
        let err = store.create(new_pipeline("orders")).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn soft_deleted_key_can_be_recreated() {
        let store = MemoryPipelineStore::default();
        let p = store.create(new_pipeline("orders")).await.unwrap();
        assert!(store.soft_delete(p.id).await.unwrap());
        store.create(new_pipeline("orders")).await.unwrap();
        assert!(store
            .get_by_key("sales", Layer::Bronze, "orders")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn finish_is_first_writer_wins() {
        let store = MemoryRunStore::default();
        let run = store
            .create(NewRun {
                pipeline_id: Uuid::new_v4(),
                trigger: "manual".into(),
                s3_credentials: None,
            })
            .await
            .unwrap();
        store.mark_running(run.id).await.unwrap();

        let first = store
            .finish(
                run.id,
                TerminalUpdate {
                    status: RunStatus::Cancelled,
                    error: None,
                    duration_ms: None,
                    rows_written: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.unwrap().status, RunStatus::Cancelled);

        let second = store
            .finish(
                run.id,
                TerminalUpdate {
                    status: RunStatus::Success,
                    error: None,
                    duration_ms: Some(5_000),
                    rows_written: Some(100),
                },
            )
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(
            store.get(run.id).await.unwrap().unwrap().status,
            RunStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn finish_clamps_oversized_duration() {
        let store = MemoryRunStore::default();
        let run = store
            .create(NewRun {
                pipeline_id: Uuid::new_v4(),
                trigger: "manual".into(),
                s3_credentials: None,
            })
            .await
            .unwrap();
        store.mark_running(run.id).await.unwrap();
        let finished = store
            .finish(
                run.id,
                TerminalUpdate {
                    status: RunStatus::Success,
                    error: None,
                    duration_ms: Some(i64::MAX),
                    rows_written: None,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.duration_ms, Some(i32::MAX as i64));
    }

    #[tokio::test]
    async fn delete_terminal_beyond_keeps_most_recent() {
        let store = MemoryRunStore::default();
        let pipeline_id = Uuid::new_v4();
        for _ in 0..5 {
            let run = store
                .create(NewRun {
                    pipeline_id,
                    trigger: "manual".into(),
                    s3_credentials: None,
                })
                .await
                .unwrap();
            store.mark_running(run.id).await.unwrap();
            store
                .finish(
                    run.id,
                    TerminalUpdate {
                        status: RunStatus::Success,
                        error: None,
                        duration_ms: None,
                        rows_written: None,
                    },
                )
                .await
                .unwrap();
        }
        let deleted = store.delete_terminal_beyond(pipeline_id, 2).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(
            store.count(RunFilter { pipeline_id: Some(pipeline_id), ..Default::default() })
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn bus_delivers_to_subscriber_registered_before_publish() {
        let bus = MemoryEventBus::default();
        let mut sub = bus.subscribe("run_completed").await.unwrap();
        bus.publish("run_completed", serde_json::json!({"run_id": "x"}))
            .await
            .unwrap();
        let event = sub.next().await.unwrap();
        assert_eq!(event["run_id"], "x");
    }

    #[tokio::test]
    async fn bus_drop_cancels_subscription() {
        let bus = MemoryEventBus::default();
        let sub = bus.subscribe("run_completed").await.unwrap();
        drop(sub);
        bus.publish("run_completed", serde_json::json!({})).await.unwrap();
        let subs = bus.subscribers.lock().unwrap();
        assert!(subs.get("run_completed").unwrap().is_empty());
    }

    #[tokio::test]
    async fn version_history_prunes_to_keep() {
        let store = MemoryVersionStore::default();
        let pipeline_id = Uuid::new_v4();
        for _ in 0..5 {
            store
                .record(pipeline_id, HashMap::new(), None, 3)
                .await
                .unwrap();
        }
        let versions = store.list(pipeline_id, Page::default()).await.unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[0].version_number, 5);
    }
}
