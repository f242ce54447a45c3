//! Shared test fixtures: an in-process mock worker speaking the worker RPC
//! protocol, a recording executor double, and store seeding helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use smelter_core::ports::{Executor, QueryResult, Result, RunStore, Stores};
use smelter_core::types::*;
use smelter_core::SmelterError;

// ============================================================================
// Mock worker
// ============================================================================

#[derive(Clone, Default)]
pub struct WorkerState(pub Arc<WorkerInner>);

#[derive(Default)]
pub struct WorkerInner {
    /// When set, submits answer 429 (capacity exhausted).
    pub busy: AtomicBool,
    /// When set, submits answer 500.
    pub fail_submit: AtomicBool,
    /// Every accepted submission payload, in arrival order.
    pub submissions: Mutex<Vec<serde_json::Value>>,
    /// worker run id → status report payload.
    pub statuses: Mutex<HashMap<String, serde_json::Value>>,
    /// worker run id → NDJSON log body.
    pub logs: Mutex<HashMap<String, String>>,
    counter: AtomicUsize,
}

impl WorkerState {
    pub fn set_busy(&self, busy: bool) {
        self.0.busy.store(busy, Ordering::SeqCst);
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.0.fail_submit.store(fail, Ordering::SeqCst);
    }

    pub fn submission_count(&self) -> usize {
        self.0.submissions.lock().unwrap().len()
    }

    pub fn submitted_run_ids(&self) -> Vec<Uuid> {
        self.0
            .submissions
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s["run_id"].as_str().and_then(|v| Uuid::parse_str(v).ok()))
            .collect()
    }

    /// Worker run id assigned to the most recent submission.
    pub fn last_worker_run_id(&self) -> Option<String> {
        let n = self.0.counter.load(Ordering::SeqCst);
        (n > 0).then(|| format!("w-{n}"))
    }

    pub fn set_status(&self, worker_run_id: &str, report: serde_json::Value) {
        self.0
            .statuses
            .lock()
            .unwrap()
            .insert(worker_run_id.to_string(), report);
    }

    pub fn set_logs(&self, worker_run_id: &str, ndjson: &str) {
        self.0
            .logs
            .lock()
            .unwrap()
            .insert(worker_run_id.to_string(), ndjson.to_string());
    }
}

async fn submit(
    State(state): State<WorkerState>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    if state.0.busy.load(Ordering::SeqCst) {
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({"error": "at capacity"})));
    }
    if state.0.fail_submit.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "exploded"})),
        );
    }
    let n = state.0.counter.fetch_add(1, Ordering::SeqCst) + 1;
    let worker_run_id = format!("w-{n}");
    state.0.submissions.lock().unwrap().push(body);
    state
        .0
        .statuses
        .lock()
        .unwrap()
        .entry(worker_run_id.clone())
        .or_insert(json!({"status": "running"}));
    (StatusCode::OK, Json(json!({"worker_run_id": worker_run_id})))
}

async fn run_status(
    State(state): State<WorkerState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.0.statuses.lock().unwrap().get(&id) {
        Some(report) => (StatusCode::OK, Json(report.clone())),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown run"}))),
    }
}

async fn run_logs(State(state): State<WorkerState>, Path(id): Path<String>) -> String {
    state.0.logs.lock().unwrap().get(&id).cloned().unwrap_or_default()
}

async fn cancel(Path(_id): Path<String>) -> Json<serde_json::Value> {
    Json(json!({"cancelled": true}))
}

pub struct MockWorker {
    pub url: String,
    pub state: WorkerState,
}

/// Bind a mock worker on an ephemeral local port.
pub async fn spawn_worker() -> MockWorker {
    let state = WorkerState::default();
    let app = Router::new()
        .route("/api/v1/runs", post(submit))
        .route("/api/v1/runs/:id/status", get(run_status))
        .route("/api/v1/runs/:id/logs", get(run_logs))
        .route("/api/v1/runs/:id/cancel", post(cancel))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockWorker { url, state }
}

// ============================================================================
// Recording executor double
// ============================================================================

/// Executor double for scheduler/trigger tests: records submissions and
/// mirrors the real client's store transitions.
pub struct FakeExecutor {
    pub runs: Arc<dyn RunStore>,
    pub busy: AtomicBool,
    pub submitted: Mutex<Vec<Uuid>>,
}

impl FakeExecutor {
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self {
            runs,
            busy: AtomicBool::new(false),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn submit(&self, run: &Run, _pipeline: &Pipeline) -> Result<()> {
        if self.busy.load(Ordering::SeqCst) {
            return Err(SmelterError::RunnerBusy("fake worker at capacity".into()));
        }
        self.runs.mark_running(run.id).await?;
        self.submitted.lock().unwrap().push(run.id);
        Ok(())
    }

    async fn cancel(&self, _run_id: Uuid) -> Result<bool> {
        Ok(true)
    }

    async fn get_logs(&self, _run_id: Uuid) -> Result<Vec<LogEntry>> {
        Ok(Vec::new())
    }

    async fn preview(&self, _pipeline: &Pipeline, _sql: &str) -> Result<QueryResult> {
        Ok(QueryResult::default())
    }

    async fn validate(&self, _pipeline: &Pipeline) -> Result<QueryResult> {
        Ok(QueryResult::default())
    }
}

// ============================================================================
// Seeding helpers
// ============================================================================

pub async fn seed_pipeline(stores: &Stores, name: &str) -> Pipeline {
    stores
        .pipelines
        .create(NewPipeline {
            namespace: "sales".into(),
            layer: Layer::Bronze,
            name: name.into(),
            description: None,
            owner: None,
        })
        .await
        .unwrap()
}

pub async fn seed_run(stores: &Stores, pipeline: &Pipeline) -> Run {
    stores
        .runs
        .create(NewRun {
            pipeline_id: pipeline.id,
            trigger: "manual".into(),
            s3_credentials: None,
        })
        .await
        .unwrap()
}
