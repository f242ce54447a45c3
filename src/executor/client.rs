//! Per-worker RPC client.
//!
//! One `WorkerClient` per configured worker address. The client owns the
//! active-run map (local run id → worker run id) for runs it submitted and
//! has not yet seen terminate. The map is a cache, not state: a lost entry
//! is recovered by the reaper's stuck-run transition. Submit owns the store
//! transitions around dispatch; capacity exhaustion (HTTP 429) is a normal
//! outcome surfaced as the `RunnerBusy` sentinel without touching the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use uuid::Uuid;

use smelter_core::ports::{Executor, QueryResult, Result, RunStore};
use smelter_core::types::{LogEntry, Pipeline, Run, RunStatus, TerminalUpdate};
use smelter_core::SmelterError;

use crate::request_id;

use super::types::*;

/// Fallback poll interval for the status reconciler.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Per-RPC timeout. Log streams run unbounded and are capped by callers.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WorkerClient {
    base_url: String,
    http: reqwest::Client,
    runs: Arc<dyn RunStore>,
    /// local run id → worker run id, for unterminated submissions.
    active: Mutex<HashMap<Uuid, String>>,
}

impl WorkerClient {
    /// Connection is lazy; no network call happens until the first RPC.
    pub fn new(base_url: &str, runs: Arc<dyn RunStore>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            runs,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(RPC_TIMEOUT);
        match request_id::current() {
            Some(id) => builder.header(request_id::HEADER, id),
            None => builder,
        }
    }

    /// True when this client submitted the run and it has not terminated.
    pub fn owns(&self, run_id: Uuid) -> bool {
        self.active.lock().unwrap().contains_key(&run_id)
    }

    pub fn active_ids(&self) -> Vec<Uuid> {
        self.active.lock().unwrap().keys().copied().collect()
    }

    pub fn worker_run_id(&self, run_id: Uuid) -> Option<String> {
        self.active.lock().unwrap().get(&run_id).cloned()
    }

    /// Forget a run. The last step of every terminal path.
    pub fn remove_active(&self, run_id: Uuid) -> Option<String> {
        self.active.lock().unwrap().remove(&run_id)
    }

    /// Fetch the worker's view of a run. `Ok(None)` when this client has no
    /// mapping for it.
    pub async fn fetch_status(&self, run_id: Uuid) -> Result<Option<RunStatusReport>> {
        let Some(worker_run_id) = self.worker_run_id(run_id) else {
            return Ok(None);
        };
        let response = self
            .request(self.http.get(self.url(&format!("/api/v1/runs/{worker_run_id}/status"))))
            .send()
            .await
            .map_err(|e| SmelterError::Unavailable(format!("worker {}: {e}", self.base_url)))?;
        if !response.status().is_success() {
            return Err(SmelterError::Unavailable(format!(
                "worker {} status query returned {}",
                self.base_url,
                response.status()
            )));
        }
        let report: RunStatusReport = response
            .json()
            .await
            .map_err(|e| SmelterError::Internal(anyhow::anyhow!("malformed status report: {e}")))?;
        Ok(Some(report))
    }

    /// Collect the full (non-follow) log stream for a run.
    pub async fn fetch_logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>> {
        let Some(worker_run_id) = self.worker_run_id(run_id) else {
            return Ok(Vec::new());
        };
        self.fetch_logs_by_worker_id(&worker_run_id).await
    }

    async fn fetch_logs_by_worker_id(&self, worker_run_id: &str) -> Result<Vec<LogEntry>> {
        let response = self.open_log_stream(worker_run_id, false).await?;

        // NDJSON: one log entry per line.
        let mut entries = Vec::new();
        let mut buffer = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| SmelterError::Unavailable(format!("log stream aborted: {e}")))?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(entry) = parse_log_line(&line) {
                    entries.push(entry);
                }
            }
        }
        if let Some(entry) = parse_log_line(&buffer) {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Incremental log stream (optionally following) for live tailing.
    pub async fn log_stream(
        &self,
        run_id: Uuid,
        follow: bool,
    ) -> Result<impl futures::Stream<Item = LogEntry> + Send> {
        let Some(worker_run_id) = self.worker_run_id(run_id) else {
            return Err(SmelterError::NotFound(format!(
                "no active mapping for run {run_id}"
            )));
        };
        let response = self.open_log_stream(&worker_run_id, follow).await?;
        let bytes = response.bytes_stream();
        Ok(futures::stream::unfold(
            (bytes, Vec::<u8>::new(), false),
            |(mut stream, mut buffer, mut done)| async move {
                loop {
                    if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        if let Some(entry) = parse_log_line(&line) {
                            return Some((entry, (stream, buffer, done)));
                        }
                        continue;
                    }
                    if done {
                        let rest = std::mem::take(&mut buffer);
                        return parse_log_line(&rest).map(|entry| (entry, (stream, buffer, done)));
                    }
                    match stream.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "log stream interrupted");
                            done = true;
                        }
                        None => done = true,
                    }
                }
            },
        ))
    }

    async fn open_log_stream(&self, worker_run_id: &str, follow: bool) -> Result<reqwest::Response> {
        // No per-RPC timeout here: a follow stream is long-lived by design
        // and callers cap its duration.
        let mut builder = self
            .http
            .get(self.url(&format!("/api/v1/runs/{worker_run_id}/logs")))
            .query(&[("follow", if follow { "true" } else { "false" })]);
        if let Some(id) = request_id::current() {
            builder = builder.header(request_id::HEADER, id);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| SmelterError::Unavailable(format!("worker {}: {e}", self.base_url)))?;
        if !response.status().is_success() {
            return Err(SmelterError::Unavailable(format!(
                "worker {} log stream returned {}",
                self.base_url,
                response.status()
            )));
        }
        Ok(response)
    }
}

fn parse_log_line(line: &[u8]) -> Option<LogEntry> {
    let trimmed = std::str::from_utf8(line).unwrap_or("").trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<LogEntry>(trimmed) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed log line");
            None
        }
    }
}

#[async_trait]
impl Executor for WorkerClient {
    async fn submit(&self, run: &Run, pipeline: &Pipeline) -> Result<()> {
        let request = SubmitRequest {
            run_id: run.id,
            namespace: pipeline.namespace.clone(),
            layer: pipeline.layer.as_str().to_string(),
            pipeline_name: pipeline.name.clone(),
            trigger: run.trigger.clone(),
            published_versions: pipeline.published_versions.clone(),
            s3_credentials: run.s3_credentials.clone(),
        };

        let response = self
            .request(self.http.post(self.url("/api/v1/runs")).json(&request))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                // Worker unreachable: the run fails and the caller sees why.
                let message = format!("worker {} unreachable: {e}", self.base_url);
                self.fail_run(run.id, &message).await;
                return Err(SmelterError::Unavailable(message));
            }
        };

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            // Capacity exhaustion is not a failure; the run stays pending.
            return Err(SmelterError::RunnerBusy(format!(
                "worker {} at capacity",
                self.base_url
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = format!("worker {} rejected submit ({status}): {body}", self.base_url);
            self.fail_run(run.id, &message).await;
            return Err(SmelterError::Internal(anyhow::anyhow!(message)));
        }

        let accepted: SubmitResponse = response.json().await.map_err(|e| {
            SmelterError::Internal(anyhow::anyhow!("malformed submit response: {e}"))
        })?;

        self.runs.mark_running(run.id).await?;
        self.active
            .lock()
            .unwrap()
            .insert(run.id, accepted.worker_run_id);
        tracing::info!(
            run_id = %run.id,
            worker = %self.base_url,
            pipeline = %pipeline.key(),
            "run submitted"
        );
        Ok(())
    }

    async fn cancel(&self, run_id: Uuid) -> Result<bool> {
        let Some(worker_run_id) = self.worker_run_id(run_id) else {
            return Ok(false);
        };
        let response = self
            .request(
                self.http
                    .post(self.url(&format!("/api/v1/runs/{worker_run_id}/cancel"))),
            )
            .send()
            .await
            .map_err(|e| SmelterError::Unavailable(format!("worker {}: {e}", self.base_url)))?;
        if !response.status().is_success() {
            return Err(SmelterError::Unavailable(format!(
                "worker {} cancel returned {}",
                self.base_url,
                response.status()
            )));
        }
        let result: CancelResponse = response.json().await.map_err(|e| {
            SmelterError::Internal(anyhow::anyhow!("malformed cancel response: {e}"))
        })?;
        self.remove_active(run_id);
        Ok(result.cancelled)
    }

    async fn get_logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>> {
        self.fetch_logs(run_id).await
    }

    async fn preview(&self, pipeline: &Pipeline, sql: &str) -> Result<QueryResult> {
        self.query_endpoint("/api/v1/preview", pipeline, Some(sql)).await
    }

    async fn validate(&self, pipeline: &Pipeline) -> Result<QueryResult> {
        self.query_endpoint("/api/v1/validate", pipeline, None).await
    }
}

impl WorkerClient {
    async fn query_endpoint(
        &self,
        path: &str,
        pipeline: &Pipeline,
        sql: Option<&str>,
    ) -> Result<QueryResult> {
        let request = PreviewRequest {
            namespace: pipeline.namespace.clone(),
            layer: pipeline.layer.as_str().to_string(),
            pipeline_name: pipeline.name.clone(),
            published_versions: pipeline.published_versions.clone(),
            sql: sql.map(String::from),
        };
        let response = self
            .request(self.http.post(self.url(path)).json(&request))
            .send()
            .await
            .map_err(|e| SmelterError::Unavailable(format!("worker {}: {e}", self.base_url)))?;
        if !response.status().is_success() {
            return Err(SmelterError::Unavailable(format!(
                "worker {} returned {} for {path}",
                self.base_url,
                response.status()
            )));
        }
        let raw: RawQueryResult = response.json().await.map_err(|e| {
            SmelterError::Internal(anyhow::anyhow!("malformed query result: {e}"))
        })?;
        decode_query_result(raw)
    }

    async fn fail_run(&self, run_id: Uuid, error: &str) {
        let update = TerminalUpdate {
            status: RunStatus::Failed,
            error: Some(error.to_string()),
            duration_ms: None,
            rows_written: None,
        };
        if let Err(e) = self.runs.finish(run_id, update).await {
            tracing::error!(run_id = %run_id, error = %e, "failed to record dispatch failure");
        }
    }
}
