//! Round-robin dispatcher over the worker fleet.
//!
//! Wraps N per-worker clients behind the same `Executor` capability. Submit
//! starts at an atomic cursor and walks clockwise; a busy worker falls over
//! to the next, any other error short-circuits. Only when every worker
//! reports capacity exhaustion does the caller see `RunnerBusy`, and the
//! run row stays pending for a later retry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use smelter_core::ports::{Executor, QueryResult, Result};
use smelter_core::types::{LogEntry, Pipeline, Run};
use smelter_core::SmelterError;

use super::client::WorkerClient;

pub struct RoundRobinDispatcher {
    clients: Vec<Arc<WorkerClient>>,
    cursor: AtomicUsize,
}

impl RoundRobinDispatcher {
    pub fn new(clients: Vec<Arc<WorkerClient>>) -> Self {
        Self {
            clients,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> &[Arc<WorkerClient>] {
        &self.clients
    }

    /// The client holding an active mapping for the run, if any.
    pub fn owner_of(&self, run_id: Uuid) -> Option<Arc<WorkerClient>> {
        self.clients.iter().find(|c| c.owns(run_id)).cloned()
    }

    fn next_start(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len().max(1)
    }
}

#[async_trait]
impl Executor for RoundRobinDispatcher {
    async fn submit(&self, run: &Run, pipeline: &Pipeline) -> Result<()> {
        if self.clients.is_empty() {
            return Err(SmelterError::Unavailable("no workers configured".into()));
        }
        let start = self.next_start();
        for i in 0..self.clients.len() {
            let client = &self.clients[(start + i) % self.clients.len()];
            match client.submit(run, pipeline).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_runner_busy() => {
                    tracing::debug!(
                        run_id = %run.id,
                        worker = client.base_url(),
                        "worker at capacity, trying next"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SmelterError::RunnerBusy(format!(
            "all {} runners at capacity",
            self.clients.len()
        )))
    }

    async fn cancel(&self, run_id: Uuid) -> Result<bool> {
        // Fan out, first success wins.
        for client in &self.clients {
            if client.owns(run_id) {
                return client.cancel(run_id).await;
            }
        }
        Ok(false)
    }

    async fn get_logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>> {
        for client in &self.clients {
            if client.owns(run_id) {
                return client.get_logs(run_id).await;
            }
        }
        Err(SmelterError::NotFound(format!(
            "no worker holds an active mapping for run {run_id}"
        )))
    }

    async fn preview(&self, pipeline: &Pipeline, sql: &str) -> Result<QueryResult> {
        if self.clients.is_empty() {
            return Err(SmelterError::Unavailable("no workers configured".into()));
        }
        // Stateless call: any worker will do, keep rotating.
        let client = &self.clients[self.next_start()];
        client.preview(pipeline, sql).await
    }

    async fn validate(&self, pipeline: &Pipeline) -> Result<QueryResult> {
        if self.clients.is_empty() {
            return Err(SmelterError::Unavailable("no workers configured".into()));
        }
        let client = &self.clients[self.next_start()];
        client.validate(pipeline).await
    }
}
