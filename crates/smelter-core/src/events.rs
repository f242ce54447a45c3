//! Event bus contract: lightweight pub/sub over the durable store.
//!
//! Delivery is best-effort with bounded per-subscriber buffers; the store
//! stays the source of truth, so a dropped event is always recoverable by
//! re-querying. Payloads are JSON-encoded structs with stable field names.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ports::Result;
use crate::types::{Layer, RunStatus};

/// Published when a run reaches a terminal state.
pub const CHANNEL_RUN_COMPLETED: &str = "run_completed";
/// Published when a pipeline row is created.
pub const CHANNEL_PIPELINE_CREATED: &str = "pipeline_created";
/// Published when a pipeline row is updated.
pub const CHANNEL_PIPELINE_UPDATED: &str = "pipeline_updated";

/// Per-subscriber buffer size; events beyond this are dropped with a warn.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedEvent {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineChangedEvent {
    pub pipeline_id: Uuid,
    pub namespace: String,
    pub layer: Layer,
    pub name: String,
}

/// A live subscription. Events arrive FIFO; dropping the subscription
/// cancels it and closes the channel.
pub struct Subscription {
    pub receiver: mpsc::Receiver<serde_json::Value>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<serde_json::Value> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a JSON payload on a channel. Failures are the caller's to
    /// log; the store row change this event describes is already committed.
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_completed_payload_field_names_are_stable() {
        let event = RunCompletedEvent {
            run_id: Uuid::nil(),
            pipeline_id: Uuid::nil(),
            status: RunStatus::Success,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("run_id").is_some());
        assert!(json.get("pipeline_id").is_some());
        assert_eq!(json["status"], "success");
    }
}
