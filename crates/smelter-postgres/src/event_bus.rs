//! LISTEN/NOTIFY event bus.
//!
//! One dedicated long-lived listener connection receives notifications and
//! fans them out to bounded per-subscriber buffers; publishing goes through
//! ordinary pool connections via `pg_notify`. Delivery is best-effort: a
//! full subscriber buffer drops the event with a warn, and the store remains
//! the source of truth for recovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};

use smelter_core::events::{
    EventBus, Subscription, CHANNEL_PIPELINE_CREATED, CHANNEL_PIPELINE_UPDATED,
    CHANNEL_RUN_COMPLETED, SUBSCRIBER_BUFFER,
};
use smelter_core::ports::Result;
use smelter_core::SmelterError;

type SubscriberMap = HashMap<String, Vec<mpsc::Sender<serde_json::Value>>>;

pub struct PgEventBus {
    pool: PgPool,
    subscribers: Arc<Mutex<SubscriberMap>>,
}

impl PgEventBus {
    /// Connect the dedicated listener and start the fan-out task. The task
    /// runs until the shutdown signal flips; `PgListener` reconnects
    /// internally after connection loss.
    pub async fn start(
        pool: PgPool,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| SmelterError::Unavailable(format!("connect event listener: {e}")))?;
        listener
            .listen_all([
                CHANNEL_RUN_COMPLETED,
                CHANNEL_PIPELINE_CREATED,
                CHANNEL_PIPELINE_UPDATED,
            ])
            .await
            .map_err(|e| SmelterError::Unavailable(format!("LISTEN failed: {e}")))?;

        let bus = Arc::new(Self {
            pool,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        });

        let subscribers = bus.subscribers.clone();
        let handle = tokio::spawn(async move {
            tracing::info!("event-bus listener started");
            loop {
                tokio::select! {
                    notification = listener.recv() => match notification {
                        Ok(n) => {
                            let payload: serde_json::Value =
                                match serde_json::from_str(n.payload()) {
                                    Ok(v) => v,
                                    Err(e) => {
                                        tracing::warn!(
                                            channel = n.channel(),
                                            error = %e,
                                            "discarding malformed event payload"
                                        );
                                        continue;
                                    }
                                };
                            dispatch(&subscribers, n.channel(), payload);
                        }
                        Err(e) => {
                            // recv() already reconnected and failed again;
                            // back off briefly before retrying.
                            tracing::warn!(error = %e, "event-bus listen error");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("event-bus listener shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Ok((bus, handle))
    }
}

/// Snapshot the subscriber list under the lock, deliver outside it.
fn dispatch(subscribers: &Mutex<SubscriberMap>, channel: &str, payload: serde_json::Value) {
    let senders: Vec<mpsc::Sender<serde_json::Value>> = {
        let subs = subscribers.lock().unwrap();
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
        let mut subs = subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(channel) {
            list.retain(|tx| !tx.is_closed());
        }
    }
}

#[async_trait]
impl EventBus for PgEventBus {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| SmelterError::Internal(anyhow::Error::new(e)))?;
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
