//! Shared state for every route group.

use std::sync::Arc;

use smelter_core::events::EventBus;
use smelter_core::ports::{Executor, Stores};
use smelter_core::types::NewAuditEntry;
use uuid::Uuid;

use crate::config::Config;
use crate::executor::Reconciler;
use crate::triggers::TriggerEvaluator;

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    /// Absent when no workers are configured; dispatch-dependent routes
    /// answer `UNAVAILABLE`.
    pub executor: Option<Arc<dyn Executor>>,
    pub reconciler: Arc<Reconciler>,
    pub evaluator: Arc<TriggerEvaluator>,
    pub bus: Arc<dyn EventBus>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Best-effort audit append; failures never fail the user operation.
    pub fn audit(&self, action: &str, entity_kind: &str, entity_id: Option<Uuid>, detail: serde_json::Value) {
        let audit = self.stores.audit.clone();
        let entry = NewAuditEntry {
            actor: "api".to_string(),
            action: action.to_string(),
            entity_kind: entity_kind.to_string(),
            entity_id,
            detail,
        };
        tokio::spawn(async move {
            if let Err(e) = audit.append(entry).await {
                tracing::warn!(error = %e, "audit append failed");
            }
        });
    }
}
