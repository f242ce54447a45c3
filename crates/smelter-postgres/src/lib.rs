//! Smelter PostgreSQL adapter — implements every `smelter-core` port with
//! sqlx runtime queries, plus the LISTEN/NOTIFY event bus, advisory-lock
//! leader election, and embedded schema migration.

pub mod event_bus;
pub mod locks;
pub mod migrate;
pub mod stores;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use smelter_core::ports::{Result, Stores};
use smelter_core::SmelterError;

pub use event_bus::PgEventBus;
pub use locks::PgLeaderGate;
pub use migrate::run_migrations;

/// Default connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 25;

/// Open a bounded pool against the given database URL.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(std::time::Duration::from_secs(600))
        .max_lifetime(std::time::Duration::from_secs(1800))
        .connect(database_url)
        .await
        .map_err(|e| SmelterError::Unavailable(format!("database connect: {e}")))
}

/// Wire every store port over one shared pool.
pub fn postgres_stores(pool: PgPool) -> Stores {
    Stores {
        pipelines: Arc::new(stores::pipelines::PgPipelineStore::new(pool.clone())),
        runs: Arc::new(stores::runs::PgRunStore::new(pool.clone())),
        schedules: Arc::new(stores::schedules::PgScheduleStore::new(pool.clone())),
        triggers: Arc::new(stores::triggers::PgTriggerStore::new(pool.clone())),
        landing: Arc::new(stores::landing::PgLandingStore::new(pool.clone())),
        logs: Arc::new(stores::runs::PgLogStore::new(pool.clone())),
        audit: Arc::new(stores::admin::PgAuditStore::new(pool.clone())),
        versions: Arc::new(stores::pipelines::PgVersionStore::new(pool.clone())),
        quality: Arc::new(stores::admin::PgQualityStore::new(pool.clone())),
        retention: Arc::new(stores::admin::PgRetentionStore::new(pool.clone())),
        flags: Arc::new(stores::admin::PgFeatureFlagStore::new(pool)),
    }
}
