//! Advisory-lock leader election.
//!
//! Single-instance components (scheduler, reaper, trigger evaluator) acquire
//! a session-level advisory lock keyed by component name. The connection
//! holding the lock is dedicated: it is pulled from the pool and parked for
//! the lease lifetime, so connection loss auto-releases the lock and another
//! replica can take over.
//!
//! ## Lock Key Derivation
//!
//! Keys are derived from the component name with deterministic hashing:
//! the same component always maps to the same key, and keys are stable
//! across restarts and replicas.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;

use smelter_core::ports::{LeaderGate, Result};
use smelter_core::SmelterError;

/// Derive a stable i64 advisory-lock key from a component name.
pub fn lock_key(component: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    "smelter".hash(&mut hasher);
    component.hash(&mut hasher);
    hasher.finish() as i64
}

/// Session-level advisory lock gate over a shared pool.
pub struct PgLeaderGate {
    pool: PgPool,
    /// component → parked connection holding its lock.
    held: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl PgLeaderGate {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LeaderGate for PgLeaderGate {
    async fn try_lead(&self, component: &str) -> Result<bool> {
        let mut held = self.held.lock().await;

        // Already holding: confirm the connection is still alive. A dead
        // connection means Postgres released the lock on its side.
        if let Some(conn) = held.get_mut(component) {
            match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&mut **conn).await {
                Ok(_) => return Ok(true),
                Err(e) => {
                    tracing::warn!(
                        component,
                        error = %e,
                        "leader connection lost, lease released"
                    );
                    held.remove(component);
                }
            }
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| SmelterError::Unavailable(format!("acquire leader connection: {e}")))?;

        let key = lock_key(component);
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| SmelterError::Internal(anyhow::Error::new(e)))?;

        if acquired {
            tracing::info!(component, key, "acquired leader lock");
            held.insert(component.to_string(), conn);
        }
        Ok(acquired)
    }

    async fn release(&self, component: &str) -> Result<()> {
        let mut held = self.held.lock().await;
        if let Some(mut conn) = held.remove(component) {
            let key = lock_key(component);
            if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(key)
                .execute(&mut *conn)
                .await
            {
                // Dropping the connection releases the lock anyway.
                tracing::warn!(component, error = %e, "advisory unlock failed");
            }
            tracing::info!(component, "released leader lock");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_deterministic() {
        assert_eq!(lock_key("scheduler"), lock_key("scheduler"));
    }

    #[test]
    fn lock_key_differs_per_component() {
        assert_ne!(lock_key("scheduler"), lock_key("reaper"));
        assert_ne!(lock_key("reaper"), lock_key("trigger-evaluator"));
    }
}
