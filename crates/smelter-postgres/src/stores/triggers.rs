//! Trigger store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use smelter_core::ports::{Page, Result, TriggerStore};
use smelter_core::types::*;

use super::internal;

const TRIGGER_COLUMNS: &str = "id, pipeline_id, kind, config, enabled, cooldown_seconds, \
     token_sha256, last_triggered_at, last_run_id, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct TriggerRow {
    id: Uuid,
    pipeline_id: Uuid,
    kind: String,
    config: serde_json::Value,
    enabled: bool,
    cooldown_seconds: i64,
    token_sha256: Option<String>,
    last_triggered_at: Option<DateTime<Utc>>,
    last_run_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TriggerRow {
    fn into_domain(self) -> Trigger {
        Trigger {
            id: self.id,
            pipeline_id: self.pipeline_id,
            kind: TriggerKind::parse(&self.kind).unwrap_or(TriggerKind::Webhook),
            config: self.config,
            enabled: self.enabled,
            cooldown_seconds: self.cooldown_seconds,
            token_sha256: self.token_sha256,
            last_triggered_at: self.last_triggered_at,
            last_run_id: self.last_run_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub struct PgTriggerStore {
    pool: PgPool,
}

impl PgTriggerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerStore for PgTriggerStore {
    async fn create(&self, new: NewTrigger) -> Result<Trigger> {
        let row = sqlx::query_as::<_, TriggerRow>(&format!(
            "INSERT INTO triggers
                 (id, pipeline_id, kind, config, enabled, cooldown_seconds, token_sha256)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {TRIGGER_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(new.pipeline_id)
        .bind(new.kind.as_str())
        .bind(&new.config)
        .bind(new.enabled)
        .bind(new.cooldown_seconds)
        .bind(&new.token_sha256)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.into_domain())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Trigger>> {
        let row = sqlx::query_as::<_, TriggerRow>(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(TriggerRow::into_domain))
    }

    async fn list(&self, pipeline_id: Option<Uuid>, page: Page) -> Result<Vec<Trigger>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT {TRIGGER_COLUMNS} FROM triggers WHERE 1=1"));
        if let Some(pipeline_id) = pipeline_id {
            qb.push(" AND pipeline_id = ").push_bind(pipeline_id);
        }
        qb.push(" ORDER BY created_at LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);
        let rows: Vec<TriggerRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        Ok(rows.into_iter().map(TriggerRow::into_domain).collect())
    }

    async fn list_enabled(&self, kind: Option<TriggerKind>) -> Result<Vec<Trigger>> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE enabled = true"
        ));
        if let Some(kind) = kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        let rows: Vec<TriggerRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        Ok(rows.into_iter().map(TriggerRow::into_domain).collect())
    }

    async fn find_by_token_hash(&self, token_sha256: &str) -> Result<Option<Trigger>> {
        let row = sqlx::query_as::<_, TriggerRow>(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE token_sha256 = $1"
        ))
        .bind(token_sha256)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(TriggerRow::into_domain))
    }

    async fn update(&self, id: Uuid, patch: TriggerPatch) -> Result<Option<Trigger>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("UPDATE triggers SET updated_at = now()");
        if let Some(config) = &patch.config {
            qb.push(", config = ").push_bind(config.clone());
        }
        if let Some(enabled) = patch.enabled {
            qb.push(", enabled = ").push_bind(enabled);
        }
        if let Some(cooldown) = patch.cooldown_seconds {
            qb.push(", cooldown_seconds = ").push_bind(cooldown);
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(format!(" RETURNING {TRIGGER_COLUMNS}"));

        let row: Option<TriggerRow> = qb
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        Ok(row.map(TriggerRow::into_domain))
    }

    async fn record_fire(&self, id: Uuid, run_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE triggers
             SET last_triggered_at = $2, last_run_id = $3, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM triggers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }
}
