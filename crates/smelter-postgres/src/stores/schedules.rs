//! Schedule store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use smelter_core::ports::{Page, Result, ScheduleStore};
use smelter_core::types::*;

use super::internal;

const SCHEDULE_COLUMNS: &str = "id, pipeline_id, cron_expr, enabled, last_run_id, \
     last_run_at, next_run_at, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    pipeline_id: Uuid,
    cron_expr: String,
    enabled: bool,
    last_run_id: Option<Uuid>,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ScheduleRow {
    fn into_domain(self) -> Schedule {
        Schedule {
            id: self.id,
            pipeline_id: self.pipeline_id,
            cron_expr: self.cron_expr,
            enabled: self.enabled,
            last_run_id: self.last_run_id,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn create(&self, new: NewSchedule) -> Result<Schedule> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "INSERT INTO schedules (id, pipeline_id, cron_expr, enabled)
             VALUES ($1, $2, $3, $4)
             RETURNING {SCHEDULE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(new.pipeline_id)
        .bind(&new.cron_expr)
        .bind(new.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.into_domain())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(ScheduleRow::into_domain))
    }

    async fn list(&self, pipeline_id: Option<Uuid>, page: Page) -> Result<Vec<Schedule>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE 1=1"));
        if let Some(pipeline_id) = pipeline_id {
            qb.push(" AND pipeline_id = ").push_bind(pipeline_id);
        }
        qb.push(" ORDER BY created_at LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);
        let rows: Vec<ScheduleRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        Ok(rows.into_iter().map(ScheduleRow::into_domain).collect())
    }

    async fn list_all(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows.into_iter().map(ScheduleRow::into_domain).collect())
    }

    async fn update(&self, id: Uuid, patch: SchedulePatch) -> Result<Option<Schedule>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("UPDATE schedules SET updated_at = now()");
        if let Some(expr) = &patch.cron_expr {
            qb.push(", cron_expr = ").push_bind(expr.clone());
            // A changed expression invalidates the computed fire time.
            qb.push(", next_run_at = NULL");
        }
        if let Some(enabled) = patch.enabled {
            qb.push(", enabled = ").push_bind(enabled);
        }
        if let Some(next) = &patch.next_run_at {
            qb.push(", next_run_at = ").push_bind(*next);
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(format!(" RETURNING {SCHEDULE_COLUMNS}"));

        let row: Option<ScheduleRow> = qb
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        Ok(row.map(ScheduleRow::into_domain))
    }

    async fn set_next_run_at(&self, id: Uuid, next: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE schedules SET next_run_at = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(next)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn record_fire(
        &self,
        id: Uuid,
        run_id: Uuid,
        fired_at: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE schedules
             SET last_run_id = $2, last_run_at = $3, next_run_at = $4, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(run_id)
        .bind(fired_at)
        .bind(next)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }
}
