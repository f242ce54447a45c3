//! Run and run-log stores.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use smelter_core::ports::{LogStore, Page, Result, RunStore};
use smelter_core::types::*;
use smelter_core::SmelterError;

use super::internal;

const RUN_COLUMNS: &str = "id, pipeline_id, status, \"trigger\", error, started_at, \
     finished_at, duration_ms, rows_written, created_at";

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    pipeline_id: Uuid,
    status: String,
    trigger: String,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    rows_written: Option<i64>,
    created_at: DateTime<Utc>,
}

impl RunRow {
    fn into_domain(self) -> Run {
        Run {
            id: self.id,
            pipeline_id: self.pipeline_id,
            status: RunStatus::parse(&self.status).unwrap_or(RunStatus::Pending),
            trigger: self.trigger,
            error: self.error,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            rows_written: self.rows_written,
            created_at: self.created_at,
            s3_credentials: None,
        }
    }
}

pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn apply_filter(qb: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &RunFilter) {
        if let Some(pipeline_id) = filter.pipeline_id {
            qb.push(" AND pipeline_id = ").push_bind(pipeline_id);
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(prefix) = &filter.trigger_prefix {
            qb.push(" AND \"trigger\" LIKE ")
                .push_bind(format!("{prefix}%"));
        }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create(&self, new: NewRun) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "INSERT INTO runs (id, pipeline_id, status, \"trigger\")
             VALUES ($1, $2, 'pending', $3)
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(new.pipeline_id)
        .bind(&new.trigger)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        let mut run = row.into_domain();
        // Credential overrides ride along in memory only.
        run.s3_credentials = new.s3_credentials;
        Ok(run)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>> {
        let row =
            sqlx::query_as::<_, RunRow>(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
        Ok(row.map(RunRow::into_domain))
    }

    async fn list(&self, filter: RunFilter, page: Page) -> Result<Vec<Run>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1=1"));
        Self::apply_filter(&mut qb, &filter);
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);

        let rows: Vec<RunRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        Ok(rows.into_iter().map(RunRow::into_domain).collect())
    }

    async fn count(&self, filter: RunFilter) -> Result<i64> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM runs WHERE 1=1");
        Self::apply_filter(&mut qb, &filter);
        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(internal)?;
        Ok(count)
    }

    async fn mark_running(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET status = 'running', started_at = now()
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn finish(&self, id: Uuid, update: TerminalUpdate) -> Result<Option<Run>> {
        if !update.status.is_terminal() {
            return Err(SmelterError::InvalidArgument(format!(
                "finish requires a terminal status, got {}",
                update.status
            )));
        }
        // Guarded by the status predicate: only one terminal transition can
        // ever apply (first writer wins). Duration clamps into i32 range;
        // when the worker reported none it is computed from started_at.
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE runs
             SET status = $2,
                 error = $3,
                 finished_at = now(),
                 rows_written = $5,
                 duration_ms = CASE
                     WHEN $4::BIGINT IS NULL AND started_at IS NULL THEN NULL
                     ELSE LEAST(GREATEST(COALESCE(
                              $4::BIGINT,
                              (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::BIGINT
                          ), 0), 2147483647)
                 END
             WHERE id = $1 AND status IN ('pending', 'running')
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(id)
        .bind(update.status.as_str())
        .bind(&update.error)
        .bind(update.duration_ms)
        .bind(update.rows_written)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(RunRow::into_domain))
    }

    async fn latest_terminal_for_pipelines(
        &self,
        pipeline_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT DISTINCT ON (pipeline_id) {RUN_COLUMNS}
             FROM runs
             WHERE pipeline_id = ANY($1)
               AND status IN ('success', 'failed', 'cancelled')
             ORDER BY pipeline_id, finished_at DESC NULLS LAST"
        ))
        .bind(pipeline_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.pipeline_id, r.into_domain()))
            .collect())
    }

    async fn list_stuck(&self, older_than: DateTime<Utc>) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE status IN ('pending', 'running') AND created_at < $1"
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows.into_iter().map(RunRow::into_domain).collect())
    }

    async fn fail_stuck(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE runs
             SET status = 'failed', error = 'stuck', finished_at = now()
             WHERE status IN ('pending', 'running') AND created_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected())
    }

    async fn delete_terminal_beyond(&self, pipeline_id: Uuid, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM runs
             WHERE id IN (
                 SELECT id FROM runs
                 WHERE pipeline_id = $1
                   AND status IN ('success', 'failed', 'cancelled')
                 ORDER BY created_at DESC
                 OFFSET $2
             )",
        )
        .bind(pipeline_id)
        .bind(keep.max(0))
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected())
    }

    async fn delete_terminal_before(
        &self,
        pipeline_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM runs
             WHERE pipeline_id = $1
               AND status IN ('success', 'failed', 'cancelled')
               AND finished_at < $2",
        )
        .bind(pipeline_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Logs
// ============================================================================

#[derive(sqlx::FromRow)]
struct LogRow {
    ts: DateTime<Utc>,
    level: String,
    message: String,
}

pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn persist(&self, run_id: Uuid, entries: &[LogEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("INSERT INTO run_logs (run_id, ts, level, message) ");
        qb.push_values(entries, |mut b, entry| {
            b.push_bind(run_id)
                .push_bind(entry.timestamp)
                .push_bind(&entry.level)
                .push_bind(&entry.message);
        });
        let result = qb.build().execute(&self.pool).await.map_err(internal)?;
        Ok(result.rows_affected())
    }

    async fn list(&self, run_id: Uuid, page: Page) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT ts, level, message FROM run_logs
             WHERE run_id = $1
             ORDER BY id
             LIMIT $2 OFFSET $3",
        )
        .bind(run_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows
            .into_iter()
            .map(|r| LogEntry {
                timestamp: r.ts,
                level: r.level,
                message: r.message,
            })
            .collect())
    }

    async fn delete_for_runs_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM run_logs
             USING runs
             WHERE run_logs.run_id = runs.id AND runs.finished_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected())
    }
}
