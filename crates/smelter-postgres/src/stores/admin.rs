//! Audit, retention/reaper-status, quality, and feature-flag stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use smelter_core::ports::{
    AuditStore, FeatureFlagStore, Page, QualityStore, Result, RetentionStore,
};
use smelter_core::types::*;

use super::internal;

// ============================================================================
// Audit
// ============================================================================

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    actor: String,
    action: String,
    entity_kind: String,
    entity_id: Option<Uuid>,
    detail: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl AuditRow {
    fn into_domain(self) -> AuditEntry {
        AuditEntry {
            id: self.id,
            actor: self.actor,
            action: self.action,
            entity_kind: self.entity_kind,
            entity_id: self.entity_id,
            detail: self.detail,
            created_at: self.created_at,
        }
    }
}

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let row = sqlx::query_as::<_, AuditRow>(
            "INSERT INTO audit_log (id, actor, action, entity_kind, entity_id, detail)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, actor, action, entity_kind, entity_id, detail, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.entity_kind)
        .bind(entry.entity_id)
        .bind(&entry.detail)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.into_domain())
    }

    async fn list(&self, entity_kind: Option<String>, page: Page) -> Result<Vec<AuditEntry>> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "SELECT id, actor, action, entity_kind, entity_id, detail, created_at
             FROM audit_log WHERE 1=1",
        );
        if let Some(kind) = &entity_kind {
            qb.push(" AND entity_kind = ").push_bind(kind.clone());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);
        let rows: Vec<AuditRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        Ok(rows.into_iter().map(AuditRow::into_domain).collect())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Retention & reaper status
// ============================================================================

pub struct PgRetentionStore {
    pool: PgPool,
}

impl PgRetentionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetentionStore for PgRetentionStore {
    async fn system(&self) -> Result<RetentionConfig> {
        let blob: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT config FROM retention_config WHERE id = true")
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
        Ok(blob
            .and_then(|b| serde_json::from_value(b).ok())
            .unwrap_or_default())
    }

    async fn update_system(&self, patch: RetentionPatch) -> Result<RetentionConfig> {
        let mut config = self.system().await?;
        config.apply(&patch);
        let blob = serde_json::to_value(&config).unwrap_or_default();
        sqlx::query(
            "INSERT INTO retention_config (id, config) VALUES (true, $1)
             ON CONFLICT (id) DO UPDATE SET config = EXCLUDED.config",
        )
        .bind(blob)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(config)
    }

    async fn merged(&self, pipeline_id: Uuid) -> Result<RetentionConfig> {
        let system = self.system().await?;
        let override_blob: Option<Option<serde_json::Value>> =
            sqlx::query_scalar("SELECT retention_override FROM pipelines WHERE id = $1")
                .bind(pipeline_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
        Ok(match override_blob.flatten() {
            Some(blob) => system.merged_with(&blob),
            None => system,
        })
    }

    async fn reaper_status(&self) -> Result<ReaperStatus> {
        let blob: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT status FROM reaper_status WHERE id = true")
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
        Ok(blob
            .and_then(|b| serde_json::from_value(b).ok())
            .unwrap_or_default())
    }

    async fn update_reaper_status(&self, status: ReaperStatus) -> Result<()> {
        let blob = serde_json::to_value(&status).unwrap_or_default();
        sqlx::query(
            "INSERT INTO reaper_status (id, status) VALUES (true, $1)
             ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status",
        )
        .bind(blob)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }
}

// ============================================================================
// Quality tests
// ============================================================================

#[derive(sqlx::FromRow)]
struct QualityTestRow {
    id: Uuid,
    pipeline_id: Uuid,
    name: String,
    config: serde_json::Value,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct QualityResultRow {
    id: Uuid,
    test_id: Uuid,
    run_id: Option<Uuid>,
    passed: bool,
    detail: serde_json::Value,
    created_at: DateTime<Utc>,
}

pub struct PgQualityStore {
    pool: PgPool,
}

impl PgQualityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QualityStore for PgQualityStore {
    async fn create_test(
        &self,
        pipeline_id: Uuid,
        name: &str,
        config: serde_json::Value,
    ) -> Result<QualityTest> {
        let row = sqlx::query_as::<_, QualityTestRow>(
            "INSERT INTO quality_tests (id, pipeline_id, name, config)
             VALUES ($1, $2, $3, $4)
             RETURNING id, pipeline_id, name, config, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(pipeline_id)
        .bind(name)
        .bind(&config)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Ok(QualityTest {
            id: row.id,
            pipeline_id: row.pipeline_id,
            name: row.name,
            config: row.config,
            created_at: row.created_at,
        })
    }

    async fn list_tests(&self, pipeline_id: Uuid, page: Page) -> Result<Vec<QualityTest>> {
        let rows = sqlx::query_as::<_, QualityTestRow>(
            "SELECT id, pipeline_id, name, config, created_at
             FROM quality_tests WHERE pipeline_id = $1
             ORDER BY created_at LIMIT $2 OFFSET $3",
        )
        .bind(pipeline_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows
            .into_iter()
            .map(|r| QualityTest {
                id: r.id,
                pipeline_id: r.pipeline_id,
                name: r.name,
                config: r.config,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn record_result(
        &self,
        test_id: Uuid,
        run_id: Option<Uuid>,
        passed: bool,
        detail: serde_json::Value,
    ) -> Result<QualityResult> {
        let row = sqlx::query_as::<_, QualityResultRow>(
            "INSERT INTO quality_results (id, test_id, run_id, passed, detail)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, test_id, run_id, passed, detail, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(test_id)
        .bind(run_id)
        .bind(passed)
        .bind(&detail)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Ok(QualityResult {
            id: row.id,
            test_id: row.test_id,
            run_id: row.run_id,
            passed: row.passed,
            detail: row.detail,
            created_at: row.created_at,
        })
    }

    async fn prune_results(&self, keep: i64) -> Result<u64> {
        // Rank per test by recency and drop everything past the keep window.
        let result = sqlx::query(
            "DELETE FROM quality_results
             WHERE id IN (
                 SELECT id FROM (
                     SELECT id,
                            ROW_NUMBER() OVER (
                                PARTITION BY test_id ORDER BY created_at DESC
                            ) AS rank
                     FROM quality_results
                 ) ranked
                 WHERE ranked.rank > $1
             )",
        )
        .bind(keep.max(0))
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Feature flags
// ============================================================================

pub struct PgFeatureFlagStore {
    pool: PgPool,
}

impl PgFeatureFlagStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeatureFlagStore for PgFeatureFlagStore {
    async fn all(&self) -> Result<serde_json::Value> {
        let rows: Vec<(String, serde_json::Value)> =
            sqlx::query_as("SELECT name, value FROM feature_flags")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
        Ok(serde_json::Value::Object(rows.into_iter().collect()))
    }

    async fn get(&self, name: &str) -> Result<Option<serde_json::Value>> {
        sqlx::query_scalar("SELECT value FROM feature_flags WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)
    }

    async fn set(&self, name: &str, value: serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO feature_flags (name, value) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(name)
        .bind(&value)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }
}
