//! Pipeline and pipeline-version stores.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use smelter_core::ports::{Page, PipelineStore, Result, VersionStore};
use smelter_core::types::*;
use smelter_core::SmelterError;

use super::{internal, is_unique_violation};

const PIPELINE_COLUMNS: &str = "id, namespace, layer, name, description, owner, \
     published_versions, draft_dirty, retention_override, deleted_at, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    namespace: String,
    layer: String,
    name: String,
    description: Option<String>,
    owner: Option<String>,
    published_versions: serde_json::Value,
    draft_dirty: bool,
    retention_override: Option<serde_json::Value>,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PipelineRow {
    fn into_domain(self) -> Pipeline {
        Pipeline {
            id: self.id,
            namespace: self.namespace,
            layer: Layer::parse(&self.layer).unwrap_or(Layer::Bronze),
            name: self.name,
            description: self.description,
            owner: self.owner,
            published_versions: serde_json::from_value(self.published_versions)
                .unwrap_or_default(),
            draft_dirty: self.draft_dirty,
            retention_override: self.retention_override,
            deleted_at: self.deleted_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn create(&self, new: NewPipeline) -> Result<Pipeline> {
        let id = Uuid::new_v4();
        let row = sqlx::query_as::<_, PipelineRow>(&format!(
            "INSERT INTO pipelines (id, namespace, layer, name, description, owner)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {PIPELINE_COLUMNS}"
        ))
        .bind(id)
        .bind(&new.namespace)
        .bind(new.layer.as_str())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.owner)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                SmelterError::AlreadyExists(format!(
                    "pipeline {}/{}/{}",
                    new.namespace, new.layer, new.name
                ))
            } else {
                internal(e)
            }
        })?;
        Ok(row.into_domain())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Pipeline>> {
        let row = sqlx::query_as::<_, PipelineRow>(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(PipelineRow::into_domain))
    }

    async fn get_by_key(
        &self,
        namespace: &str,
        layer: Layer,
        name: &str,
    ) -> Result<Option<Pipeline>> {
        let row = sqlx::query_as::<_, PipelineRow>(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines
             WHERE namespace = $1 AND layer = $2 AND name = $3 AND deleted_at IS NULL"
        ))
        .bind(namespace)
        .bind(layer.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(PipelineRow::into_domain))
    }

    async fn list(&self, filter: PipelineFilter, page: Page) -> Result<Vec<Pipeline>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE 1=1"));
        if !filter.include_deleted {
            qb.push(" AND deleted_at IS NULL");
        }
        if let Some(ns) = &filter.namespace {
            qb.push(" AND namespace = ").push_bind(ns.clone());
        }
        if let Some(layer) = filter.layer {
            qb.push(" AND layer = ").push_bind(layer.as_str());
        }
        if let Some(q) = &filter.name_contains {
            qb.push(" AND name LIKE ").push_bind(format!("%{q}%"));
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);

        let rows: Vec<PipelineRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        Ok(rows.into_iter().map(PipelineRow::into_domain).collect())
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>> {
        sqlx::query_scalar("SELECT id FROM pipelines WHERE deleted_at IS NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(internal)
    }

    async fn update(&self, id: Uuid, patch: PipelinePatch) -> Result<Option<Pipeline>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("UPDATE pipelines SET updated_at = now()");
        if let Some(description) = &patch.description {
            qb.push(", description = ").push_bind(description.clone());
        }
        if let Some(owner) = &patch.owner {
            qb.push(", owner = ").push_bind(owner.clone());
        }
        if let Some(dirty) = patch.draft_dirty {
            qb.push(", draft_dirty = ").push_bind(dirty);
        }
        if let Some(retention) = &patch.retention_override {
            qb.push(", retention_override = ").push_bind(retention.clone());
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(format!(" RETURNING {PIPELINE_COLUMNS}"));

        let row: Option<PipelineRow> = qb
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        Ok(row.map(PipelineRow::into_domain))
    }

    async fn publish(
        &self,
        id: Uuid,
        versions: HashMap<String, String>,
    ) -> Result<Option<Pipeline>> {
        let blob = serde_json::to_value(&versions).unwrap_or_default();
        let row = sqlx::query_as::<_, PipelineRow>(&format!(
            "UPDATE pipelines
             SET published_versions = $2, draft_dirty = false, updated_at = now()
             WHERE id = $1
             RETURNING {PIPELINE_COLUMNS}"
        ))
        .bind(id)
        .bind(blob)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(PipelineRow::into_domain))
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pipelines SET deleted_at = now(), updated_at = now()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_soft_deleted_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Pipeline>> {
        let rows = sqlx::query_as::<_, PipelineRow>(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE deleted_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows.into_iter().map(PipelineRow::into_domain).collect())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pipelines WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Versions
// ============================================================================

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: Uuid,
    pipeline_id: Uuid,
    version_number: i32,
    published_versions: serde_json::Value,
    published_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl VersionRow {
    fn into_domain(self) -> PipelineVersion {
        PipelineVersion {
            id: self.id,
            pipeline_id: self.pipeline_id,
            version_number: self.version_number,
            published_versions: serde_json::from_value(self.published_versions)
                .unwrap_or_default(),
            published_by: self.published_by,
            created_at: self.created_at,
        }
    }
}

pub struct PgVersionStore {
    pool: PgPool,
}

impl PgVersionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn record(
        &self,
        pipeline_id: Uuid,
        versions: HashMap<String, String>,
        published_by: Option<String>,
        keep: i64,
    ) -> Result<PipelineVersion> {
        let blob = serde_json::to_value(&versions).unwrap_or_default();
        let row = sqlx::query_as::<_, VersionRow>(
            "INSERT INTO pipeline_versions
                 (id, pipeline_id, version_number, published_versions, published_by)
             SELECT $1, $2, COALESCE(MAX(version_number), 0) + 1, $3, $4
             FROM pipeline_versions WHERE pipeline_id = $2
             RETURNING id, pipeline_id, version_number, published_versions,
                       published_by, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(pipeline_id)
        .bind(blob)
        .bind(&published_by)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;

        // Prune history beyond the `keep` most recent versions.
        sqlx::query(
            "DELETE FROM pipeline_versions
             WHERE pipeline_id = $1
               AND version_number <= (
                   SELECT MAX(version_number) FROM pipeline_versions WHERE pipeline_id = $1
               ) - $2",
        )
        .bind(pipeline_id)
        .bind(keep.max(1))
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        Ok(row.into_domain())
    }

    async fn list(&self, pipeline_id: Uuid, page: Page) -> Result<Vec<PipelineVersion>> {
        let rows = sqlx::query_as::<_, VersionRow>(
            "SELECT id, pipeline_id, version_number, published_versions,
                    published_by, created_at
             FROM pipeline_versions
             WHERE pipeline_id = $1
             ORDER BY version_number DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(pipeline_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows.into_iter().map(VersionRow::into_domain).collect())
    }
}
