//! Landing zone and landing file stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use smelter_core::ports::{LandingStore, Page, Result};
use smelter_core::types::*;
use smelter_core::SmelterError;

use super::{internal, is_unique_violation};

#[derive(sqlx::FromRow)]
struct ZoneRow {
    id: Uuid,
    namespace: String,
    name: String,
    auto_purge: bool,
    created_at: DateTime<Utc>,
}

impl ZoneRow {
    fn into_domain(self) -> LandingZone {
        LandingZone {
            id: self.id,
            namespace: self.namespace,
            name: self.name,
            auto_purge: self.auto_purge,
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: Uuid,
    zone_id: Uuid,
    file_name: String,
    size_bytes: i64,
    content_type: Option<String>,
    uploaded_by: Option<String>,
    uploaded_at: DateTime<Utc>,
}

impl FileRow {
    fn into_domain(self) -> LandingFile {
        LandingFile {
            id: self.id,
            zone_id: self.zone_id,
            file_name: self.file_name,
            size_bytes: self.size_bytes,
            content_type: self.content_type,
            uploaded_by: self.uploaded_by,
            uploaded_at: self.uploaded_at,
        }
    }
}

pub struct PgLandingStore {
    pool: PgPool,
}

impl PgLandingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LandingStore for PgLandingStore {
    async fn create_zone(&self, new: NewLandingZone) -> Result<LandingZone> {
        let row = sqlx::query_as::<_, ZoneRow>(
            "INSERT INTO landing_zones (id, namespace, name, auto_purge)
             VALUES ($1, $2, $3, $4)
             RETURNING id, namespace, name, auto_purge, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&new.namespace)
        .bind(&new.name)
        .bind(new.auto_purge)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                SmelterError::AlreadyExists(format!("landing zone {}/{}", new.namespace, new.name))
            } else {
                internal(e)
            }
        })?;
        Ok(row.into_domain())
    }

    async fn get_zone(&self, namespace: &str, name: &str) -> Result<Option<LandingZone>> {
        let row = sqlx::query_as::<_, ZoneRow>(
            "SELECT id, namespace, name, auto_purge, created_at
             FROM landing_zones WHERE namespace = $1 AND name = $2",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.map(ZoneRow::into_domain))
    }

    async fn list_zones(&self, page: Page) -> Result<Vec<LandingZone>> {
        let rows = sqlx::query_as::<_, ZoneRow>(
            "SELECT id, namespace, name, auto_purge, created_at
             FROM landing_zones ORDER BY namespace, name LIMIT $1 OFFSET $2",
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows.into_iter().map(ZoneRow::into_domain).collect())
    }

    async fn list_auto_purge_zones(&self) -> Result<Vec<LandingZone>> {
        let rows = sqlx::query_as::<_, ZoneRow>(
            "SELECT id, namespace, name, auto_purge, created_at
             FROM landing_zones WHERE auto_purge = true",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows.into_iter().map(ZoneRow::into_domain).collect())
    }

    async fn delete_zone(&self, id: Uuid) -> Result<bool> {
        // landing_files rows go with the zone (ON DELETE CASCADE).
        let result = sqlx::query("DELETE FROM landing_zones WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_file(&self, new: NewLandingFile) -> Result<LandingFile> {
        let row = sqlx::query_as::<_, FileRow>(
            "INSERT INTO landing_files
                 (id, zone_id, file_name, size_bytes, content_type, uploaded_by)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, zone_id, file_name, size_bytes, content_type,
                       uploaded_by, uploaded_at",
        )
        .bind(Uuid::new_v4())
        .bind(new.zone_id)
        .bind(&new.file_name)
        .bind(new.size_bytes)
        .bind(&new.content_type)
        .bind(&new.uploaded_by)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.into_domain())
    }

    async fn list_files(&self, zone_id: Uuid, page: Page) -> Result<Vec<LandingFile>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT id, zone_id, file_name, size_bytes, content_type,
                    uploaded_by, uploaded_at
             FROM landing_files
             WHERE zone_id = $1
             ORDER BY uploaded_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(zone_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        Ok(rows.into_iter().map(FileRow::into_domain).collect())
    }

    async fn delete_files_for_zone(&self, zone_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM landing_files WHERE zone_id = $1")
            .bind(zone_id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected())
    }
}
