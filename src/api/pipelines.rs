//! Pipeline resource routes, including publish, versions, retention
//! overrides, and preview/validate passthrough.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use smelter_core::events::{PipelineChangedEvent, CHANNEL_PIPELINE_CREATED, CHANNEL_PIPELINE_UPDATED};
use smelter_core::types::*;
use smelter_core::SmelterError;

use super::error::{invalid, not_found, ApiResult};
use super::state::AppState;
use super::PageQuery;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/pipelines", get(list_pipelines).post(create_pipeline))
        .route(
            "/api/v1/pipelines/:id",
            get(get_pipeline).patch(update_pipeline).delete(delete_pipeline),
        )
        .route("/api/v1/pipelines/:id/publish", post(publish_pipeline))
        .route("/api/v1/pipelines/:id/versions", get(list_versions))
        .route("/api/v1/pipelines/:id/retention", put(set_retention_override))
        .route("/api/v1/pipelines/:id/preview", post(preview))
        .route("/api/v1/pipelines/:id/validate", post(validate))
}

#[derive(Debug, Deserialize)]
struct CreatePipelineRequest {
    namespace: String,
    layer: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    layer: Option<String>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn create_pipeline(
    State(state): State<AppState>,
    Json(req): Json<CreatePipelineRequest>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    let layer = Layer::parse(&req.layer)
        .ok_or_else(|| invalid(format!("unknown layer {:?}", req.layer)))?;
    if req.namespace.is_empty() || req.name.is_empty() {
        return Err(invalid("namespace and name are required"));
    }

    let pipeline = state
        .stores
        .pipelines
        .create(NewPipeline {
            namespace: req.namespace,
            layer,
            name: req.name,
            description: req.description,
            owner: req.owner,
        })
        .await?;

    publish_pipeline_event(&state, CHANNEL_PIPELINE_CREATED, &pipeline).await;
    state.audit("create", "pipeline", Some(pipeline.id), json!({"key": pipeline.key().to_string()}));
    Ok((StatusCode::CREATED, Json(pipeline)))
}

async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Pipeline>>> {
    let layer = match &query.layer {
        Some(raw) => {
            Some(Layer::parse(raw).ok_or_else(|| invalid(format!("unknown layer {raw:?}")))?)
        }
        None => None,
    };
    let pipelines = state
        .stores
        .pipelines
        .list(
            PipelineFilter {
                namespace: query.namespace,
                layer,
                name_contains: query.q,
                include_deleted: false,
            },
            Page::clamped(query.limit, query.offset),
        )
        .await?;
    Ok(Json(pipelines))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Pipeline>> {
    let pipeline = state
        .stores
        .pipelines
        .get(id)
        .await?
        .filter(|p| !p.is_deleted())
        .ok_or_else(|| not_found(format!("pipeline {id}")))?;
    Ok(Json(pipeline))
}

#[derive(Debug, Deserialize)]
struct UpdatePipelineRequest {
    #[serde(default)]
    description: Option<Option<String>>,
    #[serde(default)]
    owner: Option<Option<String>>,
    #[serde(default)]
    draft_dirty: Option<bool>,
}

async fn update_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdatePipelineRequest>,
) -> ApiResult<Json<Pipeline>> {
    let pipeline = state
        .stores
        .pipelines
        .update(
            id,
            PipelinePatch {
                description: req.description,
                owner: req.owner,
                draft_dirty: req.draft_dirty,
                retention_override: None,
            },
        )
        .await?
        .ok_or_else(|| not_found(format!("pipeline {id}")))?;

    publish_pipeline_event(&state, CHANNEL_PIPELINE_UPDATED, &pipeline).await;
    state.audit("update", "pipeline", Some(id), json!({}));
    Ok(Json(pipeline))
}

async fn delete_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if !state.stores.pipelines.soft_delete(id).await? {
        return Err(not_found(format!("pipeline {id}")));
    }
    state.audit("delete", "pipeline", Some(id), json!({}));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    /// File path → storage version id snapshot being promoted.
    published_versions: HashMap<String, String>,
    #[serde(default)]
    published_by: Option<String>,
}

/// Versions kept per pipeline.
const VERSION_HISTORY_KEEP: i64 = 20;

async fn publish_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PublishRequest>,
) -> ApiResult<Json<Pipeline>> {
    let pipeline = state
        .stores
        .pipelines
        .publish(id, req.published_versions.clone())
        .await?
        .ok_or_else(|| not_found(format!("pipeline {id}")))?;

    let version = state
        .stores
        .versions
        .record(id, req.published_versions, req.published_by, VERSION_HISTORY_KEEP)
        .await?;

    publish_pipeline_event(&state, CHANNEL_PIPELINE_UPDATED, &pipeline).await;
    state.audit(
        "publish",
        "pipeline",
        Some(id),
        json!({"version_number": version.version_number}),
    );
    Ok(Json(pipeline))
}

async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<PipelineVersion>>> {
    let versions = state
        .stores
        .versions
        .list(id, Page::clamped(page.limit, page.offset))
        .await?;
    Ok(Json(versions))
}

async fn set_retention_override(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(blob): Json<Option<serde_json::Value>>,
) -> ApiResult<Json<Pipeline>> {
    let pipeline = state
        .stores
        .pipelines
        .update(
            id,
            PipelinePatch {
                retention_override: Some(blob),
                ..Default::default()
            },
        )
        .await?
        .ok_or_else(|| not_found(format!("pipeline {id}")))?;
    state.audit("retention_override", "pipeline", Some(id), json!({}));
    Ok(Json(pipeline))
}

#[derive(Debug, Deserialize)]
struct PreviewBody {
    sql: String,
}

async fn preview(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PreviewBody>,
) -> ApiResult<Json<smelter_core::ports::QueryResult>> {
    let executor = state
        .executor
        .as_ref()
        .ok_or(SmelterError::Unavailable("no workers configured".into()))?;
    let pipeline = state
        .stores
        .pipelines
        .get(id)
        .await?
        .filter(|p| !p.is_deleted())
        .ok_or_else(|| not_found(format!("pipeline {id}")))?;
    let result = executor.preview(&pipeline, &body.sql).await?;
    Ok(Json(result))
}

async fn validate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<smelter_core::ports::QueryResult>> {
    let executor = state
        .executor
        .as_ref()
        .ok_or(SmelterError::Unavailable("no workers configured".into()))?;
    let pipeline = state
        .stores
        .pipelines
        .get(id)
        .await?
        .filter(|p| !p.is_deleted())
        .ok_or_else(|| not_found(format!("pipeline {id}")))?;
    let result = executor.validate(&pipeline).await?;
    Ok(Json(result))
}

/// Best-effort change event; the row is already committed.
async fn publish_pipeline_event(state: &AppState, channel: &str, pipeline: &Pipeline) {
    let event = PipelineChangedEvent {
        pipeline_id: pipeline.id,
        namespace: pipeline.namespace.clone(),
        layer: pipeline.layer,
        name: pipeline.name.clone(),
    };
    if let Err(e) = state
        .bus
        .publish(channel, serde_json::to_value(&event).unwrap_or_default())
        .await
    {
        tracing::warn!(channel, error = %e, "pipeline event publish failed");
    }
}
