//! Trigger resource routes. Webhook triggers get a generated token returned
//! exactly once at creation; only its SHA-256 digest is stored.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use smelter_core::types::*;

use super::error::{invalid, not_found, ApiResult};
use super::state::AppState;
use super::PageQuery;
use crate::triggers::token_sha256_hex;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/pipelines/:id/triggers",
            get(list_triggers).post(create_trigger),
        )
        .route(
            "/api/v1/triggers/:id",
            get(get_trigger).patch(update_trigger).delete(delete_trigger),
        )
}

#[derive(Debug, Deserialize)]
struct CreateTriggerRequest {
    kind: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    cooldown_seconds: i64,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct CreatedTrigger {
    #[serde(flatten)]
    trigger: Trigger,
    /// Present only for webhook triggers, and only in this response.
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_token: Option<String>,
}

async fn create_trigger(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
    Json(req): Json<CreateTriggerRequest>,
) -> ApiResult<(StatusCode, Json<CreatedTrigger>)> {
    let kind = TriggerKind::parse(&req.kind)
        .ok_or_else(|| invalid(format!("unknown trigger kind {:?}", req.kind)))?;
    if req.cooldown_seconds < 0 {
        return Err(invalid("cooldown_seconds must be non-negative"));
    }
    if state
        .stores
        .pipelines
        .get(pipeline_id)
        .await?
        .filter(|p| !p.is_deleted())
        .is_none()
    {
        return Err(not_found(format!("pipeline {pipeline_id}")));
    }

    let webhook_token = match kind {
        TriggerKind::Webhook => Some(format!("smwh_{}", Uuid::new_v4().simple())),
        _ => None,
    };
    let token_sha256 = webhook_token.as_deref().map(token_sha256_hex);

    let trigger = state
        .stores
        .triggers
        .create(NewTrigger {
            pipeline_id,
            kind,
            config: req.config,
            enabled: req.enabled,
            cooldown_seconds: req.cooldown_seconds,
            token_sha256,
        })
        .await?;
    state.audit(
        "create",
        "trigger",
        Some(trigger.id),
        json!({"pipeline_id": pipeline_id, "kind": kind.as_str()}),
    );
    Ok((
        StatusCode::CREATED,
        Json(CreatedTrigger { trigger, webhook_token }),
    ))
}

async fn list_triggers(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Trigger>>> {
    let mut triggers = state
        .stores
        .triggers
        .list(Some(pipeline_id), Page::clamped(page.limit, page.offset))
        .await?;
    // Digests never leave the store layer.
    for trigger in &mut triggers {
        trigger.token_sha256 = None;
    }
    Ok(Json(triggers))
}

async fn get_trigger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Trigger>> {
    let mut trigger = state
        .stores
        .triggers
        .get(id)
        .await?
        .ok_or_else(|| not_found(format!("trigger {id}")))?;
    trigger.token_sha256 = None;
    Ok(Json(trigger))
}

#[derive(Debug, Deserialize)]
struct UpdateTriggerRequest {
    #[serde(default)]
    config: Option<serde_json::Value>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    cooldown_seconds: Option<i64>,
}

async fn update_trigger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTriggerRequest>,
) -> ApiResult<Json<Trigger>> {
    if req.cooldown_seconds.is_some_and(|c| c < 0) {
        return Err(invalid("cooldown_seconds must be non-negative"));
    }
    let mut trigger = state
        .stores
        .triggers
        .update(
            id,
            TriggerPatch {
                config: req.config,
                enabled: req.enabled,
                cooldown_seconds: req.cooldown_seconds,
            },
        )
        .await?
        .ok_or_else(|| not_found(format!("trigger {id}")))?;
    trigger.token_sha256 = None;
    state.audit("update", "trigger", Some(id), json!({}));
    Ok(Json(trigger))
}

async fn delete_trigger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if !state.stores.triggers.delete(id).await? {
        return Err(not_found(format!("trigger {id}")));
    }
    state.audit("delete", "trigger", Some(id), json!({}));
    Ok(StatusCode::NO_CONTENT)
}
