//! Schedule resource routes, nested under pipelines for creation.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use smelter_core::types::*;

use super::error::{invalid, not_found, ApiResult};
use super::state::AppState;
use super::PageQuery;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/pipelines/:id/schedules",
            get(list_schedules).post(create_schedule),
        )
        .route(
            "/api/v1/schedules/:id",
            get(get_schedule).patch(update_schedule).delete(delete_schedule),
        )
}

#[derive(Debug, Deserialize)]
struct CreateScheduleRequest {
    cron: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create_schedule(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
    Json(req): Json<CreateScheduleRequest>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    // Reject bad expressions at the boundary instead of every tick.
    crate::cron_util::parse_cron(&req.cron)?;

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

    let schedule = state
        .stores
        .schedules
        .create(NewSchedule {
            pipeline_id,
            cron_expr: req.cron,
            enabled: req.enabled,
        })
        .await?;
    state.audit("create", "schedule", Some(schedule.id), json!({"pipeline_id": pipeline_id}));
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn list_schedules(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Schedule>>> {
    let schedules = state
        .stores
        .schedules
        .list(Some(pipeline_id), Page::clamped(page.limit, page.offset))
        .await?;
    Ok(Json(schedules))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    let schedule = state
        .stores
        .schedules
        .get(id)
        .await?
        .ok_or_else(|| not_found(format!("schedule {id}")))?;
    Ok(Json(schedule))
}

#[derive(Debug, Deserialize)]
struct UpdateScheduleRequest {
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateScheduleRequest>,
) -> ApiResult<Json<Schedule>> {
    if let Some(cron) = &req.cron {
        crate::cron_util::parse_cron(cron)
            .map_err(|e| invalid(e.to_string()))?;
    }
    let schedule = state
        .stores
        .schedules
        .update(
            id,
            SchedulePatch {
                cron_expr: req.cron,
                enabled: req.enabled,
                next_run_at: None,
            },
        )
        .await?
        .ok_or_else(|| not_found(format!("schedule {id}")))?;
    state.audit("update", "schedule", Some(id), json!({}));
    Ok(Json(schedule))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if !state.stores.schedules.delete(id).await? {
        return Err(not_found(format!("schedule {id}")));
    }
    state.audit("delete", "schedule", Some(id), json!({}));
    Ok(StatusCode::NO_CONTENT)
}
