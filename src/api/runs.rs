//! Run resource routes: manual dispatch, listing, cancel, and logs
//! (persisted and live SSE).

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use smelter_core::types::*;
use smelter_core::SmelterError;

use super::error::{invalid, not_found, ApiResult};
use super::state::AppState;
use super::PageQuery;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/pipelines/:id/runs", post(start_run))
        .route("/api/v1/runs", get(list_runs))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/runs/:id/cancel", post(cancel_run))
        .route("/api/v1/runs/:id/logs", get(get_logs))
        .route("/api/v1/runs/:id/logs/stream", get(stream_logs))
}

#[derive(Debug, Default, Deserialize)]
struct StartRunRequest {
    /// Per-run S3 credential overrides, forwarded to the worker and never
    /// persisted.
    #[serde(default)]
    s3_credentials: Option<S3Credentials>,
}

async fn start_run(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
    body: Option<Json<StartRunRequest>>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let pipeline = state
        .stores
        .pipelines
        .get(pipeline_id)
        .await?
        .filter(|p| !p.is_deleted())
        .ok_or_else(|| not_found(format!("pipeline {pipeline_id}")))?;

    let req = body.map(|Json(b)| b).unwrap_or_default();
    let run = state
        .stores
        .runs
        .create(NewRun {
            pipeline_id: pipeline.id,
            trigger: "manual".to_string(),
            s3_credentials: req.s3_credentials,
        })
        .await?;
    state.audit("start_run", "run", Some(run.id), json!({"pipeline_id": pipeline.id}));

    let Some(executor) = state.executor.as_ref() else {
        // No workers configured: the row exists and waits; the reaper's
        // stuck-run timeout is the backstop.
        return Ok((StatusCode::ACCEPTED, Json(run)));
    };

    match executor.submit(&run, &pipeline).await {
        Ok(()) => {
            let run = state
                .stores
                .runs
                .get(run.id)
                .await?
                .ok_or_else(|| not_found(format!("run {}", run.id)))?;
            Ok((StatusCode::CREATED, Json(run)))
        }
        Err(e) if e.is_runner_busy() => {
            // Capacity exhaustion: the run stays pending and the caller
            // sees it as such.
            let run = state
                .stores
                .runs
                .get(run.id)
                .await?
                .ok_or_else(|| not_found(format!("run {}", run.id)))?;
            Ok((StatusCode::ACCEPTED, Json(run)))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct RunListQuery {
    #[serde(default)]
    pipeline_id: Option<Uuid>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunListQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    let status = match &query.status {
        Some(raw) => Some(
            RunStatus::parse(raw).ok_or_else(|| invalid(format!("unknown status {raw:?}")))?,
        ),
        None => None,
    };
    let runs = state
        .stores
        .runs
        .list(
            RunFilter {
                pipeline_id: query.pipeline_id,
                status,
                trigger_prefix: None,
            },
            Page::clamped(query.limit, query.offset),
        )
        .await?;
    Ok(Json(runs))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Run>> {
    let run = state
        .stores
        .runs
        .get(id)
        .await?
        .ok_or_else(|| not_found(format!("run {id}")))?;
    Ok(Json(run))
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Run>> {
    let run = state.reconciler.cancel_run(id).await?;
    state.audit("cancel", "run", Some(id), json!({}));
    Ok(Json(run))
}

async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    if state.stores.runs.get(id).await?.is_none() {
        return Err(not_found(format!("run {id}")));
    }
    let entries = state
        .stores
        .logs
        .list(id, Page::clamped(page.limit, page.offset))
        .await?;
    Ok(Json(entries))
}

/// Live SSE tail from the owning worker, capped at the configured maximum
/// duration. Terminal runs stream their persisted logs instead.
async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<axum::response::Response> {
    let run = state
        .stores
        .runs
        .get(id)
        .await?
        .ok_or_else(|| not_found(format!("run {id}")))?;

    let max_duration = Duration::from_secs(state.config.log_stream_max_secs);

    if run.status.is_terminal() {
        let entries = state.stores.logs.list(id, Page::default()).await?;
        let stream = futures::stream::iter(entries.into_iter().map(to_sse_event));
        return Ok(sse_response(stream));
    }

    let client = state
        .reconciler
        .owner_of(id)
        .ok_or(SmelterError::Unavailable(
            "run is not active on any worker".into(),
        ))?;
    let live = client.log_stream(id, true).await?;
    let capped = live
        .take_until(tokio::time::sleep(max_duration))
        .map(to_sse_event);
    Ok(sse_response(capped))
}

fn to_sse_event(entry: LogEntry) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&entry).unwrap_or_default();
    Ok(Event::default().event("log").data(data))
}

fn sse_response<S>(stream: S) -> axum::response::Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response()
}
