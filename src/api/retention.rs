//! Retention admin routes: system config, reaper status, feature flags.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use smelter_core::types::{ReaperStatus, RetentionConfig, RetentionPatch};

use super::error::ApiResult;
use super::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/retention", get(get_retention).put(update_retention))
        .route("/api/v1/retention/status", get(reaper_status))
        .route("/api/v1/flags", get(all_flags))
        .route("/api/v1/flags/:name", get(get_flag).put(set_flag))
}

async fn get_retention(State(state): State<AppState>) -> ApiResult<Json<RetentionConfig>> {
    Ok(Json(state.stores.retention.system().await?))
}

async fn update_retention(
    State(state): State<AppState>,
    Json(patch): Json<RetentionPatch>,
) -> ApiResult<Json<RetentionConfig>> {
    let config = state.stores.retention.update_system(patch).await?;
    state.audit("update", "retention_config", None, json!({}));
    Ok(Json(config))
}

async fn reaper_status(State(state): State<AppState>) -> ApiResult<Json<ReaperStatus>> {
    Ok(Json(state.stores.retention.reaper_status().await?))
}

async fn all_flags(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.stores.flags.all().await?))
}

async fn get_flag(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(
        state
            .stores
            .flags
            .get(&name)
            .await?
            .unwrap_or(serde_json::Value::Null),
    ))
}

async fn set_flag(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    state.stores.flags.set(&name, value.clone()).await?;
    state.audit("set", "feature_flag", None, json!({"name": name}));
    Ok(Json(value))
}
