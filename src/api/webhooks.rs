//! Webhook ingress. The token travels in a header, never the URL, so it
//! stays out of access logs and proxies.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use smelter_core::SmelterError;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::triggers::FireOutcome;

pub const TOKEN_HEADER: &str = "X-Webhook-Token";

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/webhooks", post(fire_webhook))
}

async fn fire_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(SmelterError::Unauthenticated(format!(
            "missing {TOKEN_HEADER} header"
        )))?;

    match state.evaluator.fire_webhook(token).await? {
        FireOutcome::Fired(run) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({"run_id": run.id, "status": run.status})),
        )),
        FireOutcome::CooldownActive => Err(ApiError(SmelterError::ResourceExhausted(
            "cooldown-active".into(),
        ))),
        FireOutcome::Disabled => Err(ApiError(SmelterError::Conflict(
            "trigger is disabled".into(),
        ))),
        FireOutcome::PipelineMissing => Err(ApiError(SmelterError::NotFound(
            "pipeline for trigger not found".into(),
        ))),
    }
}
