//! Internal worker callback ingress.
//!
//! Workers POST terminal status updates here. Authentication is a shared
//! secret header (deployment-specific; mTLS terminates in front of us).
//! Unknown runs are accepted so worker retries after a reconcile are
//! harmless.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use subtle::ConstantTimeEq;

use smelter_core::SmelterError;

use super::error::ApiResult;
use super::state::AppState;
use crate::executor::StatusUpdate;

pub const SECRET_HEADER: &str = "X-Callback-Secret";

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/internal/runs/callback", post(status_callback))
}

async fn status_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<StatusUpdate>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if let Some(expected) = state.config.callback_secret.as_deref() {
        let presented = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
            return Err(SmelterError::Unauthenticated(
                "missing or invalid callback secret".into(),
            )
            .into());
        }
    }

    state.reconciler.handle_status_callback(update).await?;
    Ok((StatusCode::OK, Json(json!({"accepted": true}))))
}
