//! Audit log listing.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use smelter_core::types::{AuditEntry, Page};

use super::error::ApiResult;
use super::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/audit", get(list_audit))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    entity_kind: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let entries = state
        .stores
        .audit
        .list(query.entity_kind, Page::clamped(query.limit, query.offset))
        .await?;
    Ok(Json(entries))
}
