//! Landing zone routes: zone CRUD, file upload (metadata + trigger
//! evaluation), and file listing.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use smelter_core::types::*;

use super::error::{invalid, not_found, ApiResult};
use super::state::AppState;
use super::PageQuery;

/// Upload size cap.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Cap on the spawned trigger evaluation.
const UPLOAD_EVAL_TIMEOUT: Duration = Duration::from_secs(30);

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/landing-zones",
            get(list_zones).post(create_zone),
        )
        .route("/api/v1/landing-zones/:namespace/:name", delete(delete_zone))
        .route(
            "/api/v1/landing-zones/:namespace/:name/files",
            get(list_files).post(upload_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
}

#[derive(Debug, Deserialize)]
struct CreateZoneRequest {
    namespace: String,
    name: String,
    #[serde(default)]
    auto_purge: bool,
}

async fn create_zone(
    State(state): State<AppState>,
    Json(req): Json<CreateZoneRequest>,
) -> ApiResult<(StatusCode, Json<LandingZone>)> {
    if req.namespace.is_empty() || req.name.is_empty() {
        return Err(invalid("namespace and name are required"));
    }
    let zone = state
        .stores
        .landing
        .create_zone(NewLandingZone {
            namespace: req.namespace,
            name: req.name,
            auto_purge: req.auto_purge,
        })
        .await?;
    state.audit("create", "landing_zone", Some(zone.id), json!({}));
    Ok((StatusCode::CREATED, Json(zone)))
}

async fn list_zones(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<LandingZone>>> {
    let zones = state
        .stores
        .landing
        .list_zones(Page::clamped(page.limit, page.offset))
        .await?;
    Ok(Json(zones))
}

async fn delete_zone(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let zone = state
        .stores
        .landing
        .get_zone(&namespace, &name)
        .await?
        .ok_or_else(|| not_found(format!("landing zone {namespace}/{name}")))?;
    state.stores.landing.delete_zone(zone.id).await?;
    state.audit("delete", "landing_zone", Some(zone.id), json!({}));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: String,
    #[serde(default)]
    uploaded_by: Option<String>,
}

async fn upload_file(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<LandingFile>)> {
    if query.filename.is_empty() || query.filename.contains('/') {
        return Err(invalid("filename must be a plain file name"));
    }
    let zone = state
        .stores
        .landing
        .get_zone(&namespace, &name)
        .await?
        .ok_or_else(|| not_found(format!("landing zone {namespace}/{name}")))?;

    // Timestamp prefix avoids collisions between repeated uploads of the
    // same name.
    let stored_name = format!(
        "{}_{}",
        Utc::now().format("%Y%m%dT%H%M%S%3f"),
        query.filename
    );
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let file = state
        .stores
        .landing
        .add_file(NewLandingFile {
            zone_id: zone.id,
            file_name: stored_name,
            size_bytes: body.len() as i64,
            content_type,
            uploaded_by: query.uploaded_by,
        })
        .await?;
    state.audit(
        "upload",
        "landing_file",
        Some(file.id),
        json!({"zone": format!("{namespace}/{name}"), "size": file.size_bytes}),
    );

    // Trigger evaluation is fire-and-forget on a server-scoped task so the
    // upload response is not held hostage by dispatch latency.
    let evaluator = state.evaluator.clone();
    let original_name = query.filename.clone();
    tokio::spawn(async move {
        let evaluation = evaluator.evaluate_upload(&namespace, &name, &original_name);
        match tokio::time::timeout(UPLOAD_EVAL_TIMEOUT, evaluation).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "upload trigger evaluation failed"),
            Err(_) => tracing::warn!("upload trigger evaluation timed out"),
        }
    });

    Ok((StatusCode::CREATED, Json(file)))
}

async fn list_files(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<LandingFile>>> {
    let zone = state
        .stores
        .landing
        .get_zone(&namespace, &name)
        .await?
        .ok_or_else(|| not_found(format!("landing zone {namespace}/{name}")))?;
    let files = state
        .stores
        .landing
        .list_files(zone.id, Page::clamped(page.limit, page.offset))
        .await?;
    Ok(Json(files))
}
