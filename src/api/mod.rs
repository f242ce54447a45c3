//! REST API surface.
//!
//! All routes live under `/api/v1` except `/health`, which is always exempt
//! from auth and rate limiting. Bearer auth applies when an API key is
//! configured; the worker callback ingress authenticates with its own
//! shared secret instead.

pub mod audit;
pub mod callback;
pub mod error;
pub mod landing;
pub mod middleware;
pub mod pipelines;
pub mod retention;
pub mod runs;
pub mod schedules;
pub mod state;
pub mod triggers;
pub mod webhooks;

use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Common `limit`/`offset` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Assemble the full application router.
pub fn build_router(state: AppState) -> Router {
    let mut protected = Router::new()
        .merge(pipelines::router())
        .merge(runs::router())
        .merge(schedules::router())
        .merge(triggers::router())
        .merge(landing::router())
        .merge(webhooks::router())
        .merge(retention::router())
        .merge(audit::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_bearer,
        ));

    if let Some(rps) = state.config.rate_limit_rps {
        let limiter = middleware::build_rate_limiter(rps);
        protected = protected.layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit,
        ));
    }

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .merge(callback::router())
        .layer(axum::middleware::from_fn(middleware::scope_request_id))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
