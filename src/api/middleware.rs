//! Cross-cutting request middleware: bearer auth, per-IP rate limiting, and
//! request-id scoping.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header::AUTHORIZATION, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use subtle::ConstantTimeEq;

use smelter_core::SmelterError;

use crate::request_id;

use super::error::ApiError;
use super::state::AppState;

pub type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

pub fn build_rate_limiter(rps: u32) -> Arc<IpRateLimiter> {
    let quota = Quota::per_second(NonZeroU32::new(rps.max(1)).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::keyed(quota))
}

fn extract_bearer_token(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Require the configured API key. A no-op when none is configured;
/// `/health` never passes through here.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(request).await;
    };

    let presented = extract_bearer_token(&request).unwrap_or_default();
    if presented.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return ApiError(SmelterError::Unauthenticated(
            "missing or invalid bearer token".into(),
        ))
        .into_response();
    }
    next.run(request).await
}

/// Per-IP token bucket. Requests without connection info (in-process tests)
/// share one bucket.
pub async fn rate_limit(
    State(limiter): State<Arc<IpRateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    if limiter.check_key(&ip).is_err() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({
                "error": { "code": "RESOURCE_EXHAUSTED", "message": "rate limit exceeded" }
            })),
        )
            .into_response();
    }
    next.run(request).await
}

/// Scope the incoming `X-Request-ID` (if any) into the task-local so
/// outgoing worker RPCs can propagate it.
pub async fn scope_request_id(request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get(request_id::HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    request_id::scope(id, next.run(request)).await
}
