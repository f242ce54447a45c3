//! REST surface tests over in-memory stores: envelope shape, auth, and the
//! dispatch-less degradation paths.

mod support;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use smelter_core::events::EventBus;
use smelter_core::memory::{memory_stores, AlwaysLeader, MemoryEventBus};
use smelter_core::types::*;

use smelterd::api::{build_router, AppState};
use smelterd::config::Config;
use smelterd::executor::Reconciler;
use smelterd::triggers::{token_sha256_hex, TriggerEvaluator};

use support::FakeExecutor;

fn test_state(api_key: Option<String>, callback_secret: Option<String>) -> AppState {
    let stores = memory_stores();
    let bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::default());
    let reconciler = Arc::new(Reconciler::new(
        vec![],
        stores.runs.clone(),
        stores.logs.clone(),
        stores.landing.clone(),
        bus.clone(),
    ));
    let evaluator = Arc::new(TriggerEvaluator::new(
        stores.triggers.clone(),
        stores.pipelines.clone(),
        stores.runs.clone(),
        Arc::new(FakeExecutor::new(stores.runs.clone())),
        bus.clone(),
        Arc::new(AlwaysLeader),
    ));
    let config = Arc::new(Config {
        database_url: "postgres://unused".into(),
        http_addr: ([127, 0, 0, 1], 0).into(),
        workers: vec![],
        api_key,
        callback_secret,
        db_max_connections: 5,
        rate_limit_rps: None,
        log_stream_max_secs: 30,
        catalog_url: None,
    });
    AppState {
        stores,
        executor: None,
        reconciler,
        evaluator,
        bus,
        config,
    }
}

fn app(state: &AppState) -> Router {
    build_router(state.clone())
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_is_always_open() {
    let state = test_state(Some("sekrit".into()), None);
    let response = app(&state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn bearer_auth_gates_the_api() {
    let state = test_state(Some("sekrit".into()), None);

    let denied = app(&state)
        .oneshot(Request::get("/api/v1/pipelines").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(denied).await;
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");

    let allowed = app(&state)
        .oneshot(
            Request::get("/api/v1/pipelines")
                .header(header::AUTHORIZATION, "Bearer sekrit")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn pipeline_create_conflicts_surface_already_exists() {
    let state = test_state(None, None);
    let payload = json!({"namespace": "sales", "layer": "bronze", "name": "orders"});

    let created = app(&state)
        .oneshot(post_json("/api/v1/pipelines", payload.clone()))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);

    let duplicate = app(&state)
        .oneshot(post_json("/api/v1/pipelines", payload))
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let body = body_json(duplicate).await;
    assert_eq!(body["error"]["code"], "ALREADY_EXISTS");
}

#[tokio::test]
async fn unknown_layer_is_invalid_argument() {
    let state = test_state(None, None);
    let response = app(&state)
        .oneshot(post_json(
            "/api/v1/pipelines",
            json!({"namespace": "sales", "layer": "platinum", "name": "orders"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn manual_run_without_workers_stays_pending() {
    let state = test_state(None, None);
    let pipeline = support::seed_pipeline(&state.stores, "orders").await;

    let response = app(&state)
        .oneshot(post_json(
            &format!("/api/v1/pipelines/{}/runs", pipeline.id),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["trigger"], "manual");
}

#[tokio::test]
async fn callback_accepts_unknown_runs_and_checks_secret() {
    let state = test_state(None, Some("wormsign".into()));
    let payload = json!({"run_id": uuid::Uuid::new_v4(), "status": "success"});

    let denied = app(&state)
        .oneshot(post_json("/api/v1/internal/runs/callback", payload.clone()))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let accepted = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/internal/runs/callback")
                .header(header::CONTENT_TYPE, "application/json")
                .header("X-Callback-Secret", "wormsign")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::OK);
    let body = body_json(accepted).await;
    assert_eq!(body["accepted"], true);
}

#[tokio::test]
async fn webhook_cooldown_returns_resource_exhausted() {
    let state = test_state(None, None);
    let pipeline = support::seed_pipeline(&state.stores, "orders").await;
    let token = "smwh_test";
    let trigger = state
        .stores
        .triggers
        .create(NewTrigger {
            pipeline_id: pipeline.id,
            kind: TriggerKind::Webhook,
            config: json!({}),
            enabled: true,
            cooldown_seconds: 3_600,
            token_sha256: Some(token_sha256_hex(token)),
        })
        .await
        .unwrap();

    let first = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/webhooks")
                .header("X-Webhook-Token", token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let body = body_json(first).await;
    assert!(body["run_id"].is_string());

    // Immediately again: inside the hour-long cooldown.
    let second = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/webhooks")
                .header("X-Webhook-Token", token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(second).await;
    assert_eq!(body["error"]["code"], "RESOURCE_EXHAUSTED");
    assert_eq!(body["error"]["message"], "resource exhausted: cooldown-active");

    let after = state.stores.triggers.get(trigger.id).await.unwrap().unwrap();
    assert!(after.last_run_id.is_some());
}

#[tokio::test]
async fn cancel_of_terminal_run_is_a_conflict() {
    let state = test_state(None, None);
    let pipeline = support::seed_pipeline(&state.stores, "orders").await;
    let run = support::seed_run(&state.stores, &pipeline).await;
    state.stores.runs.mark_running(run.id).await.unwrap();
    state
        .stores
        .runs
        .finish(
            run.id,
            TerminalUpdate {
                status: RunStatus::Success,
                error: None,
                duration_ms: None,
                rows_written: None,
            },
        )
        .await
        .unwrap();

    let response = app(&state)
        .oneshot(post_json(&format!("/api/v1/runs/{}/cancel", run.id), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn soft_deleted_pipeline_key_can_be_recreated_via_api() {
    let state = test_state(None, None);
    let payload = json!({"namespace": "sales", "layer": "bronze", "name": "orders"});

    let created = app(&state)
        .oneshot(post_json("/api/v1/pipelines", payload.clone()))
        .await
        .unwrap();
    let body = body_json(created).await;
    let id = body["id"].as_str().unwrap().to_string();

    let deleted = app(&state)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/pipelines/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let recreated = app(&state)
        .oneshot(post_json("/api/v1/pipelines", payload))
        .await
        .unwrap();
    assert_eq!(recreated.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn upload_records_file_with_timestamp_prefix() {
    let state = test_state(None, None);
    state
        .stores
        .landing
        .create_zone(NewLandingZone {
            namespace: "sales".into(),
            name: "incoming".into(),
            auto_purge: false,
        })
        .await
        .unwrap();

    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/landing-zones/sales/incoming/files?filename=orders.csv")
                .header(header::CONTENT_TYPE, "text/csv")
                .body(Body::from("id,total\n1,9.50\n"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let stored_name = body["file_name"].as_str().unwrap();
    assert!(stored_name.ends_with("_orders.csv"));
    assert_ne!(stored_name, "orders.csv");
    assert_eq!(body["size_bytes"], 16);
    assert_eq!(body["content_type"], "text/csv");
}
