//! End-to-end orchestration scenarios over in-memory stores and an
//! in-process mock worker fleet.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use smelter_core::events::{EventBus, CHANNEL_RUN_COMPLETED};
use smelter_core::memory::{
    memory_stores, AlwaysLeader, MemoryCatalogClient, MemoryEventBus, MemoryObjectStore,
};
use smelter_core::ports::{CatalogClient, Executor, LeaderGate, ObjectMeta, ObjectStore, Stores};
use smelter_core::types::*;

use smelterd::executor::{Reconciler, RoundRobinDispatcher, StatusUpdate, WorkerClient};
use smelterd::reaper::Reaper;
use smelterd::scheduler::Scheduler;
use smelterd::triggers::{token_sha256_hex, FireOutcome, TriggerEvaluator};

use support::{seed_pipeline, seed_run, spawn_worker, FakeExecutor};

fn leader() -> Arc<dyn LeaderGate> {
    Arc::new(AlwaysLeader)
}

fn bus() -> Arc<dyn EventBus> {
    Arc::new(MemoryEventBus::default())
}

fn reconciler_for(clients: Vec<Arc<WorkerClient>>, stores: &Stores) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(
        clients,
        stores.runs.clone(),
        stores.logs.clone(),
        stores.landing.clone(),
        bus(),
    ))
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn round_robin_distributes_evenly() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;

    let worker_a = spawn_worker().await;
    let worker_b = spawn_worker().await;
    let dispatcher = RoundRobinDispatcher::new(vec![
        Arc::new(WorkerClient::new(&worker_a.url, stores.runs.clone())),
        Arc::new(WorkerClient::new(&worker_b.url, stores.runs.clone())),
    ]);

    let mut run_ids = Vec::new();
    for _ in 0..6 {
        let run = seed_run(&stores, &pipeline).await;
        dispatcher.submit(&run, &pipeline).await.unwrap();
        run_ids.push(run.id);
    }

    let got_a = worker_a.state.submitted_run_ids();
    let got_b = worker_b.state.submitted_run_ids();
    assert_eq!(got_a, vec![run_ids[0], run_ids[2], run_ids[4]]);
    assert_eq!(got_b, vec![run_ids[1], run_ids[3], run_ids[5]]);
}

#[tokio::test]
async fn busy_worker_fails_over_to_next() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;

    let busy = spawn_worker().await;
    busy.state.set_busy(true);
    let healthy = spawn_worker().await;

    let dispatcher = RoundRobinDispatcher::new(vec![
        Arc::new(WorkerClient::new(&busy.url, stores.runs.clone())),
        Arc::new(WorkerClient::new(&healthy.url, stores.runs.clone())),
    ]);

    let run = seed_run(&stores, &pipeline).await;
    dispatcher.submit(&run, &pipeline).await.unwrap();

    assert_eq!(busy.state.submission_count(), 0);
    assert_eq!(healthy.state.submission_count(), 1);
    let run = stores.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.started_at.is_some());
}

#[tokio::test]
async fn all_busy_leaves_run_pending() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let worker = spawn_worker().await;
        worker.state.set_busy(true);
        clients.push(Arc::new(WorkerClient::new(&worker.url, stores.runs.clone())));
    }
    let dispatcher = RoundRobinDispatcher::new(clients);

    let run = seed_run(&stores, &pipeline).await;
    let err = dispatcher.submit(&run, &pipeline).await.unwrap_err();
    assert!(err.is_runner_busy());
    assert!(err.to_string().contains("all 3 runners at capacity"));

    let run = stores.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Pending);
}

#[tokio::test]
async fn fatal_submit_error_marks_run_failed() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;

    let worker = spawn_worker().await;
    worker.state.set_fail_submit(true);
    let dispatcher = RoundRobinDispatcher::new(vec![Arc::new(WorkerClient::new(
        &worker.url,
        stores.runs.clone(),
    ))]);

    let run = seed_run(&stores, &pipeline).await;
    assert!(dispatcher.submit(&run, &pipeline).await.is_err());

    let run = stores.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.is_some());
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn terminal_callback_is_idempotent_and_calls_hook_once() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let worker = spawn_worker().await;
    let client = Arc::new(WorkerClient::new(&worker.url, stores.runs.clone()));

    let run = seed_run(&stores, &pipeline).await;
    client.submit(&run, &pipeline).await.unwrap();
    let worker_run_id = worker.state.last_worker_run_id().unwrap();
    worker.state.set_logs(
        &worker_run_id,
        "{\"timestamp\":\"2025-06-01T10:00:00Z\",\"level\":\"info\",\"message\":\"rows written\"}\n",
    );

    let reconciler = reconciler_for(vec![client.clone()], &stores);
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    reconciler.set_on_run_complete(Arc::new(move |_run| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let update = StatusUpdate {
        run_id: run.id,
        status: RunStatus::Success,
        error: None,
        duration_ms: Some(5_000),
        rows_written: Some(100),
        archived_landing_zones: vec![],
    };
    reconciler.handle_status_callback(update.clone()).await.unwrap();
    reconciler.handle_status_callback(update).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let settled = stores.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(settled.status, RunStatus::Success);
    assert_eq!(settled.duration_ms, Some(5_000));
    assert_eq!(settled.rows_written, Some(100));
    assert!(settled.finished_at.is_some());

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(!client.owns(run.id));

    // Logs were pulled and persisted exactly once.
    let persisted = stores.logs.list(run.id, Page::default()).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].message, "rows written");
}

#[tokio::test]
async fn callback_for_unknown_run_is_accepted_regardless_of_status() {
    let stores = memory_stores();
    let reconciler = reconciler_for(vec![], &stores);

    // Terminal payload for a run nobody owns: already reconciled or stale.
    let result = reconciler
        .handle_status_callback(StatusUpdate {
            run_id: Uuid::new_v4(),
            status: RunStatus::Success,
            error: None,
            duration_ms: None,
            rows_written: None,
            archived_landing_zones: vec![],
        })
        .await;
    assert!(result.is_ok());

    // Even a nonsensical non-terminal payload is swallowed when the run is
    // unknown; there is nothing to reconcile.
    let result = reconciler
        .handle_status_callback(StatusUpdate {
            run_id: Uuid::new_v4(),
            status: RunStatus::Running,
            error: None,
            duration_ms: None,
            rows_written: None,
            archived_landing_zones: vec![],
        })
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn callback_rejects_non_terminal_status_for_known_run() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let worker = spawn_worker().await;
    let client = Arc::new(WorkerClient::new(&worker.url, stores.runs.clone()));

    let run = seed_run(&stores, &pipeline).await;
    client.submit(&run, &pipeline).await.unwrap();

    let reconciler = reconciler_for(vec![client.clone()], &stores);
    let err = reconciler
        .handle_status_callback(StatusUpdate {
            run_id: run.id,
            status: RunStatus::Running,
            error: None,
            duration_ms: None,
            rows_written: None,
            archived_landing_zones: vec![],
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");

    // Nothing was reconciled: the run is still running and still tracked.
    let run = stores.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(client.owns(run.id));
}

#[tokio::test]
async fn poll_fallback_reconciles_terminal_run() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let worker = spawn_worker().await;
    let client = Arc::new(WorkerClient::new(&worker.url, stores.runs.clone()));

    let run = seed_run(&stores, &pipeline).await;
    client.submit(&run, &pipeline).await.unwrap();
    let worker_run_id = worker.state.last_worker_run_id().unwrap();
    worker.state.set_status(
        &worker_run_id,
        serde_json::json!({"status": "failed", "error": "out of memory"}),
    );

    let reconciler = reconciler_for(vec![client.clone()], &stores);
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    reconciler.set_on_run_complete(Arc::new(move |_run| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    reconciler.poll_client(&client).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let settled = stores.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(settled.status, RunStatus::Failed);
    assert_eq!(settled.error.as_deref(), Some("out of memory"));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(!client.owns(run.id));
}

#[tokio::test]
async fn cancel_then_worker_success_keeps_one_terminal_state() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let worker = spawn_worker().await;
    let client = Arc::new(WorkerClient::new(&worker.url, stores.runs.clone()));

    let run = seed_run(&stores, &pipeline).await;
    client.submit(&run, &pipeline).await.unwrap();

    let reconciler = reconciler_for(vec![client.clone()], &stores);
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    reconciler.set_on_run_complete(Arc::new(move |_run| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let cancelled = reconciler.cancel_run(run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    // The worker's success lands after the cancel: first writer wins.
    reconciler
        .handle_status_callback(StatusUpdate {
            run_id: run.id,
            status: RunStatus::Success,
            error: None,
            duration_ms: Some(5_000),
            rows_written: Some(100),
            archived_landing_zones: vec![],
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let settled = stores.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(settled.status, RunStatus::Cancelled);
    assert!(!client.owns(run.id));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    // Cancelling a settled run is a conflict.
    let err = reconciler.cancel_run(run.id).await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn successful_run_clears_landing_files_for_archived_zones() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let zone = stores
        .landing
        .create_zone(NewLandingZone {
            namespace: "sales".into(),
            name: "incoming".into(),
            auto_purge: false,
        })
        .await
        .unwrap();
    stores
        .landing
        .add_file(NewLandingFile {
            zone_id: zone.id,
            file_name: "20250601T100000_orders.csv".into(),
            size_bytes: 10,
            content_type: None,
            uploaded_by: None,
        })
        .await
        .unwrap();

    let worker = spawn_worker().await;
    let client = Arc::new(WorkerClient::new(&worker.url, stores.runs.clone()));
    let run = seed_run(&stores, &pipeline).await;
    client.submit(&run, &pipeline).await.unwrap();

    let reconciler = reconciler_for(vec![client], &stores);
    reconciler
        .handle_status_callback(StatusUpdate {
            run_id: run.id,
            status: RunStatus::Success,
            error: None,
            duration_ms: None,
            rows_written: None,
            archived_landing_zones: vec!["sales/incoming".into()],
        })
        .await
        .unwrap();

    let files = stores.landing.list_files(zone.id, Page::default()).await.unwrap();
    assert!(files.is_empty());
}

// ============================================================================
// Scheduler
// ============================================================================

async fn seed_schedule(stores: &Stores, pipeline: &Pipeline, cron: &str, enabled: bool) -> Schedule {
    stores
        .schedules
        .create(NewSchedule {
            pipeline_id: pipeline.id,
            cron_expr: cron.into(),
            enabled,
        })
        .await
        .unwrap()
}

fn scheduler_for(stores: &Stores, executor: Arc<dyn Executor>) -> Scheduler {
    Scheduler::new(
        stores.schedules.clone(),
        stores.pipelines.clone(),
        stores.runs.clone(),
        executor,
        leader(),
    )
}

#[tokio::test]
async fn missed_schedule_catches_up_exactly_once() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let schedule = seed_schedule(&stores, &pipeline, "0 * * * *", true).await;

    // Overdue by three hours.
    let three_hours_ago = Utc::now() - chrono::Duration::hours(3);
    stores
        .schedules
        .update(
            schedule.id,
            SchedulePatch {
                next_run_at: Some(Some(three_hours_ago)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let executor = Arc::new(FakeExecutor::new(stores.runs.clone()));
    let scheduler = scheduler_for(&stores, executor.clone());
    scheduler.tick().await.unwrap();

    // Exactly one run, and next_run_at advanced past now.
    assert_eq!(stores.runs.count(RunFilter::default()).await.unwrap(), 1);
    let after = stores.schedules.get(schedule.id).await.unwrap().unwrap();
    assert!(after.next_run_at.unwrap() > Utc::now());
    assert!(after.last_run_id.is_some());

    let run = stores
        .runs
        .get(after.last_run_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.trigger, "schedule:0 * * * *");

    // A second tick right away does not fire again.
    scheduler.tick().await.unwrap();
    assert_eq!(stores.runs.count(RunFilter::default()).await.unwrap(), 1);
    assert_eq!(executor.submitted_count(), 1);
}

#[tokio::test]
async fn null_next_run_at_is_computed_without_firing() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let schedule = seed_schedule(&stores, &pipeline, "0 * * * *", true).await;

    let scheduler = scheduler_for(&stores, Arc::new(FakeExecutor::new(stores.runs.clone())));
    scheduler.tick().await.unwrap();

    assert_eq!(stores.runs.count(RunFilter::default()).await.unwrap(), 0);
    let after = stores.schedules.get(schedule.id).await.unwrap().unwrap();
    assert!(after.next_run_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn disabled_and_invalid_schedules_are_skipped() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    seed_schedule(&stores, &pipeline, "0 * * * *", false).await;
    let bad = seed_schedule(&stores, &pipeline, "not a cron", true).await;
    stores
        .schedules
        .update(
            bad.id,
            SchedulePatch {
                next_run_at: Some(Some(Utc::now() - chrono::Duration::hours(1))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let scheduler = scheduler_for(&stores, Arc::new(FakeExecutor::new(stores.runs.clone())));
    scheduler.tick().await.unwrap();
    assert_eq!(stores.runs.count(RunFilter::default()).await.unwrap(), 0);
}

#[tokio::test]
async fn busy_runners_leave_schedule_due_and_run_pending() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let schedule = seed_schedule(&stores, &pipeline, "0 * * * *", true).await;
    let due = Utc::now() - chrono::Duration::minutes(5);
    stores
        .schedules
        .update(
            schedule.id,
            SchedulePatch {
                next_run_at: Some(Some(due)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let executor = Arc::new(FakeExecutor::new(stores.runs.clone()));
    executor.busy.store(true, Ordering::SeqCst);
    let scheduler = scheduler_for(&stores, executor);
    scheduler.tick().await.unwrap();

    // Run created, still pending; schedule untouched so the next tick
    // re-evaluates.
    let runs = stores.runs.list(RunFilter::default(), Page::default()).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Pending);
    let after = stores.schedules.get(schedule.id).await.unwrap().unwrap();
    assert_eq!(after.next_run_at, Some(due));
    assert!(after.last_run_id.is_none());
}

// ============================================================================
// Triggers
// ============================================================================

fn evaluator_for(stores: &Stores, executor: Arc<dyn Executor>) -> TriggerEvaluator {
    TriggerEvaluator::new(
        stores.triggers.clone(),
        stores.pipelines.clone(),
        stores.runs.clone(),
        executor,
        bus(),
        leader(),
    )
}

async fn seed_trigger(
    stores: &Stores,
    pipeline: &Pipeline,
    kind: TriggerKind,
    config: serde_json::Value,
    cooldown_seconds: i64,
    token_sha256: Option<String>,
) -> Trigger {
    stores
        .triggers
        .create(NewTrigger {
            pipeline_id: pipeline.id,
            kind,
            config,
            enabled: true,
            cooldown_seconds,
            token_sha256,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn cooldown_blocks_then_allows_fire() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let trigger = seed_trigger(
        &stores,
        &pipeline,
        TriggerKind::LandingZoneUpload,
        serde_json::json!({"namespace": "sales", "zone": "incoming"}),
        60,
        None,
    )
    .await;

    let evaluator = evaluator_for(&stores, Arc::new(FakeExecutor::new(stores.runs.clone())));

    // Fired 30 seconds ago: inside the cooldown window.
    stores
        .triggers
        .record_fire(trigger.id, Uuid::new_v4(), Utc::now() - chrono::Duration::seconds(30))
        .await
        .unwrap();
    let trigger = stores.triggers.get(trigger.id).await.unwrap().unwrap();
    assert!(matches!(
        evaluator.fire(&trigger, "sales/incoming").await.unwrap(),
        FireOutcome::CooldownActive
    ));
    assert_eq!(stores.runs.count(RunFilter::default()).await.unwrap(), 0);

    // Fired 61 seconds ago: past the window.
    stores
        .triggers
        .record_fire(trigger.id, Uuid::new_v4(), Utc::now() - chrono::Duration::seconds(61))
        .await
        .unwrap();
    let trigger = stores.triggers.get(trigger.id).await.unwrap().unwrap();
    let run = match evaluator.fire(&trigger, "sales/incoming").await.unwrap() {
        FireOutcome::Fired(run) => run,
        other => panic!("expected fire, got {other:?}"),
    };
    assert_eq!(run.trigger, "trigger:landing_zone_upload:sales/incoming");

    let after = stores.triggers.get(trigger.id).await.unwrap().unwrap();
    assert_eq!(after.last_run_id, Some(run.id));
    assert!((Utc::now() - after.last_triggered_at.unwrap()).num_seconds() < 5);
}

#[tokio::test]
async fn upload_matches_zone_and_file_pattern_triggers() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    seed_trigger(
        &stores,
        &pipeline,
        TriggerKind::LandingZoneUpload,
        serde_json::json!({"namespace": "sales", "zone": "incoming"}),
        0,
        None,
    )
    .await;
    seed_trigger(
        &stores,
        &pipeline,
        TriggerKind::FilePattern,
        serde_json::json!({"namespace": "sales", "zone": "incoming", "pattern": "*.csv"}),
        0,
        None,
    )
    .await;

    let evaluator = evaluator_for(&stores, Arc::new(FakeExecutor::new(stores.runs.clone())));
    let outcomes = evaluator
        .evaluate_upload("sales", "incoming", "orders.csv")
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(stores.runs.count(RunFilter::default()).await.unwrap(), 2);

    // A parquet drop only matches the zone trigger, which is now cooling
    // down from the fire above... cooldown is zero, so it fires again.
    let outcomes = evaluator
        .evaluate_upload("sales", "incoming", "orders.parquet")
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
}

#[tokio::test]
async fn webhook_token_round_trip() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let token = "smwh_cafef00d";
    seed_trigger(
        &stores,
        &pipeline,
        TriggerKind::Webhook,
        serde_json::json!({}),
        0,
        Some(token_sha256_hex(token)),
    )
    .await;

    let evaluator = evaluator_for(&stores, Arc::new(FakeExecutor::new(stores.runs.clone())));
    let outcome = evaluator.fire_webhook(token).await.unwrap();
    assert!(matches!(outcome, FireOutcome::Fired(_)));

    let err = evaluator.fire_webhook("smwh_wrong").await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn pipeline_success_event_fires_downstream() {
    let stores = memory_stores();
    let upstream = seed_pipeline(&stores, "orders").await;
    let downstream = seed_pipeline(&stores, "orders-enriched").await;
    seed_trigger(
        &stores,
        &downstream,
        TriggerKind::PipelineSuccess,
        serde_json::json!({"namespace": "sales", "layer": "bronze", "name": "orders"}),
        0,
        None,
    )
    .await;

    let executor = Arc::new(FakeExecutor::new(stores.runs.clone()));
    let evaluator = evaluator_for(&stores, executor.clone());

    evaluator
        .handle_run_completed(smelter_core::events::RunCompletedEvent {
            run_id: Uuid::new_v4(),
            pipeline_id: upstream.id,
            status: RunStatus::Success,
        })
        .await
        .unwrap();
    assert_eq!(executor.submitted_count(), 1);

    // Failures do not cascade.
    evaluator
        .handle_run_completed(smelter_core::events::RunCompletedEvent {
            run_id: Uuid::new_v4(),
            pipeline_id: upstream.id,
            status: RunStatus::Failed,
        })
        .await
        .unwrap();
    assert_eq!(executor.submitted_count(), 1);
}

#[tokio::test]
async fn cron_dependency_requires_fresh_upstream_success() {
    let stores = memory_stores();
    let upstream = seed_pipeline(&stores, "orders").await;
    let downstream = seed_pipeline(&stores, "orders-daily").await;
    let trigger = seed_trigger(
        &stores,
        &downstream,
        TriggerKind::CronDependency,
        serde_json::json!({
            "cron": "* * * * *",
            "depends_on": [{"namespace": "sales", "layer": "bronze", "name": "orders"}]
        }),
        0,
        None,
    )
    .await;

    let executor = Arc::new(FakeExecutor::new(stores.runs.clone()));
    let evaluator = evaluator_for(&stores, executor.clone());

    // Make the every-minute slot overdue by recording an old fire. No
    // terminal upstream run exists yet, so the slot is due but the
    // dependency gate holds it back.
    stores
        .triggers
        .record_fire(trigger.id, Uuid::new_v4(), Utc::now() - chrono::Duration::minutes(5))
        .await
        .unwrap();
    evaluator.tick_crons().await.unwrap();
    assert_eq!(executor.submitted_count(), 0);

    // An upstream success newer than the previous fire unlocks it.
    let upstream_run = seed_run(&stores, &upstream).await;
    stores.runs.mark_running(upstream_run.id).await.unwrap();
    stores
        .runs
        .finish(
            upstream_run.id,
            TerminalUpdate {
                status: RunStatus::Success,
                error: None,
                duration_ms: None,
                rows_written: None,
            },
        )
        .await
        .unwrap();
    evaluator.tick_crons().await.unwrap();
    assert_eq!(executor.submitted_count(), 1);
}

// ============================================================================
// Reaper
// ============================================================================

#[tokio::test]
async fn reaper_prunes_runs_quality_audit_and_purges_soft_deleted() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let doomed = seed_pipeline(&stores, "legacy").await;

    // Five terminal runs; policy keeps two.
    for _ in 0..5 {
        let run = seed_run(&stores, &pipeline).await;
        stores.runs.mark_running(run.id).await.unwrap();
        stores
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
    }
    // One stuck pending run.
    seed_run(&stores, &pipeline).await;

    let test = stores
        .quality
        .create_test(pipeline.id, "row_count", serde_json::json!({}))
        .await
        .unwrap();
    for _ in 0..3 {
        stores
            .quality
            .record_result(test.id, None, true, serde_json::json!({}))
            .await
            .unwrap();
    }

    stores
        .audit
        .append(NewAuditEntry {
            actor: "api".into(),
            action: "create".into(),
            entity_kind: "pipeline".into(),
            entity_id: Some(pipeline.id),
            detail: serde_json::json!({}),
        })
        .await
        .unwrap();

    stores.pipelines.soft_delete(doomed.id).await.unwrap();

    stores
        .retention
        .update_system(RetentionPatch {
            runs_max_per_pipeline: Some(2),
            stuck_run_timeout_minutes: Some(0),
            quality_results_max_per_test: Some(1),
            audit_log_max_age_days: Some(0),
            soft_delete_purge_days: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();

    let catalog = Arc::new(MemoryCatalogClient::default());
    catalog.branches.lock().unwrap().extend([
        format!("run-{}", Uuid::new_v4()),
        "main".to_string(),
    ]);
    let objects = Arc::new(MemoryObjectStore::default());
    let zone = stores
        .landing
        .create_zone(NewLandingZone {
            namespace: "sales".into(),
            name: "incoming".into(),
            auto_purge: true,
        })
        .await
        .unwrap();
    objects.objects.lock().unwrap().push(ObjectMeta {
        key: format!("{}/{}/_processed/old.csv", zone.namespace, zone.name),
        last_modified: Utc::now() - chrono::Duration::days(30),
        size_bytes: 10,
    });

    // Give the stuck-cutoff (now - 0 minutes) a moment to pass creation.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let reaper = Reaper::new(
        stores.clone(),
        Some(catalog.clone() as Arc<dyn CatalogClient>),
        Some(objects.clone() as Arc<dyn ObjectStore>),
        leader(),
    );
    let status = reaper.tick().await;

    assert_eq!(status.runs_pruned, 3);
    assert_eq!(status.stuck_runs_failed, 1);
    assert_eq!(status.quality_results_pruned, 2);
    assert_eq!(status.audit_entries_pruned, 1);
    assert_eq!(status.pipelines_purged, 1);
    assert_eq!(status.orphan_branches_deleted, 1);
    assert_eq!(status.landing_files_purged, 1);

    // The stuck run carries the canonical error marker.
    let stuck = stores
        .runs
        .list(
            RunFilter {
                status: Some(RunStatus::Failed),
                ..Default::default()
            },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].error.as_deref(), Some("stuck"));

    assert!(stores.pipelines.get(doomed.id).await.unwrap().is_none());
    assert_eq!(catalog.branches.lock().unwrap().as_slice(), ["main"]);

    // Counters landed in the singleton.
    let persisted = stores.retention.reaper_status().await.unwrap();
    assert_eq!(persisted.runs_pruned, 3);
    assert!(persisted.last_run_at.is_some());
}

// ============================================================================
// Event bus wiring
// ============================================================================

#[tokio::test]
async fn reconciled_run_publishes_run_completed() {
    let stores = memory_stores();
    let pipeline = seed_pipeline(&stores, "orders").await;
    let worker = spawn_worker().await;
    let client = Arc::new(WorkerClient::new(&worker.url, stores.runs.clone()));

    let shared_bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::default());
    let mut subscription = shared_bus.subscribe(CHANNEL_RUN_COMPLETED).await.unwrap();

    let run = seed_run(&stores, &pipeline).await;
    client.submit(&run, &pipeline).await.unwrap();

    let reconciler = Arc::new(Reconciler::new(
        vec![client],
        stores.runs.clone(),
        stores.logs.clone(),
        stores.landing.clone(),
        shared_bus,
    ));
    reconciler
        .handle_status_callback(StatusUpdate {
            run_id: run.id,
            status: RunStatus::Success,
            error: None,
            duration_ms: None,
            rows_written: None,
            archived_landing_zones: vec![],
        })
        .await
        .unwrap();

    let event = subscription.next().await.unwrap();
    assert_eq!(event["run_id"], run.id.to_string());
    assert_eq!(event["pipeline_id"], pipeline.id.to_string());
    assert_eq!(event["status"], "success");
}
