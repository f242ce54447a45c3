//! smelterd entry point: configuration, migration, wiring, serve.

use std::sync::Arc;

use tokio::sync::watch;

use smelter_core::events::EventBus;
use smelter_core::ports::{Executor, LeaderGate};

use smelterd::api::{build_router, AppState};
use smelterd::catalog::HttpCatalogClient;
use smelterd::config::Config;
use smelterd::executor::{Reconciler, RoundRobinDispatcher, WorkerClient};
use smelterd::reaper::Reaper;
use smelterd::scheduler::Scheduler;
use smelterd::triggers::TriggerEvaluator;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env().map_err(|e| anyhow::anyhow!(e))?);

    let pool = smelter_postgres::connect(&config.database_url, config.db_max_connections)
        .await
        .map_err(|e| anyhow::anyhow!("database: {e}"))?;
    smelter_postgres::run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("migrations: {e}"))?;
    tracing::info!("database ready");

    let stores = smelter_postgres::postgres_stores(pool.clone());
    let leader: Arc<dyn LeaderGate> = Arc::new(smelter_postgres::PgLeaderGate::new(pool.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let (bus, bus_handle) = smelter_postgres::PgEventBus::start(pool, shutdown_rx.clone())
        .await
        .map_err(|e| anyhow::anyhow!("event bus: {e}"))?;
    let bus: Arc<dyn EventBus> = bus;
    handles.push(bus_handle);

    // Worker fleet.
    let clients: Vec<Arc<WorkerClient>> = config
        .workers
        .iter()
        .map(|url| Arc::new(WorkerClient::new(url, stores.runs.clone())))
        .collect();
    let executor: Option<Arc<dyn Executor>> = if clients.is_empty() {
        tracing::warn!("SMELTER_WORKERS is empty; dispatch, scheduler, and triggers stay idle");
        None
    } else {
        tracing::info!(workers = clients.len(), "worker dispatch ready");
        Some(Arc::new(RoundRobinDispatcher::new(clients.clone())))
    };

    let reconciler = Arc::new(Reconciler::new(
        clients.clone(),
        stores.runs.clone(),
        stores.logs.clone(),
        stores.landing.clone(),
        bus.clone(),
    ));
    handles.extend(reconciler.clone().spawn_pollers(shutdown_rx.clone()));

    let evaluator = Arc::new(TriggerEvaluator::new(
        stores.triggers.clone(),
        stores.pipelines.clone(),
        stores.runs.clone(),
        executor
            .clone()
            .unwrap_or_else(|| Arc::new(IdleExecutor) as Arc<dyn Executor>),
        bus.clone(),
        leader.clone(),
    ));

    if let Some(executor) = executor.clone() {
        let scheduler = Arc::new(Scheduler::new(
            stores.schedules.clone(),
            stores.pipelines.clone(),
            stores.runs.clone(),
            executor,
            leader.clone(),
        ));
        handles.push(scheduler.spawn(shutdown_rx.clone()));
        handles.extend(evaluator.clone().spawn(shutdown_rx.clone()));
    } else {
        tracing::info!("scheduler idle: no executor configured");
    }

    let catalog = config
        .catalog_url
        .as_deref()
        .map(|url| Arc::new(HttpCatalogClient::new(url)) as Arc<dyn smelter_core::ports::CatalogClient>);
    if catalog.is_none() {
        tracing::info!("no catalog configured; orphan-branch phase disabled");
    }
    let reaper = Arc::new(Reaper::new(stores.clone(), catalog, None, leader.clone()));
    handles.push(reaper.clone().spawn(shutdown_rx.clone()));

    let state = AppState {
        stores,
        executor,
        reconciler: reconciler.clone(),
        evaluator: evaluator.clone(),
        bus,
        config: config.clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    tracing::info!(addr = %config.http_addr, "smelterd listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    // Stop background loops and wait for them to drain.
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    for component in ["scheduler", "reaper", "trigger-evaluator"] {
        let _ = leader.release(component).await;
    }
    tracing::info!("smelterd stopped");
    Ok(())
}

/// Stand-in executor when no workers are configured: every submit reports
/// the fleet as unavailable and the run row simply waits.
struct IdleExecutor;

#[async_trait::async_trait]
impl Executor for IdleExecutor {
    async fn submit(
        &self,
        _run: &smelter_core::types::Run,
        _pipeline: &smelter_core::types::Pipeline,
    ) -> smelter_core::ports::Result<()> {
        Err(smelter_core::SmelterError::Unavailable(
            "no workers configured".into(),
        ))
    }

    async fn cancel(&self, _run_id: uuid::Uuid) -> smelter_core::ports::Result<bool> {
        Ok(false)
    }

    async fn get_logs(
        &self,
        _run_id: uuid::Uuid,
    ) -> smelter_core::ports::Result<Vec<smelter_core::types::LogEntry>> {
        Ok(Vec::new())
    }

    async fn preview(
        &self,
        _pipeline: &smelter_core::types::Pipeline,
        _sql: &str,
    ) -> smelter_core::ports::Result<smelter_core::ports::QueryResult> {
        Err(smelter_core::SmelterError::Unavailable(
            "no workers configured".into(),
        ))
    }

    async fn validate(
        &self,
        _pipeline: &smelter_core::types::Pipeline,
    ) -> smelter_core::ports::Result<smelter_core::ports::QueryResult> {
        Err(smelter_core::SmelterError::Unavailable(
            "no workers configured".into(),
        ))
    }
}
