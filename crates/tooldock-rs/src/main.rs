use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::sync::{mpsc, Mutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use tooldock::{
    api,
    config::AppConfig,
    jobs::{worker_loop, JobRunnerState, RateLimiter},
    orchestrator::Orchestrator,
    runner::{NmapRunner, RunnerRegistry},
    store::{self, JobStore, SqliteJobStore},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    let pool = store::create_pool(&config.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    store::run_migrations(&pool).await?;
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(pool));

    let nmap_path = config.nmap_path.clone();
    let registry = RunnerRegistry::builder()
        .register("nmap", move || NmapRunner::new(nmap_path.clone()))
        .build();

    for category in &config.categories {
        let category = category.clone().with_default_id();
        store
            .upsert_category(&category)
            .await
            .with_context(|| format!("failed to register category {}", category.id))?;
    }

    for tool in &config.tools {
        if !registry.contains(&tool.runner) {
            warn!(tool = %tool.name, runner = %tool.runner, "no runner registered for tool");
        }
        store
            .upsert_tool(tool)
            .await
            .with_context(|| format!("failed to register tool {}", tool.name))?;
    }

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(registry),
        config.progress_settings(),
    );

    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let runner_state = Arc::new(Mutex::new(JobRunnerState::default()));
    let rate_limiter = Arc::new(Mutex::new(RateLimiter::new(config.scans_per_minute)));

    tokio::spawn(worker_loop(
        orchestrator,
        rx,
        runner_state.clone(),
        config.max_concurrent_jobs,
    ));

    let state = AppState {
        store,
        queue: tx,
        runner_state,
        config: config.clone(),
        rate_limiter,
    };

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "tooldock listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
