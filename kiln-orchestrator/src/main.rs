use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_orchestrator::api::{self, AppState};
use kiln_orchestrator::config::Config;
use kiln_orchestrator::db;
use kiln_orchestrator::service::controller::RunServices;
use kiln_orchestrator::service::release::{CommandTransport, ReleaseExecutor};
use kiln_orchestrator::service::scheduler::{self, CronScheduler};
use kiln_orchestrator::service::source::GitFetcher;
use kiln_orchestrator::service::{Engine, HistoryStore, LogSink};
use kiln_orchestrator::storage::DataLayout;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Kiln Orchestrator...");

    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;

    tracing::info!("Data directory: {}", config.data_dir.display());
    let layout = DataLayout::new(&config.data_dir);
    layout
        .ensure()
        .await
        .context("Failed to create data directories")?;

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let history = HistoryStore::new(pool, layout.clone());
    let services = RunServices {
        config: config.clone(),
        history: history.clone(),
        logs: Arc::new(LogSink::new(layout)),
        fetcher: Arc::new(GitFetcher::new()),
        releaser: ReleaseExecutor::new(Arc::new(CommandTransport::new())),
    };
    let engine = Engine::new(services);

    // Nothing survived the previous process, so nothing may stay in flight
    let recovered = engine
        .recover()
        .await
        .context("Failed to recover interrupted runs")?;
    if recovered > 0 {
        tracing::warn!("Marked {} interrupted run(s) as failed", recovered);
    }

    let state = AppState::new(engine);

    let cron = CronScheduler::new(state.dispatcher.clone(), config.scheduler_interval);
    tokio::spawn(cron.run());
    tokio::spawn(scheduler::run_retention(history, config.retention_interval));

    // Build router with all API endpoints
    let app = api::create_router(state);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
