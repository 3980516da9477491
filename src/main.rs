use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use wealthgrid::{
    api, config::Config, db::init_db, spawn_sweep, Clock, Orchestrator, Repository, SystemClock,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("configuration error")?;
    let port = config.port;
    let sweep_interval = config.sweep_interval_secs;

    let pools = init_db(&config.database_path)
        .await
        .with_context(|| format!("failed to initialize database at {}", config.database_path))?;

    let repo = Arc::new(Repository::new(pools));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = Arc::new(Orchestrator::new(repo, config, clock.clone()));

    // Catch up on work a previous run left unprocessed before serving.
    match orchestrator.run_sweep(clock.now()).await {
        Ok(report) => tracing::info!(?report, "startup sweep finished"),
        Err(e) => tracing::warn!(error = %e, "startup sweep failed"),
    }
    let _sweep = spawn_sweep(orchestrator.clone(), clock, sweep_interval);

    let app = api::create_router(api::AppState::new(orchestrator));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
