use std::sync::Arc;

use docpipe_api::app::{build_app, AppServices};
use docpipe_infra::{config::AppConfig, pipeline::Orchestrator, workers::WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    docpipe_observability::init();

    let config = AppConfig::from_env()?;
    let services = Arc::new(AppServices::from_config(&config).await?);
    services.recover_unfinished().await?;

    let orchestrator = Arc::new(Orchestrator::new(
        services.store(),
        services.registry(),
        config.pipeline.clone(),
    ));
    let pool = WorkerPool::new(
        services.store(),
        services.queue(),
        orchestrator,
        config.workers.clone(),
    )
    .spawn();

    let app = build_app(services);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stats = pool.shutdown().await;
    tracing::info!(
        jobs_processed = stats.jobs_processed,
        jobs_abandoned = stats.jobs_abandoned,
        "shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
