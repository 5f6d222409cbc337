use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wayfarer::config::AppConfig;
use wayfarer::database::repositories::{SqlxItineraryRepository, SqlxJobRepository};
use wayfarer::database;
use wayfarer::generation::OpenAiGenerator;
use wayfarer::logging::init_logging;
use wayfarer::render::CommandPdfRenderer;
use wayfarer::service::ProcessingService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;

    let (logging, _guard) =
        init_logging(&config.log_dir, config.log_json).context("initializing logging")?;
    let shutdown = CancellationToken::new();
    let log_cleanup = logging.start_retention_cleanup(shutdown.clone());

    info!(version = env!("CARGO_PKG_VERSION"), "Starting wayfarer");

    let pool = database::init_pool(&config.database_url, config.db_pool_size)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    database::run_migrations(&pool)
        .await
        .context("running migrations")?;

    if config.generator.api_key.is_none() {
        warn!("No API key configured for the content generator");
    }

    let store = Arc::new(SqlxItineraryRepository::new(pool.clone()));
    let jobs = Arc::new(SqlxJobRepository::new(pool.clone()));
    let generator = Arc::new(OpenAiGenerator::new(config.generator.clone())?);
    let renderer = Arc::new(CommandPdfRenderer::new(config.renderer.clone()));

    let service = ProcessingService::new(&config, store, jobs, generator, renderer);

    let health = service.queue().health_check().await;
    if health.is_healthy() {
        info!("Job queue is healthy");
    } else {
        warn!(?health, "Job queue is unhealthy; submissions will run directly");
    }

    service.start();
    info!("wayfarer is running; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutdown requested");
    service.stop().await;
    shutdown.cancel();
    let _ = log_cleanup.await;
    pool.close().await;

    info!("wayfarer stopped");
    Ok(())
}
