use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use loyalty_core::{
    AccrualClient, HttpAccrualSource, LedgerUpdater, LoyaltyService, Metrics,
    ReconciliationQueue, RecoveryScanner, WorkerPool,
};
use loyalty_engine::{auth::JwtKeys, config::Config, database::PgStore, handlers};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize tracing
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .json()
        .init();

    info!("Starting Loyalty Engine...");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    info!("Configuration loaded successfully");

    // Initialize database
    let store = Arc::new(
        PgStore::connect(&config.database)
            .await
            .context("Failed to connect to database")?,
    );
    store.migrate().await?;

    info!("Database connected successfully");

    let metrics = Metrics::new()?;
    let shutdown = CancellationToken::new();
    let endpoint = config.accrual.endpoint.clone();

    // Reconciliation pipeline
    let queue = ReconciliationQueue::new(
        config.pipeline.queue_capacity,
        config.pipeline.backpressure,
        shutdown.clone(),
        metrics.clone(),
    );
    let client = AccrualClient::new(
        Arc::new(HttpAccrualSource::new()?),
        config.pipeline.backoff.clone(),
        config.pipeline.request_timeout(),
        metrics.clone(),
    );
    let ledger = LedgerUpdater::new(store.clone(), metrics.clone());
    let pool = WorkerPool::spawn(
        &config.pipeline,
        queue.clone(),
        client,
        ledger.clone(),
        metrics.clone(),
        shutdown.clone(),
    );

    // Orders left non-terminal by the previous run
    let scanner = RecoveryScanner::new(store.clone(), queue.clone(), endpoint.clone());
    tokio::spawn(async move {
        if let Err(e) = scanner.run().await {
            error!(error = %e, "Recovery scan failed");
        }
    });

    let service = Arc::new(LoyaltyService::new(store, ledger, queue, endpoint));

    info!("Loyalty service initialized successfully");

    // Start HTTP server
    let service_data = web::Data::new(service);
    let metrics_data = web::Data::new(metrics);
    let keys_data = web::Data::new(JwtKeys::new(&config.auth.jwt_secret));

    info!("Starting HTTP server on {}", config.server.address);

    HttpServer::new(move || {
        App::new()
            .app_data(service_data.clone())
            .app_data(metrics_data.clone())
            .app_data(keys_data.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .bind(config.server.address.as_str())?
    .run()
    .await?;

    info!("HTTP server stopped, draining workers");
    shutdown.cancel();
    pool.shutdown().await;

    Ok(())
}
