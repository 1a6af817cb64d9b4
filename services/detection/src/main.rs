use anyhow::{Context, Result};
use fire_detection::config::Config;
use fire_detection::inference::{DetectionEngine, EngineLoader, InferenceAdapter, YoloEngine};
use fire_detection::{
    start_api_server, AppState, ArtifactStore, DetectionPipeline, LogStore, StagingStore,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Fire Detection Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let log_store = Arc::new(
        LogStore::new(&config.database)
            .await
            .context("Failed to initialize detection log store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        log_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let model = config.model.clone();
    let loader: EngineLoader = Arc::new(move || {
        let engine = YoloEngine::load(&model)?;
        Ok(Arc::new(engine) as Arc<dyn DetectionEngine>)
    });
    let inference = InferenceAdapter::new(loader, config.inference_timeout());

    if config.model.preload {
        inference
            .engine()
            .await
            .context("Failed to load detection model")?;
    }

    let pipeline = Arc::new(DetectionPipeline::new(
        StagingStore::new(&config.storage.staging_dir),
        inference,
        ArtifactStore::new(&config.storage.artifact_dir),
        log_store.clone(),
        config.detection.timezone()?,
    ));

    // Create API state
    let api_state = AppState {
        pipeline,
        log_store: log_store.clone(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Detection service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down detection service");

    api_handle.abort();
    log_store.pool().close().await;

    info!("Detection service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
