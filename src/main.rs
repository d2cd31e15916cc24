use annotation_jobs::config::Config;
use annotation_jobs::consumer::{JobDispatcher, JobStreamConsumer};
use annotation_jobs::export_pipeline::ExportPipeline;
use annotation_jobs::handler::{
    HandlerRegistry, HttpInferenceClient, ModelMessageHandler, PointCloudDetectionHandler,
};
use annotation_jobs::message::ModelCode;
use annotation_jobs::metadata_store::PgMetadataStore;
use annotation_jobs::object_store::{ObjectStore, S3ObjectStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting annotation jobs service");

    init_metrics(config.service.metrics_port)?;

    let metadata_store = Arc::new(
        PgMetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let object_store = S3ObjectStore::new(&config.s3)
        .await
        .context("Failed to initialize object store")?;
    object_store
        .ensure_bucket()
        .await
        .context("Failed to ensure bucket")?;
    let object_store: Arc<dyn ObjectStore> = Arc::new(object_store);

    let export_pipeline = ExportPipeline::from_config(
        &config.export,
        &config.url_rewrite,
        metadata_store.clone(),
        metadata_store.clone(),
        object_store,
    )
    .context("Failed to initialize export pipeline")?;

    // No run is active yet, so anything left in the staging root is from a previous process
    if let Err(e) = export_pipeline.purge_stale_staging().await {
        error!(error = %e, "Failed to purge stale staging areas");
    }

    info!(
        temp_path = %config.export.temp_path.display(),
        fetch_concurrency = config.export.fetch_concurrency,
        archive_format = ?config.export.archive_format,
        "Export pipeline ready"
    );

    let inference = Arc::new(
        HttpInferenceClient::new(&config.inference.endpoint, config.inference_timeout())
            .context("Failed to initialize inference client")?,
    );

    // Point cloud models share the detection handler
    let handlers = [ModelCode::PreLabel, ModelCode::LidarDetection].map(|code| {
        Arc::new(PointCloudDetectionHandler::new(
            code,
            inference.clone(),
            metadata_store.clone(),
            metadata_store.clone(),
        )) as Arc<dyn ModelMessageHandler>
    });
    let registry = Arc::new(HandlerRegistry::new(handlers));

    let consumer = JobStreamConsumer::new(&config.kafka, JobDispatcher::new(registry))
        .context("Failed to initialize Kafka consumer")?;

    let cancel = CancellationToken::new();
    let consumer_cancel = cancel.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run(consumer_cancel).await {
            error!(error = %e, "Job stream consumer error");
        }
    });

    info!("Annotation jobs service started successfully");

    shutdown_signal().await;

    info!("Shutting down annotation jobs service");

    cancel.cancel();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Consumer task did not shut down cleanly");
    }

    info!("Annotation jobs service stopped");

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
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
