use anyhow::{Context, Result};
use dealer_photo::api::{start_api_server, AppState};
use dealer_photo::config::{Config, RecordBackend};
use dealer_photo::dealers::{self, DealerDirectory, SystemClock};
use dealer_photo::local_processor;
use dealer_photo::object_store::{ObjectStore, S3ObjectStore};
use dealer_photo::record_store::{MemoryRecordStore, PgRecordStore, RecordStore};
use dealer_photo::remover::{self, RemovalOptions};
use dealer_photo::workflow::poller::PollPolicy;
use dealer_photo::workflow::{Collaborators, WorkflowRegistry};
use dealer_photo::ImageCatalog;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Dealer Photo Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let records: Arc<dyn RecordStore> = match config.database.backend {
        RecordBackend::Postgres => {
            let store = PgRecordStore::new(&config.database)
                .await
                .context("Failed to initialize record store")?;

            // Run migrations if enabled
            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Arc::new(store)
        }
        RecordBackend::Memory => {
            warn!("Using in-memory record store, records are lost on restart");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let storage: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.s3).await);

    let source = dealers::source_from_location(
        &config.dealers.source,
        Duration::from_secs(config.dealers.request_timeout_secs),
    )
    .context("Failed to initialize dealer registry source")?;
    let dealer_directory = Arc::new(DealerDirectory::new(
        source,
        Arc::new(SystemClock),
        config.dealer_cache_ttl(),
    ));

    let remover = remover::from_config(&config.remover)
        .context("Failed to initialize background removal client")?;

    let collaborators = Arc::new(Collaborators {
        dealers: dealer_directory.clone(),
        storage: storage.clone(),
        remover,
        records: records.clone(),
        local: local_processor::from_config(&config.local_processor),
        poll_policy: PollPolicy::from(&config.polling),
        removal_options: RemovalOptions {
            background: config.remover.background.clone(),
        },
    });

    let workflows = Arc::new(WorkflowRegistry::new(collaborators));
    let sweeper_handle = workflows.spawn_sweeper(&config.sessions);

    // Create API state
    let api_state = AppState {
        workflows,
        dealers: dealer_directory,
        catalog: Arc::new(ImageCatalog::new(records.clone(), storage)),
        records,
        max_image_bytes: config.upload.max_image_bytes,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Dealer photo service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down dealer photo service");

    api_handle.abort();
    sweeper_handle.abort();

    info!("Dealer photo service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

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
            error!(error = %e, "Failed to install Ctrl+C handler");
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
