use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use weather_pipeline::{
    init_tracing, retry_with_backoff, AmqpConnector, ConnectionManager, ReconnectBackoff,
    TokioSleeper,
};
use weather_storage::{Config, PgReadingStore, ReadingStore, WeatherConsumer};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging)?;
    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.broker.endpoint(),
        database = %config.database.endpoint(),
        queue = %config.broker.queue,
        "Starting weather consumer"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    // The database may still be starting; keep trying with the broker backoff.
    let mut db_backoff = ReconnectBackoff::new(&config.backoff);
    let store = retry_with_backoff(&mut db_backoff, &TokioSleeper, "postgres", || {
        PgReadingStore::connect(&config.database)
    })
    .await;

    store
        .ensure_schema()
        .await
        .context("Failed to create database schema")?;

    match store.stats().await {
        Ok(stats) => info!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            "Existing rows"
        ),
        Err(e) => error!(error = %e, "Failed to read table stats"),
    }

    let connector =
        AmqpConnector::new(config.broker.clone()).with_prefetch(config.service.prefetch);
    let connections =
        ConnectionManager::new(connector, ReconnectBackoff::new(&config.backoff), "consumer");
    let mut consumer = WeatherConsumer::new(connections, config.broker.queue.clone(), store);

    // Spawn consumer task
    let consumer_handle = tokio::spawn(async move {
        consumer.run().await;
    });

    info!("Weather consumer started");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down weather consumer");

    // Unsettled deliveries go back to the queue when the connection drops.
    consumer_handle.abort();

    info!("Weather consumer stopped");

    Ok(())
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
