//! Weather producer
//!
//! Publishes a synthetic weather reading to the durable `weather_data` queue
//! every `PRODUCE_INTERVAL` seconds until interrupted.

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use weather_pipeline::prelude::*;
use weather_pipeline::init_tracing;

fn build_producer(config: &PipelineConfig) -> WeatherProducer<AmqpConnector> {
    let connector = AmqpConnector::new(config.broker.clone()).with_publisher_confirms();
    let connections =
        ConnectionManager::new(connector, ReconnectBackoff::new(&config.backoff), "producer");

    WeatherProducer::new(
        connections,
        ReadingGenerator::from_entropy(),
        config.broker.queue.clone(),
        config.producer.interval(),
    )
}

/// Publish until SIGINT/SIGTERM
async fn run(config: PipelineConfig) -> Result<()> {
    let mut producer = build_producer(&config);

    tokio::select! {
        _ = producer.run() => {}
        _ = shutdown_signal() => {}
    }

    producer.shutdown().await;
    Ok(())
}

/// Publish a single reading and exit
async fn once(config: PipelineConfig) -> Result<()> {
    let mut producer = build_producer(&config);

    let reading = producer
        .publish_reading()
        .await
        .context("Failed to publish reading")?;
    info!(station_id = reading.station_id, "Published one reading");

    producer.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = PipelineConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging)?;
    config.validate().context("Invalid configuration")?;

    info!(
        service = "weather-producer",
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.broker.endpoint(),
        queue = %config.broker.queue,
        interval_secs = config.producer.interval_secs,
        "Starting weather producer"
    );

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("run");

    match mode {
        "run" => run(config).await?,
        "once" => once(config).await?,
        _ => {
            println!("Usage: weather-producer [run|once]");
            println!();
            println!("Modes:");
            println!("  run  - Publish a reading every interval until interrupted (default)");
            println!("  once - Publish a single reading and exit");
            println!();
            println!("Environment variables:");
            println!("  RABBITMQ_HOST    - Broker host (default: rabbitmq)");
            println!("  RABBITMQ_USER    - Broker username (default: admin)");
            println!("  RABBITMQ_PASS    - Broker password (default: secret)");
            println!("  PRODUCE_INTERVAL - Seconds between readings (default: 5)");
        }
    }

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
