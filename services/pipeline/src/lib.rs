//! Weather Pipeline - RabbitMQ plumbing for the weather telemetry pipeline
//!
//! This library holds everything the producer and consumer processes share:
//!
//! - Layered configuration with the deployment's flat environment variables
//! - A capped exponential [`backoff`] without jitter and an injectable clock
//! - A [`connection`] manager that owns one broker session per process
//! - The [`reading`] wire model and the synthetic [`producer`]
//!
//! # Example
//!
//! ```rust,no_run
//! use weather_pipeline::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let connector = AmqpConnector::new(config.broker.clone());
//!     let connections =
//!         ConnectionManager::new(connector, ReconnectBackoff::new(&config.backoff), "producer");
//!
//!     let mut producer = WeatherProducer::new(
//!         connections,
//!         ReadingGenerator::from_entropy(),
//!         config.broker.queue.clone(),
//!         config.producer.interval(),
//!     );
//!     producer.run().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod logging;
pub mod producer;
pub mod reading;

#[cfg(test)]
pub(crate) mod test_support;

pub use backoff::{retry_with_backoff, ReconnectBackoff, Sleeper, TokioSleeper};
pub use config::{
    layered_sources, BackoffConfig, BrokerConfig, ConfigError, LoggingConfig, PipelineConfig,
    ProducerConfig,
};
pub use connection::{
    publish_properties, AmqpConnector, AmqpSession, BrokerError, ConnectionManager, Connector,
    Consume, InboundDelivery, Publish, Session, JSON_CONTENT_TYPE, PERSISTENT_DELIVERY_MODE,
};
pub use logging::init_tracing;
pub use producer::WeatherProducer;
pub use reading::{Reading, ReadingGenerator};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backoff::{ReconnectBackoff, Sleeper, TokioSleeper};
    pub use crate::config::PipelineConfig;
    pub use crate::connection::{AmqpConnector, BrokerError, ConnectionManager};
    pub use crate::producer::WeatherProducer;
    pub use crate::reading::{Reading, ReadingGenerator};
}
