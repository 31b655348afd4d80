//! Synthetic weather reading producer.
//!
//! Every tick publishes one freshly generated reading as a persistent JSON
//! message. A reading whose publish fails is dropped; the next tick produces
//! a new one once the connection has been re-established.

use crate::backoff::{Sleeper, TokioSleeper};
use crate::connection::{BrokerError, ConnectionManager, Connector, Publish};
use crate::reading::{Reading, ReadingGenerator};
use rand::rngs::StdRng;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Publishes generated readings at a fixed interval
pub struct WeatherProducer<C, S = TokioSleeper, R = StdRng>
where
    C: Connector,
    S: Sleeper,
{
    connections: ConnectionManager<C, S>,
    generator: ReadingGenerator<R>,
    queue: String,
    interval: Duration,
}

impl<C, S, R> WeatherProducer<C, S, R>
where
    C: Connector,
    C::Session: Publish,
    S: Sleeper,
    R: Rng + Send,
{
    pub fn new(
        connections: ConnectionManager<C, S>,
        generator: ReadingGenerator<R>,
        queue: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            connections,
            generator,
            queue: queue.into(),
            interval,
        }
    }

    /// Generate and publish a single reading
    #[instrument(skip(self), fields(queue = %self.queue))]
    pub async fn publish_reading(&mut self) -> Result<Reading, BrokerError> {
        let reading = self.generator.next_reading();
        let payload = reading
            .to_json()
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let session = self.connections.ensure_connected().await?;
        session.publish(&self.queue, &payload).await?;

        info!(
            station_id = reading.station_id,
            temperature = reading.temperature,
            humidity = reading.humidity,
            wind_speed = reading.wind_speed,
            "Published reading"
        );

        Ok(reading)
    }

    /// Publish forever, one reading per interval
    pub async fn run(&mut self) {
        info!(queue = %self.queue, interval_secs = self.interval.as_secs_f64(), "Starting producer");

        loop {
            self.tick().await;
        }
    }

    /// One iteration of the run loop.
    ///
    /// Sleeps the interval after a successful publish, or the reconnect
    /// backoff after a failure.
    pub async fn tick(&mut self) -> Option<Reading> {
        match self.publish_reading().await {
            Ok(reading) => {
                self.connections.sleeper().sleep(self.interval).await;
                Some(reading)
            }
            Err(e) => {
                debug!(error = %e, "Dropping reading after failed publish");
                self.connections.recover(&e).await;
                None
            }
        }
    }

    /// Close the broker connection
    pub async fn shutdown(&mut self) {
        info!("Shutting down producer");
        self.connections.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectBackoff;
    use crate::test_support::{FakeConnector, RecordingSleeper};
    use rand::SeedableRng;

    fn producer(connector: FakeConnector) -> WeatherProducer<FakeConnector, RecordingSleeper> {
        let connections = ConnectionManager::with_sleeper(
            connector,
            RecordingSleeper::default(),
            ReconnectBackoff::default(),
            "producer",
        );
        WeatherProducer::new(
            connections,
            ReadingGenerator::new(StdRng::seed_from_u64(1)),
            "weather_data",
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_publishes_json_to_queue() {
        let connector = FakeConnector::default();
        let mut producer = producer(connector.clone());

        let reading = producer.tick().await.unwrap();

        let published = connector.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "weather_data");
        let decoded: Reading = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(decoded, reading);
    }

    #[tokio::test]
    async fn test_sleeps_interval_between_ticks() {
        let connector = FakeConnector::default();
        let mut producer = producer(connector.clone());

        producer.tick().await;
        producer.tick().await;

        assert_eq!(connector.published().len(), 2);
        assert_eq!(connector.connect_calls(), 1);
        assert_eq!(
            producer.connections.sleeper().recorded(),
            vec![Duration::from_secs(5), Duration::from_secs(5)]
        );
    }

    #[tokio::test]
    async fn test_failed_publish_is_dropped_not_retried() {
        let connector = FakeConnector::default();
        let mut producer = producer(connector.clone());

        connector.fail_publishes(1);
        assert!(producer.tick().await.is_none());
        let second = producer.tick().await.unwrap();

        // Only the fresh reading made it; the failed one was not replayed.
        let published = connector.published();
        assert_eq!(published.len(), 1);
        let decoded: Reading = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(decoded, second);

        // Backoff after the failure, interval after the success.
        assert_eq!(
            producer.connections.sleeper().recorded(),
            vec![Duration::from_secs(1), Duration::from_secs(5)]
        );
        assert_eq!(connector.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_connect_failures_back_off() {
        let connector = FakeConnector::failing(3);
        let mut producer = producer(connector.clone());

        for _ in 0..3 {
            assert!(producer.tick().await.is_none());
        }
        assert!(producer.tick().await.is_some());

        assert_eq!(
            producer.connections.sleeper().recorded(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
            ]
        );
    }
}
