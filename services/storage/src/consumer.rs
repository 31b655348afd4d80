//! Consumer loop: validate each delivery, persist the outcome, then settle it.
//!
//! | outcome                                  | write            | settle          |
//! |------------------------------------------|------------------|-----------------|
//! | valid, insert ok                         | `weather`        | ack             |
//! | valid, insert failed                     | `weather_errors` | nack, no requeue|
//! | invalid, rejection logged                | `weather_errors` | ack             |
//! | invalid, rejection log failed            | none             | nack, no requeue|
//!
//! Nothing is ever requeued: a failure that repeats on every redelivery would
//! otherwise spin forever on a queue without dead-lettering.

use crate::reading_store::ReadingStore;
use crate::records::{AcceptedRecord, RejectedRecord};
use crate::validation::validate;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use weather_pipeline::{
    BrokerError, ConnectionManager, Connector, Consume, InboundDelivery, Sleeper, TokioSleeper,
};

/// Terminal state of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove from the queue
    Ack,
    /// Negative acknowledgement without requeue
    Reject,
}

/// Settles one delivery. Consumed on use, so it cannot settle twice.
#[async_trait]
pub trait DeliveryAcker: Send + Sized {
    async fn ack(self) -> Result<(), BrokerError>;

    async fn reject(self) -> Result<(), BrokerError>;
}

#[async_trait]
impl DeliveryAcker for Acker {
    async fn ack(self) -> Result<(), BrokerError> {
        Acker::ack(&self, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))?;
        Ok(())
    }

    async fn reject(self) -> Result<(), BrokerError> {
        Acker::nack(
            &self,
            BasicNackOptions {
                multiple: false,
                requeue: false,
            },
        )
        .await
        .map_err(|e| BrokerError::Acknowledge(e.to_string()))?;
        Ok(())
    }
}

/// Decides and records the outcome of a single message body
pub struct DeliveryProcessor<S: ReadingStore> {
    store: S,
}

impl<S: ReadingStore> DeliveryProcessor<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate and persist `body`, returning how the delivery must be settled
    pub async fn process(&self, body: &[u8]) -> Disposition {
        match validate(body) {
            Ok(record) => self.store_accepted(&record).await,
            Err(rejected) => self.store_rejected(&rejected).await,
        }
    }

    /// Process `body` and settle the delivery exactly once
    pub async fn handle<A: DeliveryAcker>(
        &self,
        body: &[u8],
        acker: A,
    ) -> Result<Disposition, BrokerError> {
        let disposition = self.process(body).await;

        match disposition {
            Disposition::Ack => acker.ack().await?,
            Disposition::Reject => acker.reject().await?,
        }

        Ok(disposition)
    }

    async fn store_accepted(&self, record: &AcceptedRecord) -> Disposition {
        match self.store.insert_accepted(record).await {
            Ok(()) => {
                info!(
                    station_id = %record.station_id,
                    temperature = record.temperature,
                    humidity = record.humidity,
                    wind_speed = record.wind_speed,
                    "Reading accepted"
                );
                metrics::counter!("weather.readings.accepted").increment(1);
                Disposition::Ack
            }
            Err(e) => {
                error!(error = %e, station_id = %record.station_id, "Failed to store reading");
                metrics::counter!("weather.readings.store_failed").increment(1);

                let rejection = RejectedRecord::persistence_failure(record, &e);
                if let Err(secondary) = self.store.insert_rejected(&rejection).await {
                    warn!(error = %secondary, "Could not log persistence failure, ignoring");
                }

                Disposition::Reject
            }
        }
    }

    async fn store_rejected(&self, record: &RejectedRecord) -> Disposition {
        match self.store.insert_rejected(record).await {
            Ok(()) => {
                warn!(kind = %record.kind, error = %record.error, "Reading rejected");
                metrics::counter!("weather.readings.rejected", "kind" => record.kind.as_str())
                    .increment(1);
                Disposition::Ack
            }
            Err(e) => {
                error!(
                    error = %e,
                    rejection = %record.error,
                    "Failed to log rejected reading, dropping it"
                );
                metrics::counter!("weather.readings.store_failed").increment(1);
                Disposition::Reject
            }
        }
    }
}

/// Drains the weather queue one delivery at a time
pub struct WeatherConsumer<S, C, Sl = TokioSleeper>
where
    S: ReadingStore,
    C: Connector,
    Sl: Sleeper,
{
    connections: ConnectionManager<C, Sl>,
    processor: DeliveryProcessor<S>,
    queue: String,
    consumer_tag: String,
}

impl<S, C, Sl> WeatherConsumer<S, C, Sl>
where
    S: ReadingStore,
    C: Connector,
    C::Session: Consume,
    <C::Session as Consume>::Acker: DeliveryAcker,
    Sl: Sleeper,
{
    pub fn new(connections: ConnectionManager<C, Sl>, queue: impl Into<String>, store: S) -> Self {
        Self {
            connections,
            processor: DeliveryProcessor::new(store),
            queue: queue.into(),
            consumer_tag: format!("weather-consumer-{}", Uuid::new_v4()),
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn processor(&self) -> &DeliveryProcessor<S> {
        &self.processor
    }

    /// Consume forever, reconnecting with backoff after any broker failure
    pub async fn run(&mut self) {
        info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            "Starting weather consumer"
        );

        loop {
            self.run_session().await;
        }
    }

    /// One iteration of the run loop.
    ///
    /// Consumes until the session fails or its stream ends, then tears it
    /// down and sleeps the backoff. Returns the delay slept.
    pub async fn run_session(&mut self) -> Duration {
        let error = self
            .consume_session()
            .await
            .err()
            .unwrap_or_else(|| BrokerError::Closed("delivery stream ended".to_string()));

        metrics::counter!("weather.broker.reconnects").increment(1);
        self.connections.recover(&error).await
    }

    async fn consume_session(&mut self) -> Result<(), BrokerError> {
        let session = self.connections.ensure_connected().await?;
        let mut deliveries = session.consume(&self.consumer_tag).await?;

        info!(queue = %self.queue, "Waiting for deliveries");

        while let Some(delivery) = deliveries.next().await {
            let InboundDelivery {
                delivery_tag,
                redelivered,
                data,
                acker,
            } = delivery?;

            let span = info_span!("delivery", delivery_tag, redelivered);

            let disposition = self
                .processor
                .handle(&data, acker)
                .instrument(span)
                .await?;

            debug!(delivery_tag, ?disposition, "Delivery settled");
        }

        Ok(())
    }
}
