//! Broker connection management.
//!
//! A [`ConnectionManager`] owns at most one live session (connection plus
//! channel) and recreates it on demand. Failures are handed back to the
//! caller's loop, which calls [`ConnectionManager::recover`] to tear the
//! session down and wait out the backoff before the next attempt.

use crate::backoff::{ReconnectBackoff, Sleeper, TokioSleeper};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use lapin::acker::Acker;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Content type of every published reading
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors talking to the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Failed to open channel: {0}")]
    Channel(String),

    #[error("Failed to declare queue {queue}: {message}")]
    Topology { queue: String, message: String },

    #[error("Failed to publish to queue {queue}: {message}")]
    Publish { queue: String, message: String },

    #[error("Failed to consume from queue {queue}: {message}")]
    Consume { queue: String, message: String },

    #[error("Failed to settle delivery: {0}")]
    Acknowledge(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(String),

    #[error("Broker connection closed: {0}")]
    Closed(String),
}

/// An open connection to the broker
#[async_trait]
pub trait Session: Send + Sync {
    /// Whether the session can still be used
    fn is_open(&self) -> bool;

    /// Close the session, ignoring errors from an already-dead connection
    async fn close(&self);
}

/// Sessions that can publish to a queue
#[async_trait]
pub trait Publish: Session {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

/// One message taken off a queue, with the handle that settles it
#[derive(Debug)]
pub struct InboundDelivery<A> {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub acker: A,
}

/// Sessions that can consume from their queue
#[async_trait]
pub trait Consume: Session {
    type Acker: Send + 'static;
    type Deliveries: Stream<Item = Result<InboundDelivery<Self::Acker>, BrokerError>>
        + Send
        + Unpin;

    /// Start a consumer with manual acknowledgement
    async fn consume(&self, consumer_tag: &str) -> Result<Self::Deliveries, BrokerError>;
}

/// Properties of every published reading: persistent JSON
pub fn publish_properties() -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
}

/// Opens new sessions
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    async fn connect(&self) -> Result<Self::Session, BrokerError>;
}

/// Connection and channel to RabbitMQ with the weather queue declared
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    queue: String,
}

impl AmqpSession {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl Session for AmqpSession {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) {
        if !self.connection.status().connected() {
            return;
        }
        if let Err(e) = self.connection.close(200, "closing").await {
            debug!(error = %e, "Error while closing broker connection");
        }
    }
}

#[async_trait]
impl Publish for AmqpSession {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let publish_error = |e: lapin::Error| BrokerError::Publish {
            queue: queue.to_string(),
            message: e.to_string(),
        };

        // Resolves immediately with `NotRequested` unless confirms are enabled.
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                publish_properties(),
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(BrokerError::Publish {
                queue: queue.to_string(),
                message: "broker refused the message".to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Consume for AmqpSession {
    type Acker = Acker;
    type Deliveries = BoxStream<'static, Result<InboundDelivery<Acker>, BrokerError>>;

    async fn consume(&self, consumer_tag: &str) -> Result<Self::Deliveries, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: self.queue.clone(),
                message: e.to_string(),
            })?;

        let queue = self.queue.clone();
        let deliveries = consumer.map(move |delivery| {
            delivery
                .map(|d| InboundDelivery {
                    delivery_tag: d.delivery_tag,
                    redelivered: d.redelivered,
                    data: d.data,
                    acker: d.acker,
                })
                .map_err(|e| BrokerError::Consume {
                    queue: queue.clone(),
                    message: e.to_string(),
                })
        });

        Ok(deliveries.boxed())
    }
}

/// Connects to RabbitMQ and declares the durable weather queue
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
    prefetch: Option<u16>,
    publisher_confirms: bool,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            prefetch: None,
            publisher_confirms: false,
        }
    }

    /// Limit unacknowledged deliveries per consumer
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Wait for the broker to confirm each publish
    pub fn with_publisher_confirms(mut self) -> Self {
        self.publisher_confirms = true;
        self
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.prefetch
    }

    pub fn publisher_confirms(&self) -> bool {
        self.publisher_confirms
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    async fn open_channel(&self, connection: &Connection) -> Result<Channel, BrokerError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        let topology_error = |e: lapin::Error| BrokerError::Topology {
            queue: self.config.queue.clone(),
            message: e.to_string(),
        };

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(topology_error)?;

        if let Some(prefetch) = self.prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))?;
        }

        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))?;
        }

        Ok(channel)
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self) -> Result<AmqpSession, BrokerError> {
        debug!(endpoint = %self.config.endpoint(), "Connecting to RabbitMQ");

        let connection =
            Connection::connect_uri(self.config.amqp_uri(), ConnectionProperties::default())
                .await
                .map_err(|e| BrokerError::Connect(e.to_string()))?;

        match self.open_channel(&connection).await {
            Ok(channel) => Ok(AmqpSession {
                connection,
                channel,
                queue: self.config.queue.clone(),
            }),
            Err(e) => {
                // Don't leak the half-open connection.
                if let Err(close_err) = connection.close(200, "setup failed").await {
                    debug!(error = %close_err, "Error while closing partial connection");
                }
                Err(e)
            }
        }
    }
}

/// Owns the broker session for one process and recreates it on failure
pub struct ConnectionManager<C: Connector, S: Sleeper = TokioSleeper> {
    connector: C,
    sleeper: S,
    backoff: ReconnectBackoff,
    session: Option<C::Session>,
    role: &'static str,
}

impl<C: Connector> ConnectionManager<C, TokioSleeper> {
    pub fn new(connector: C, backoff: ReconnectBackoff, role: &'static str) -> Self {
        Self::with_sleeper(connector, TokioSleeper, backoff, role)
    }
}

impl<C: Connector, S: Sleeper> ConnectionManager<C, S> {
    pub fn with_sleeper(
        connector: C,
        sleeper: S,
        backoff: ReconnectBackoff,
        role: &'static str,
    ) -> Self {
        Self {
            connector,
            sleeper,
            backoff,
            session: None,
            role,
        }
    }

    /// Return the live session, connecting first if there is none.
    ///
    /// Resets the backoff whenever a new session is established.
    pub async fn ensure_connected(&mut self) -> Result<&C::Session, BrokerError> {
        let live = self.session.as_ref().is_some_and(|s| s.is_open());

        if !live {
            if let Some(stale) = self.session.take() {
                stale.close().await;
            }

            let session = self.connector.connect().await?;
            info!(role = self.role, "Connected to RabbitMQ");
            self.backoff.reset();
            self.session = Some(session);
        }

        self.session
            .as_ref()
            .ok_or_else(|| BrokerError::Closed("no session".to_string()))
    }

    /// Tear down the session after `error` and wait out the backoff.
    ///
    /// Returns the delay that was slept.
    pub async fn recover(&mut self, error: &BrokerError) -> Duration {
        if let Some(session) = self.session.take() {
            session.close().await;
            info!(role = self.role, "Disconnected from RabbitMQ");
        }

        let delay = self.backoff.next_delay();
        warn!(
            role = self.role,
            error = %error,
            attempt = self.backoff.attempts(),
            delay_secs = delay.as_secs_f64(),
            "Broker error, reconnecting after backoff"
        );
        self.sleeper.sleep(delay).await;
        delay
    }

    /// Close the current session, if any
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_open())
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    pub fn backoff(&self) -> &ReconnectBackoff {
        &self.backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeConnector, RecordingSleeper};

    fn manager(connector: FakeConnector) -> ConnectionManager<FakeConnector, RecordingSleeper> {
        ConnectionManager::with_sleeper(
            connector,
            RecordingSleeper::default(),
            ReconnectBackoff::default(),
            "test",
        )
    }

    #[test]
    fn test_publish_properties_are_persistent_json() {
        let properties = publish_properties();

        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(
            properties.content_type(),
            &Some(ShortString::from("application/json"))
        );
    }

    #[test]
    fn test_connector_options() {
        let connector = AmqpConnector::new(BrokerConfig::default());
        assert_eq!(connector.prefetch(), None);
        assert!(!connector.publisher_confirms());

        let connector = connector.with_prefetch(1).with_publisher_confirms();
        assert_eq!(connector.prefetch(), Some(1));
        assert!(connector.publisher_confirms());
    }

    #[tokio::test]
    async fn test_ensure_connected_is_idempotent() {
        let connector = FakeConnector::default();
        let mut manager = manager(connector.clone());

        manager.ensure_connected().await.unwrap();
        manager.ensure_connected().await.unwrap();

        assert_eq!(connector.connect_calls(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_reconnects_after_session_dies() {
        let connector = FakeConnector::default();
        let mut manager = manager(connector.clone());

        manager.ensure_connected().await.unwrap();
        connector.kill_sessions();
        assert!(!manager.is_connected());

        manager.ensure_connected().await.unwrap();
        assert_eq!(connector.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_backoff_grows_and_resets_after_success() {
        let connector = FakeConnector::failing(6);
        let mut manager = manager(connector.clone());

        for _ in 0..6 {
            let err = manager.ensure_connected().await.err().unwrap();
            manager.recover(&err).await;
        }
        manager.ensure_connected().await.unwrap();
        assert_eq!(manager.backoff().attempts(), 0);

        // A later failure starts again from the floor.
        connector.kill_sessions();
        manager
            .recover(&BrokerError::Closed("heartbeat missed".to_string()))
            .await;

        let slept: Vec<u64> = manager
            .sleeper()
            .recorded()
            .iter()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(slept, vec![1, 2, 4, 8, 16, 30, 1]);
    }

    #[tokio::test]
    async fn test_recover_closes_session() {
        let connector = FakeConnector::default();
        let mut manager = manager(connector.clone());

        manager.ensure_connected().await.unwrap();
        manager
            .recover(&BrokerError::Closed("channel closed".to_string()))
            .await;

        assert!(!manager.is_connected());
        assert_eq!(connector.close_calls(), 1);
    }
}
