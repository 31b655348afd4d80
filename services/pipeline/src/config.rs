//! Configuration for the weather pipeline.
//!
//! Settings are layered: serde defaults, then optional config files, then
//! `WEATHER__*` environment variables, and finally the flat variables the
//! deployment has always used (`RABBITMQ_HOST`, `PRODUCE_INTERVAL`, ...).

use config::{Config, Environment, File};
use lapin::uri::AMQPUri;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

/// RabbitMQ connection and topology settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_broker_user")]
    pub username: String,
    #[serde(default = "default_broker_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Durable queue carrying weather readings
    #[serde(default = "default_queue")]
    pub queue: String,
    /// AMQP heartbeat in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u16,
}

fn default_broker_host() -> String {
    "rabbitmq".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_user() -> String {
    "admin".to_string()
}

fn default_broker_password() -> String {
    "secret".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_queue() -> String {
    "weather_data".to_string()
}

fn default_heartbeat_secs() -> u16 {
    60
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: default_broker_user(),
            password: default_broker_password(),
            vhost: default_vhost(),
            queue: default_queue(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl BrokerConfig {
    /// Apply the flat `RABBITMQ_*` variables through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("RABBITMQ_HOST") {
            self.host = host;
        }
        if let Some(user) = lookup("RABBITMQ_USER") {
            self.username = user;
        }
        if let Some(pass) = lookup("RABBITMQ_PASS") {
            self.password = pass;
        }
    }

    /// Build the AMQP URI for this broker.
    ///
    /// The URI is assembled field by field so credentials never need
    /// percent-encoding.
    pub fn amqp_uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = self.host.clone();
        uri.authority.port = self.port;
        uri.authority.userinfo.username = self.username.clone();
        uri.authority.userinfo.password = self.password.clone();
        uri.vhost = self.vhost.clone();
        uri.query.heartbeat = Some(self.heartbeat_secs);
        uri
    }

    /// Broker location without credentials, safe for logs
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingRequired("broker.host".to_string()));
        }
        if self.queue.is_empty() {
            return Err(ConfigError::MissingRequired("broker.queue".to_string()));
        }
        Ok(())
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Floor: first delay and the value restored after a successful connect
    #[serde(default = "default_initial_secs")]
    pub initial_secs: u64,
    /// Ceiling for any single delay
    #[serde(default = "default_max_secs")]
    pub max_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_secs() -> u64 {
    1
}

fn default_max_secs() -> u64 {
    30
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: default_initial_secs(),
            max_secs: default_max_secs(),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs(self.initial_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "backoff.initial_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.max_secs < self.initial_secs {
            return Err(ConfigError::InvalidValue {
                key: "backoff.max_secs".to_string(),
                message: format!("must be at least initial_secs ({})", self.initial_secs),
            });
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "backoff.multiplier".to_string(),
                message: "must be a finite value >= 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Producer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Seconds between published readings
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
}

fn default_interval_secs() -> f64 {
    5.0
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl ProducerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Configuration for the producer process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from files and the environment.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/default` and `config/weather` (any format `config` knows)
    /// 2. `WEATHER__SECTION__KEY` variables
    /// 3. `RABBITMQ_HOST`, `RABBITMQ_USER`, `RABBITMQ_PASS`, `PRODUCE_INTERVAL`
    pub fn load() -> Result<Self, ConfigError> {
        let mut config: Self = layered_sources("config/weather")?.try_deserialize()?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply the flat deployment variables through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.broker.apply_overrides(&lookup);

        if let Some(raw) = lookup("PRODUCE_INTERVAL") {
            self.producer.interval_secs =
                raw.trim()
                    .parse()
                    .map_err(|e: std::num::ParseFloatError| ConfigError::InvalidValue {
                        key: "PRODUCE_INTERVAL".to_string(),
                        message: e.to_string(),
                    })?;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.backoff.validate()?;

        let interval = self.producer.interval_secs;
        if !interval.is_finite() || interval <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "producer.interval_secs".to_string(),
                message: format!("must be a positive number of seconds, got {interval}"),
            });
        }
        if Duration::try_from_secs_f64(interval).is_err() {
            return Err(ConfigError::InvalidValue {
                key: "producer.interval_secs".to_string(),
                message: format!("{interval} seconds is too large"),
            });
        }

        Ok(())
    }
}

/// Shared file + `WEATHER__` environment layering.
///
/// `service_file` is the service-specific file read after `config/default`.
pub fn layered_sources(service_file: &str) -> Result<Config, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(service_file).required(false))
        // WEATHER__BROKER__PORT -> broker.port
        .add_source(Environment::with_prefix("WEATHER").separator("__"))
        .build()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.broker.host, "rabbitmq");
        assert_eq!(config.broker.username, "admin");
        assert_eq!(config.broker.queue, "weather_data");
        assert_eq!(config.producer.interval(), Duration::from_secs(5));
        assert_eq!(config.backoff.initial_interval(), Duration::from_secs(1));
        assert_eq!(config.backoff.max_interval(), Duration::from_secs(30));
        assert_ok!(config.validate());
    }

    #[test]
    fn test_flat_overrides() {
        let mut config = PipelineConfig::default();
        let lookup = lookup_from(&[
            ("RABBITMQ_HOST", "mq.internal"),
            ("RABBITMQ_USER", "producer"),
            ("RABBITMQ_PASS", "hunter2"),
            ("PRODUCE_INTERVAL", "0.5"),
        ]);

        assert_ok!(config.apply_overrides(lookup));
        assert_eq!(config.broker.host, "mq.internal");
        assert_eq!(config.broker.username, "producer");
        assert_eq!(config.broker.password, "hunter2");
        assert_eq!(config.producer.interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_bad_interval_override() {
        let mut config = PipelineConfig::default();
        let result = config.apply_overrides(lookup_from(&[("PRODUCE_INTERVAL", "soon")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_huge_interval_is_rejected() {
        let mut config = PipelineConfig::default();
        assert_ok!(config.apply_overrides(lookup_from(&[("PRODUCE_INTERVAL", "1e20")])));

        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "producer.interval_secs"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.producer.interval_secs = 0.0;
        assert_err!(config.validate());

        let mut config = PipelineConfig::default();
        config.backoff.max_secs = 0;
        assert_err!(config.validate());

        let mut config = PipelineConfig::default();
        config.broker.queue = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_amqp_uri_and_endpoint() {
        let broker = BrokerConfig {
            password: "p@ss/word".to_string(),
            ..Default::default()
        };
        let uri = broker.amqp_uri();

        assert_eq!(uri.authority.host, "rabbitmq");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.password, "p@ss/word");
        assert_eq!(uri.query.heartbeat, Some(60));
        assert_eq!(broker.endpoint(), "rabbitmq:5672/");
        assert!(!broker.endpoint().contains("p@ss"));
    }
}
