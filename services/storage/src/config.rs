use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::time::Duration;
use weather_pipeline::{
    layered_sources, BackoffConfig, BrokerConfig, ConfigError, LoggingConfig,
};

/// Main configuration for the consumer service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// RabbitMQ configuration
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Reconnect backoff for both the broker and the database
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Expose Prometheus metrics
    #[serde(default)]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Unacknowledged deliveries this consumer may hold
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    /// Database name
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_db_user")]
    pub username: String,
    #[serde(default = "default_db_password")]
    pub password: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "weather-consumer".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_prefetch() -> u16 {
    1
}

fn default_db_host() -> String {
    "postgres".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "weatherdb".to_string()
}

fn default_db_user() -> String {
    "weather".to_string()
}

fn default_db_password() -> String {
    "weatherpass".to_string()
}

fn default_max_connections() -> u32 {
    1 // one connection owned by the process
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
            prefetch: default_prefetch(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            name: default_db_name(),
            username: default_db_user(),
            password: default_db_password(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl DatabaseConfig {
    /// Apply the flat `POSTGRES_*` variables through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("POSTGRES_HOST") {
            self.host = host;
        }
        if let Some(db) = lookup("POSTGRES_DB") {
            self.name = db;
        }
        if let Some(user) = lookup("POSTGRES_USER") {
            self.username = user;
        }
        if let Some(password) = lookup("POSTGRES_PASSWORD") {
            self.password = password;
        }
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.username)
            .password(&self.password)
            .application_name("weather-consumer")
    }

    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Database location without credentials, safe for logs
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.name)
    }
}

impl Config {
    /// Load configuration from config files and the environment.
    ///
    /// `WEATHER__DATABASE__PORT` style variables override files, and the
    /// deployment's `RABBITMQ_*` / `POSTGRES_*` variables override both.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config: Self = layered_sources("config/storage")?.try_deserialize()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.broker.apply_overrides(&lookup);
        self.database.apply_overrides(&lookup);
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.backoff.validate()?;

        if self.database.host.is_empty() {
            return Err(ConfigError::MissingRequired("database.host".to_string()));
        }
        if self.database.name.is_empty() {
            return Err(ConfigError::MissingRequired("database.name".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "database.max_connections".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.service.prefetch == 0 {
            return Err(ConfigError::InvalidValue {
                key: "service.prefetch".to_string(),
                message: "0 means unlimited; use at least 1".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.database.endpoint(), "postgres:5432/weatherdb");
        assert_eq!(config.database.username, "weather");
        assert_eq!(config.database.max_connections, 1);
        assert_eq!(config.service.prefetch, 1);
        assert_eq!(config.broker.queue, "weather_data");
        assert!(!config.service.metrics_enabled);
        assert_ok!(config.validate());
    }

    #[test]
    fn test_flat_overrides() {
        let vars: HashMap<&str, &str> = [
            ("POSTGRES_HOST", "db.internal"),
            ("POSTGRES_DB", "telemetry"),
            ("POSTGRES_USER", "ingest"),
            ("POSTGRES_PASSWORD", "s3cret"),
            ("RABBITMQ_HOST", "mq.internal"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.name, "telemetry");
        assert_eq!(config.database.username, "ingest");
        assert_eq!(config.database.password, "s3cret");
        assert_eq!(config.broker.host, "mq.internal");
        assert!(!config.database.endpoint().contains("s3cret"));
    }

    #[test]
    fn test_validate_rejects_empty_database() {
        let mut config = Config::default();
        config.database.name.clear();
        assert_err!(config.validate());

        let mut config = Config::default();
        config.database.max_connections = 0;
        assert_err!(config.validate());
    }

    #[test]
    fn test_zero_prefetch_is_rejected() {
        let mut config = Config::default();
        config.service.prefetch = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
