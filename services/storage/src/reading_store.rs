use crate::config::DatabaseConfig;
use crate::records::{AcceptedRecord, RejectedRecord};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};

const CREATE_WEATHER_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS weather (
        id SERIAL PRIMARY KEY,
        station_id INT NOT NULL,
        temperature NUMERIC NOT NULL,
        humidity NUMERIC NOT NULL,
        wind_speed NUMERIC NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
"#;

const CREATE_WEATHER_ERRORS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS weather_errors (
        id SERIAL PRIMARY KEY,
        payload JSONB,
        error TEXT,
        ts TIMESTAMPTZ DEFAULT now()
    )
"#;

/// Errors from the reading store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to connect to PostgreSQL at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to create schema: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("Failed to insert into {table}: {source}")]
    Insert {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Durable home for accepted readings and rejected payloads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Create both tables if they do not exist yet
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert one row into `weather`
    async fn insert_accepted(&self, record: &AcceptedRecord) -> Result<(), StoreError>;

    /// Insert one row into `weather_errors`
    async fn insert_rejected(&self, record: &RejectedRecord) -> Result<(), StoreError>;
}

/// Row of the `weather` table
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredReading {
    pub id: i32,
    pub station_id: i32,
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub created_at: Option<NaiveDateTime>,
}

/// Row of the `weather_errors` table
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredRejection {
    pub id: i32,
    pub payload: Option<Value>,
    pub error: Option<String>,
    pub ts: Option<DateTime<Utc>>,
}

/// Row counts of both tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromRow)]
pub struct StoreStats {
    pub accepted: i64,
    pub rejected: i64,
}

/// PostgreSQL-backed store holding a single connection
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    /// Open the connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(config.connect_options())
            .await
            .map_err(|source| StoreError::Connect {
                endpoint: config.endpoint(),
                source,
            })?;

        info!(endpoint = %config.endpoint(), "Connected to PostgreSQL");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let stats = sqlx::query_as::<_, StoreStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM weather) AS accepted,
                (SELECT COUNT(*) FROM weather_errors) AS rejected
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    /// Most recently inserted reading
    pub async fn latest_accepted(&self) -> Result<Option<StoredReading>, StoreError> {
        let row = sqlx::query_as::<_, StoredReading>(
            r#"
            SELECT id, station_id,
                   temperature::float8 AS temperature,
                   humidity::float8 AS humidity,
                   wind_speed::float8 AS wind_speed,
                   created_at
            FROM weather
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Most recently logged rejection
    pub async fn latest_rejected(&self) -> Result<Option<StoredRejection>, StoreError> {
        let row = sqlx::query_as::<_, StoredRejection>(
            r#"
            SELECT id, payload, error, ts
            FROM weather_errors
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_WEATHER_TABLE)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Schema)?;
        sqlx::query(CREATE_WEATHER_ERRORS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Schema)?;

        info!("Database schema ready");
        Ok(())
    }

    #[instrument(skip(self, record))]
    async fn insert_accepted(&self, record: &AcceptedRecord) -> Result<(), StoreError> {
        // station_id goes through text so that PostgreSQL, not us, decides
        // whether "7", 7.0 or null is an acceptable integer.
        sqlx::query(
            r#"
            INSERT INTO weather (station_id, temperature, humidity, wind_speed)
            VALUES ($1::text::numeric::integer, $2::numeric, $3::numeric, $4::numeric)
            "#,
        )
        .bind(station_id_text(&record.station_id))
        .bind(record.temperature)
        .bind(record.humidity)
        .bind(record.wind_speed)
        .execute(&self.pool)
        .await
        .map_err(|source| StoreError::Insert {
            table: "weather",
            source,
        })?;

        debug!(station_id = %record.station_id, "Reading stored");
        metrics::counter!("weather.store.inserts", "table" => "weather").increment(1);

        Ok(())
    }

    #[instrument(skip(self, record), fields(kind = %record.kind))]
    async fn insert_rejected(&self, record: &RejectedRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO weather_errors (payload, error) VALUES ($1, $2)")
            .bind(&record.payload)
            .bind(&record.error)
            .execute(&self.pool)
            .await
            .map_err(|source| StoreError::Insert {
                table: "weather_errors",
                source,
            })?;

        debug!(error = %record.error, "Rejection logged");
        metrics::counter!("weather.store.inserts", "table" => "weather_errors").increment(1);

        Ok(())
    }
}

fn station_id_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_station_id_text() {
        assert_eq!(station_id_text(&json!(3)), Some("3".to_string()));
        assert_eq!(station_id_text(&json!("7")), Some("7".to_string()));
        assert_eq!(station_id_text(&json!(4.0)), Some("4.0".to_string()));
        assert_eq!(station_id_text(&Value::Null), None);
    }

    #[test]
    fn test_insert_error_names_table() {
        let err = StoreError::Insert {
            table: "weather",
            source: sqlx::Error::PoolTimedOut,
        };
        assert!(err.to_string().starts_with("Failed to insert into weather"));
    }
}
