//! Weather Storage Service
//!
//! Drains the durable `weather_data` queue, validates every reading and
//! persists it to PostgreSQL. Readings that fail validation are kept in an
//! error log table together with the reason, so nothing leaves the queue
//! without a trace.
//!
//! ## Delivery guarantees
//!
//! - **At least once**: a reading is written before its delivery is
//!   acknowledged, so a crash in between can duplicate a row
//! - **No redelivery loops**: deliveries are never requeued
//! - **Strictly sequential**: prefetch 1, one delivery in flight per process
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ                                            PostgreSQL
//! ┌──────────────┐     ┌──────────────┐             ┌──────────────┐
//! │ weather_data │────▶│ Validation   │──accepted──▶│ weather      │
//! └──────────────┘     └──────────────┘             └──────────────┘
//!        ▲                    │                     ┌──────────────┐
//!        │                    └──────rejected──────▶│ weather_     │
//!        │                                          │   errors     │
//!        │             ┌──────────────┐             └──────────────┘
//!        └─ack / nack──│ Consumer     │
//!                      │ Loop         │
//!                      └──────────────┘
//! ```

pub mod config;
pub mod consumer;
pub mod reading_store;
pub mod records;
pub mod validation;

pub use config::{Config, DatabaseConfig, ServiceConfig};
pub use consumer::{DeliveryAcker, DeliveryProcessor, Disposition, WeatherConsumer};
pub use reading_store::{
    PgReadingStore, ReadingStore, StoreError, StoreStats, StoredReading, StoredRejection,
};
pub use records::{AcceptedRecord, RejectedRecord, RejectionKind};
pub use validation::{validate, CoercionError, TEMPERATURE_RANGE};
