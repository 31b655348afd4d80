//! Outcomes of validating a delivery: an accepted reading or a rejection.

use serde_json::Value;
use std::fmt;

/// A reading that passed validation and is ready for the `weather` table
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedRecord {
    /// Taken verbatim from the payload; the database decides if it is usable
    pub station_id: Value,
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    /// The parsed message, kept for the error log if the insert fails
    pub payload: Value,
}

/// Why a delivery ended up in `weather_errors`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Body is not JSON
    InvalidFormat,
    /// A measurement is missing or not numeric
    InvalidNumeric,
    /// Temperature outside the plausible range
    OutOfRange,
    /// Valid reading the database refused
    Persistence,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::InvalidFormat => "invalid_format",
            RejectionKind::InvalidNumeric => "invalid_numeric",
            RejectionKind::OutOfRange => "out_of_range",
            RejectionKind::Persistence => "persistence",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload that could not be stored as a reading
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub kind: RejectionKind,
    /// Parsed JSON when available, otherwise the decoded body as a JSON string
    pub payload: Option<Value>,
    pub error: String,
}

impl RejectedRecord {
    pub fn new(kind: RejectionKind, payload: Option<Value>, error: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            error: error.into(),
        }
    }

    /// Record for a validated reading whose insert failed
    pub fn persistence_failure(record: &AcceptedRecord, error: impl fmt::Display) -> Self {
        Self::new(
            RejectionKind::Persistence,
            Some(record.payload.clone()),
            format!("db error: {error}"),
        )
    }
}
