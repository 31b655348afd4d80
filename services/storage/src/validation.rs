//! Validation of raw delivery bodies.
//!
//! Stages run in order and the first failure wins:
//! 1. the body must be JSON
//! 2. `temperature`, `humidity` and `wind_speed` must coerce to numbers
//! 3. `temperature` must lie in [`TEMPERATURE_RANGE`]
//!
//! Humidity, wind speed and station id are passed through without range or
//! presence checks.

use crate::records::{AcceptedRecord, RejectedRecord, RejectionKind};
use serde_json::{Map, Value};
use std::ops::RangeInclusive;
use thiserror::Error;

/// Physically plausible air temperature in °C, inclusive
pub const TEMPERATURE_RANGE: RangeInclusive<f64> = -50.0..=60.0;

/// Why a field could not be turned into a number
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoercionError {
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("{0}: field is missing")]
    Missing(&'static str),

    #[error("{0}: value is null")]
    Null(&'static str),

    #[error("{field}: could not convert string to float: {value:?}")]
    NotNumeric { field: &'static str, value: String },

    #[error("{field}: unsupported type {kind}")]
    UnsupportedType {
        field: &'static str,
        kind: &'static str,
    },
}

/// Validate a raw message body.
///
/// Never panics: every malformed input becomes a [`RejectedRecord`].
pub fn validate(raw: &[u8]) -> Result<AcceptedRecord, RejectedRecord> {
    // serde_json refuses numbers beyond f64 (`1e400`) instead of reading them
    // as infinity, so such bodies are rejected here and kept as raw text
    // rather than reaching the range check.
    let payload: Value = serde_json::from_slice(raw).map_err(|e| {
        RejectedRecord::new(
            RejectionKind::InvalidFormat,
            Some(Value::String(decode_lossy(raw))),
            format!("invalid JSON: {e}"),
        )
    })?;

    let (temperature, humidity, wind_speed) = match coerce_measurements(&payload) {
        Ok(values) => values,
        Err(e) => {
            return Err(RejectedRecord::new(
                RejectionKind::InvalidNumeric,
                Some(payload),
                format!("invalid numeric values: {e}"),
            ))
        }
    };

    if !TEMPERATURE_RANGE.contains(&temperature) {
        return Err(RejectedRecord::new(
            RejectionKind::OutOfRange,
            Some(payload),
            format!("temperature out of range: {temperature}"),
        ));
    }

    let station_id = payload.get("station_id").cloned().unwrap_or(Value::Null);

    Ok(AcceptedRecord {
        station_id,
        temperature,
        humidity,
        wind_speed,
        payload,
    })
}

fn coerce_measurements(payload: &Value) -> Result<(f64, f64, f64), CoercionError> {
    let fields = payload.as_object().ok_or(CoercionError::NotAnObject)?;

    Ok((
        coerce_field(fields, "temperature")?,
        coerce_field(fields, "humidity")?,
        coerce_field(fields, "wind_speed")?,
    ))
}

/// Permissive numeric conversion: numbers, numeric strings and booleans
fn coerce_field(fields: &Map<String, Value>, field: &'static str) -> Result<f64, CoercionError> {
    match fields.get(field) {
        None => Err(CoercionError::Missing(field)),
        Some(Value::Null) => Err(CoercionError::Null(field)),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| CoercionError::NotNumeric {
            field,
            value: n.to_string(),
        }),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| CoercionError::NotNumeric {
            field,
            value: s.clone(),
        }),
        Some(Value::Bool(b)) => Ok(if *b { 1.0 } else { 0.0 }),
        Some(Value::Array(_)) => Err(CoercionError::UnsupportedType {
            field,
            kind: "array",
        }),
        Some(Value::Object(_)) => Err(CoercionError::UnsupportedType {
            field,
            kind: "object",
        }),
    }
}

/// Decode as UTF-8, dropping sequences that are not valid
fn decode_lossy(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace(char::REPLACEMENT_CHARACTER, "")
}
