//! Weather readings and the synthetic generator behind the producer.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const STATION_IDS: RangeInclusive<i64> = 1..=10;
pub const GENERATED_TEMPERATURE: RangeInclusive<f64> = 15.0..=35.0;
pub const GENERATED_HUMIDITY: RangeInclusive<f64> = 20.0..=95.0;
pub const GENERATED_WIND_SPEED: RangeInclusive<f64> = 0.0..=15.0;

/// One weather observation as it travels over the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub station_id: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
}

impl Reading {
    /// Encode as the JSON wire body
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Produces random readings within plausible bounds
#[derive(Debug, Clone)]
pub struct ReadingGenerator<R = StdRng> {
    rng: R,
}

impl ReadingGenerator<StdRng> {
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng> ReadingGenerator<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    pub fn next_reading(&mut self) -> Reading {
        Reading {
            station_id: self.rng.gen_range(STATION_IDS),
            temperature: round2(self.rng.gen_range(GENERATED_TEMPERATURE)),
            humidity: round2(self.rng.gen_range(GENERATED_HUMIDITY)),
            wind_speed: round2(self.rng.gen_range(GENERATED_WIND_SPEED)),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_two_decimals(value: f64) -> bool {
        ((value * 100.0).round() - value * 100.0).abs() < 1e-6
    }

    #[test]
    fn test_generated_readings_stay_in_range() {
        let mut generator = ReadingGenerator::new(StdRng::seed_from_u64(7));

        for _ in 0..1_000 {
            let reading = generator.next_reading();
            assert!(STATION_IDS.contains(&reading.station_id));
            assert!(GENERATED_TEMPERATURE.contains(&reading.temperature));
            assert!(GENERATED_HUMIDITY.contains(&reading.humidity));
            assert!(GENERATED_WIND_SPEED.contains(&reading.wind_speed));
            assert!(has_two_decimals(reading.temperature));
            assert!(has_two_decimals(reading.humidity));
            assert!(has_two_decimals(reading.wind_speed));
        }
    }

    #[test]
    fn test_seeded_generator_is_deterministic() {
        let mut a = ReadingGenerator::new(StdRng::seed_from_u64(42));
        let mut b = ReadingGenerator::new(StdRng::seed_from_u64(42));
        assert_eq!(a.next_reading(), b.next_reading());
    }

    #[test]
    fn test_wire_format() {
        let reading = Reading {
            station_id: 3,
            temperature: 22.5,
            humidity: 60.0,
            wind_speed: 4.1,
        };
        let body = String::from_utf8(reading.to_json().unwrap()).unwrap();

        assert_eq!(
            body,
            r#"{"station_id":3,"temperature":22.5,"humidity":60.0,"wind_speed":4.1}"#
        );
    }
}
