//! Reconnect backoff shared by the producer and the consumer.
//!
//! Delays grow from a floor by a fixed multiplier up to a ceiling and drop
//! back to the floor after every successful connection. There is no jitter,
//! so identical replicas retry in lockstep.

use crate::config::BackoffConfig;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Source of delays between reconnect attempts
#[derive(Debug)]
pub struct ReconnectBackoff {
    inner: ExponentialBackoff,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.initial_interval())
            .with_max_interval(config.max_interval())
            .with_multiplier(config.multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        Self { inner, attempts: 0 }
    }

    /// Delay to sleep before the next attempt; advances the state
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        // Never `None` without an elapsed-time limit; the ceiling is a safe fallback.
        self.inner.next_backoff().unwrap_or(self.inner.max_interval)
    }

    /// Return to the floor after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.inner.reset();
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

/// Injectable clock for everything that waits
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Run `operation` until it succeeds, backing off between failures.
///
/// The backoff is reset once the operation succeeds.
pub async fn retry_with_backoff<T, E, F, Fut, S>(
    backoff: &mut ReconnectBackoff,
    sleeper: &S,
    target: &str,
    mut operation: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    S: Sleeper + ?Sized,
{
    loop {
        match operation().await {
            Ok(value) => {
                if backoff.attempts() > 0 {
                    info!(target_name = target, attempts = backoff.attempts(), "Connected after retrying");
                }
                backoff.reset();
                return value;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    target_name = target,
                    attempt = backoff.attempts(),
                    delay_secs = delay.as_secs_f64(),
                    error = %e,
                    "Connection failed, retrying"
                );
                sleeper.sleep(delay).await;
            }
        }
    }
}
