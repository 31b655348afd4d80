//! In-memory broker and clock doubles for unit tests.

use crate::backoff::Sleeper;
use crate::connection::{BrokerError, Connector, Publish, Session};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records requested sleeps instead of waiting
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    failures_left: AtomicUsize,
    publish_failures_left: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    alive: Mutex<Vec<Arc<AtomicBool>>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

/// Connector whose sessions live in memory
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    state: Arc<BrokerState>,
}

impl FakeConnector {
    /// Refuse the first `failures` connection attempts
    pub fn failing(failures: usize) -> Self {
        let connector = Self::default();
        connector
            .state
            .failures_left
            .store(failures, Ordering::SeqCst);
        connector
    }

    /// Make the next `failures` publishes fail
    pub fn fail_publishes(&self, failures: usize) {
        self.state
            .publish_failures_left
            .store(failures, Ordering::SeqCst);
    }

    /// Simulate the broker dropping every open session
    pub fn kill_sessions(&self) {
        for alive in self.state.alive.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.published.lock().unwrap().clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self) -> Result<FakeSession, BrokerError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.state.failures_left) {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        let alive = Arc::new(AtomicBool::new(true));
        self.state.alive.lock().unwrap().push(alive.clone());
        Ok(FakeSession {
            alive,
            state: self.state.clone(),
        })
    }
}

#[derive(Debug)]
pub struct FakeSession {
    alive: Arc<AtomicBool>,
    state: Arc<BrokerState>,
}

#[async_trait]
impl Session for FakeSession {
    fn is_open(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Publish for FakeSession {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if take_one(&self.state.publish_failures_left) {
            self.alive.store(false, Ordering::SeqCst);
            return Err(BrokerError::Publish {
                queue: queue.to_string(),
                message: "channel closed".to_string(),
            });
        }

        self.state
            .published
            .lock()
            .unwrap()
            .push((queue.to_string(), payload.to_vec()));
        Ok(())
    }
}
