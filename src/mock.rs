//! Test doubles for the device link and the collaborators.
//!
//! These are compiled into the library so integration tests and simulators
//! can use them. They provide:
//! - Call recording for test verification
//! - Controllable failure injection

use crate::alerting::Alerting;
use crate::error::{AppResult, MonitorError};
use crate::measurement_types::{HourKey, SensorReading};
use crate::storage::Storage;
use crate::transport::DeviceLink;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

/// A [`DeviceLink`] that records every write with the instant it happened.
///
/// Writes while "closed" are dropped, like on the real transport.
///
/// # Example
///
/// ```
/// use power_monitor::mock::RecordingLink;
/// use power_monitor::transport::DeviceLink;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let link = RecordingLink::new();
/// link.write("d\n").await;
/// assert_eq!(link.writes(), vec!["d\n".to_string()]);
/// # }
/// ```
#[derive(Debug)]
pub struct RecordingLink {
    open: AtomicBool,
    writes: Mutex<Vec<(Instant, String)>>,
}

impl RecordingLink {
    /// An open link with an empty log.
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Simulate the port opening or closing.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Everything written so far, in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().iter().map(|(_, w)| w.clone()).collect()
    }

    /// When each write happened.
    pub fn write_times(&self) -> Vec<Instant> {
        self.writes.lock().iter().map(|(at, _)| *at).collect()
    }

    /// Forget recorded writes.
    pub fn clear(&self) {
        self.writes.lock().clear();
    }
}

impl Default for RecordingLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceLink for RecordingLink {
    async fn write(&self, raw: &str) {
        if self.is_open() {
            self.writes.lock().push((Instant::now(), raw.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// An [`Alerting`] sink that records messages.
#[derive(Debug, Default)]
pub struct RecordingAlerting {
    messages: Mutex<Vec<String>>,
    should_fail_next: AtomicBool,
}

impl RecordingAlerting {
    /// Make the next `notify` fail (nothing is recorded for it).
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Delivered messages, in order.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Alerting for RecordingAlerting {
    async fn notify(&self, message: &str) -> AppResult<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(MonitorError::Alerting("mock delivery failure".to_string()));
        }
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}

/// A [`Storage`] whose every operation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStorage;

fn unavailable() -> MonitorError {
    MonitorError::Storage("mock storage unavailable".to_string())
}

#[async_trait]
impl Storage for FailingStorage {
    async fn append_reading(&self, _: &SensorReading, _: DateTime<Local>) -> AppResult<()> {
        Err(unavailable())
    }

    async fn upsert_hourly_aggregate(&self, _: &SensorReading, _: HourKey) -> AppResult<()> {
        Err(unavailable())
    }

    async fn accumulate_power(&self, _: f64) -> AppResult<()> {
        Err(unavailable())
    }

    async fn set_named_setting(&self, _: &str, _: serde_json::Value) -> AppResult<()> {
        Err(unavailable())
    }

    async fn get_named_setting(&self, _: &str) -> AppResult<Option<serde_json::Value>> {
        Err(unavailable())
    }
}
