//! Measurement validation, power derivation and fan-out.

use crate::config::MeasurementConfig;
use crate::feed::{LiveEvent, LiveFeed};
use crate::measurement_types::{HourKey, SensorReading};
use crate::storage::Storage;
use crate::watchdog::LinkWatchdog;
use chrono::Local;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

/// Outcome of [`MeasurementPipeline::accept`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acceptance {
    /// Published and persisted
    Accepted(SensorReading),
    /// Over a configured limit; dropped
    Rejected,
}

/// Turns decoded measurement frames into persisted, published readings.
pub struct MeasurementPipeline {
    config: MeasurementConfig,
    storage: Arc<dyn Storage>,
    feed: LiveFeed,
    watchdog: Arc<LinkWatchdog>,
    last_reading: Mutex<Option<SensorReading>>,
}

impl MeasurementPipeline {
    /// Wire the pipeline to its collaborators.
    pub fn new(
        config: MeasurementConfig,
        storage: Arc<dyn Storage>,
        feed: LiveFeed,
        watchdog: Arc<LinkWatchdog>,
    ) -> Self {
        Self {
            config,
            storage,
            feed,
            watchdog,
            last_reading: Mutex::new(None),
        }
    }

    /// Validate one sample and, if it is within limits, publish and persist it.
    ///
    /// The three storage effects run concurrently; each failure is logged on
    /// its own and none of them affects the others.
    pub async fn accept(&self, voltage: f64, current: f64) -> Acceptance {
        if voltage > self.config.max_voltage || current > self.config.max_current {
            error!(
                voltage,
                current,
                max_voltage = self.config.max_voltage,
                max_current = self.config.max_current,
                "Rejecting out-of-range measurement"
            );
            return Acceptance::Rejected;
        }

        let reading = SensorReading::new(voltage, current, self.config.power_coefficient);
        *self.last_reading.lock() = Some(reading);
        self.feed.publish(LiveEvent::Reading(reading));
        // The service dispatcher already touched it for this frame; this one
        // covers callers that drive the pipeline directly.
        self.watchdog.touch();

        let timestamp = Local::now();
        let hour = HourKey::from_local(&timestamp);
        let (appended, aggregated, accumulated) = tokio::join!(
            self.storage.append_reading(&reading, timestamp),
            self.storage.upsert_hourly_aggregate(&reading, hour),
            self.storage.accumulate_power(reading.power),
        );

        if let Err(err) = appended {
            error!("Failed to append reading: {err}");
        }
        if let Err(err) = aggregated {
            error!("Failed to update hourly aggregate {hour}: {err}");
        }
        if let Err(err) = accumulated {
            error!("Failed to accumulate power: {err}");
        }

        debug!(voltage, current, power = reading.power, "Measurement accepted");
        Acceptance::Accepted(reading)
    }

    /// The most recent accepted reading.
    pub fn last_reading(&self) -> Option<SensorReading> {
        *self.last_reading.lock()
    }
}
