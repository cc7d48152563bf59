//! Persistence collaborator.
//!
//! The monitor only ever talks to [`Storage`]. Two implementations ship with
//! the crate:
//!
//! - [`MemoryStorage`]: everything in process memory; used by tests and the
//!   `memory` backend. Only the most recent `storage.memory_readings` readings
//!   are retained.
//! - `CsvStorage` (feature `storage_csv`): appends every accepted reading to
//!   `readings.csv` and keeps aggregates, ledger and settings in memory.

use crate::config::{MeasurementConfig, StorageBackend, StorageConfig};
use crate::error::{AppResult, MonitorError};
use crate::measurement_types::{HourKey, SensorReading};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::sync::Arc;

#[cfg(feature = "storage_csv")]
pub mod csv_log;
pub mod memory;

#[cfg(feature = "storage_csv")]
pub use csv_log::CsvStorage;
pub use memory::{
    HourlyAggregate, MemoryStorage, PowerLedger, StorageStats, DEFAULT_READING_CAPACITY,
};

/// Setting key for the firmware identification.
pub const BOARD_VERSION_KEY: &str = "board-version";
/// Setting key for the calibration confirmed by the device.
pub const COEFFICIENTS_KEY: &str = "coefficients";

/// Where readings and named server settings end up.
///
/// Every method may fail; callers in the core log failures and carry on.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append one accepted reading to the fine-grained log.
    async fn append_reading(
        &self,
        reading: &SensorReading,
        timestamp: DateTime<Local>,
    ) -> AppResult<()>;

    /// Fold a reading into the rolling aggregate for its hour.
    async fn upsert_hourly_aggregate(&self, reading: &SensorReading, hour: HourKey)
        -> AppResult<()>;

    /// Add an energy increment to the running ledger.
    async fn accumulate_power(&self, delta: f64) -> AppResult<()>;

    /// Store a named JSON setting, replacing any previous value.
    async fn set_named_setting(&self, key: &str, value: serde_json::Value) -> AppResult<()>;

    /// Fetch a named setting.
    async fn get_named_setting(&self, key: &str) -> AppResult<Option<serde_json::Value>>;

    /// Push buffered data to its destination. Called once on shutdown.
    async fn flush(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Build the configured backend.
pub fn build_storage(
    storage: &StorageConfig,
    measurement: &MeasurementConfig,
) -> AppResult<Arc<dyn Storage>> {
    let memory = MemoryStorage::with_ledger(storage.start_kwh, measurement.power_coefficient)
        .with_reading_capacity(storage.memory_readings);
    match storage.backend {
        StorageBackend::Memory => Ok(Arc::new(memory)),
        #[cfg(feature = "storage_csv")]
        StorageBackend::Csv => Ok(Arc::new(CsvStorage::open(&storage.output_dir, memory)?)),
        #[cfg(not(feature = "storage_csv"))]
        StorageBackend::Csv => Err(MonitorError::Configuration(
            "storage.backend = \"csv\" requires the storage_csv feature".to_string(),
        )),
    }
}

pub(crate) fn storage_error(context: &str, err: impl std::fmt::Display) -> MonitorError {
    MonitorError::Storage(format!("{context}: {err}"))
}
