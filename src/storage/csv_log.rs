//! CSV fine-grained reading log.

use super::{storage_error, MemoryStorage, Storage};
use crate::error::AppResult;
use crate::measurement_types::{HourKey, SensorReading};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the reading log inside `output_dir`.
pub const READINGS_FILE: &str = "readings.csv";

/// Appends each reading to `readings.csv`; aggregates, ledger and settings are
/// delegated to a [`MemoryStorage`]. Readings are not duplicated in memory.
pub struct CsvStorage {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
    inner: MemoryStorage,
}

impl CsvStorage {
    /// Open (or create) `output_dir/readings.csv` for appending.
    ///
    /// The header row is written only when the file is new or empty.
    pub fn open(output_dir: &Path, inner: MemoryStorage) -> AppResult<Self> {
        std::fs::create_dir_all(output_dir)
            .map_err(|e| storage_error("Failed to create output directory", e))?;
        let path = output_dir.join(READINGS_FILE);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| storage_error("Failed to open CSV log", e))?;
        let is_empty = file
            .metadata()
            .map_err(|e| storage_error("Failed to stat CSV log", e))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_empty {
            writer
                .write_record(["timestamp", "voltage", "current", "power"])
                .and_then(|()| writer.flush().map_err(csv::Error::from))
                .map_err(|e| storage_error("Failed to write CSV header", e))?;
        }

        info!("CSV reading log at '{}'", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            inner,
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The in-memory half (aggregates, ledger, settings).
    pub fn memory(&self) -> &MemoryStorage {
        &self.inner
    }
}

#[async_trait]
impl Storage for CsvStorage {
    async fn append_reading(
        &self,
        reading: &SensorReading,
        timestamp: DateTime<Local>,
    ) -> AppResult<()> {
        let mut writer = self.writer.lock();
        writer
            .write_record([
                timestamp.to_rfc3339(),
                reading.voltage.to_string(),
                reading.current.to_string(),
                reading.power.to_string(),
            ])
            .map_err(|e| storage_error("Failed to append reading", e))?;
        writer
            .flush()
            .map_err(|e| storage_error("Failed to flush CSV log", e))
    }

    async fn upsert_hourly_aggregate(
        &self,
        reading: &SensorReading,
        hour: HourKey,
    ) -> AppResult<()> {
        self.inner.upsert_hourly_aggregate(reading, hour).await
    }

    async fn accumulate_power(&self, delta: f64) -> AppResult<()> {
        self.inner.accumulate_power(delta).await
    }

    async fn set_named_setting(&self, key: &str, value: serde_json::Value) -> AppResult<()> {
        self.inner.set_named_setting(key, value).await
    }

    async fn get_named_setting(&self, key: &str) -> AppResult<Option<serde_json::Value>> {
        self.inner.get_named_setting(key).await
    }

    async fn flush(&self) -> AppResult<()> {
        self.writer
            .lock()
            .flush()
            .map_err(|e| storage_error("Failed to flush CSV log", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_rows_after_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let reading = SensorReading::new(230.0, 5.0, 3600.0);

        {
            let storage = CsvStorage::open(dir.path(), MemoryStorage::new()).unwrap();
            storage.append_reading(&reading, Local::now()).await.unwrap();
        }
        // Reopening must not repeat the header.
        let storage = CsvStorage::open(dir.path(), MemoryStorage::new()).unwrap();
        storage.append_reading(&reading, Local::now()).await.unwrap();
        storage.flush().await.unwrap();

        let contents = std::fs::read_to_string(storage.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,voltage,current,power");
        assert!(lines[1].ends_with(",230,5,1150"));
        assert!(storage.memory().readings().is_empty());
    }
}
