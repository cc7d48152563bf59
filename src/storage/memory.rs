//! In-memory storage backend.

use super::Storage;
use crate::error::AppResult;
use crate::measurement_types::{HourKey, SensorReading};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Readings retained by default before the oldest are evicted.
pub const DEFAULT_READING_CAPACITY: usize = 1024;

/// Per-hour rolling aggregate.
///
/// Minimums ignore the zero the aggregate starts from: the first positive
/// value always replaces a zero minimum.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HourlyAggregate {
    /// Sum of voltages
    pub voltage_sum: f64,
    /// Smallest voltage seen
    pub voltage_min: f64,
    /// Largest voltage seen
    pub voltage_max: f64,
    /// Sum of currents
    pub current_sum: f64,
    /// Smallest current seen
    pub current_min: f64,
    /// Largest current seen
    pub current_max: f64,
    /// Sum of energy increments
    pub power_sum: f64,
    /// Number of readings folded in
    pub samples: u64,
    /// When the bucket last changed
    pub updated: Option<DateTime<Local>>,
}

impl HourlyAggregate {
    fn fold(&mut self, reading: &SensorReading) {
        fold_channel(
            reading.voltage,
            &mut self.voltage_sum,
            &mut self.voltage_min,
            &mut self.voltage_max,
        );
        fold_channel(
            reading.current,
            &mut self.current_sum,
            &mut self.current_min,
            &mut self.current_max,
        );
        self.power_sum += reading.power;
        self.samples += 1;
        self.updated = Some(Local::now());
    }

    /// Mean voltage over the hour.
    pub fn voltage_avg(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.voltage_sum / self.samples as f64)
    }

    /// Mean current over the hour.
    pub fn current_avg(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.current_sum / self.samples as f64)
    }
}

fn fold_channel(value: f64, sum: &mut f64, min: &mut f64, max: &mut f64) {
    *sum += value;
    if (value > 0.0 && *min == 0.0) || *min > value {
        *min = value;
    }
    if *max == 0.0 || *max < value {
        *max = value;
    }
}

/// Running energy ledger.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PowerLedger {
    /// Meter reading the ledger started from (kWh)
    pub start_kwh: f64,
    /// Energy accumulated since then (Wh)
    pub accumulated_wh: f64,
    /// Power coefficient in force when the ledger was opened
    pub power_coefficient: f64,
}

impl PowerLedger {
    /// Total consumption: start plus accumulated energy rounded to 0.1 kWh.
    pub fn consumption_kwh(&self) -> f64 {
        self.start_kwh + (self.accumulated_wh / 1000.0 * 10.0).round() / 10.0
    }
}

/// Call counters, one per storage effect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// `append_reading` calls
    pub appended: u64,
    /// `upsert_hourly_aggregate` calls
    pub aggregated: u64,
    /// `accumulate_power` calls
    pub accumulated: u64,
    /// `set_named_setting` calls
    pub settings_written: u64,
}

#[derive(Debug)]
struct Inner {
    readings: VecDeque<(DateTime<Local>, SensorReading)>,
    reading_capacity: usize,
    hourly: BTreeMap<HourKey, HourlyAggregate>,
    ledger: PowerLedger,
    settings: HashMap<String, serde_json::Value>,
    stats: StorageStats,
}

/// Keeps everything in memory. Thread-safe; clone the `Arc`, not the store.
#[derive(Debug)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Empty store with a zeroed ledger.
    pub fn new() -> Self {
        Self::with_ledger(0.0, 1.0)
    }

    /// Empty store whose ledger starts at `start_kwh`.
    pub fn with_ledger(start_kwh: f64, power_coefficient: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                readings: VecDeque::new(),
                reading_capacity: DEFAULT_READING_CAPACITY,
                hourly: BTreeMap::new(),
                ledger: PowerLedger {
                    start_kwh,
                    accumulated_wh: 0.0,
                    power_coefficient,
                },
                settings: HashMap::new(),
                stats: StorageStats::default(),
            }),
        }
    }

    /// Keep at most `capacity` recent readings. Zero keeps none.
    pub fn with_reading_capacity(self, capacity: usize) -> Self {
        {
            let mut inner = self.inner.lock();
            inner.reading_capacity = capacity;
            let excess = inner.readings.len().saturating_sub(capacity);
            inner.readings.drain(..excess);
        }
        self
    }

    /// Retained readings, oldest first.
    pub fn readings(&self) -> Vec<SensorReading> {
        self.inner.lock().readings.iter().map(|(_, r)| *r).collect()
    }

    /// The aggregate for one hour, if any reading fell into it.
    pub fn hourly(&self, key: HourKey) -> Option<HourlyAggregate> {
        self.inner.lock().hourly.get(&key).cloned()
    }

    /// Snapshot of the energy ledger.
    pub fn ledger(&self) -> PowerLedger {
        self.inner.lock().ledger.clone()
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> StorageStats {
        self.inner.lock().stats
    }

    /// Synchronous variant of [`Storage::get_named_setting`].
    pub fn setting(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().settings.get(key).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn append_reading(
        &self,
        reading: &SensorReading,
        timestamp: DateTime<Local>,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock();
        inner.stats.appended += 1;
        if inner.reading_capacity == 0 {
            return Ok(());
        }
        if inner.readings.len() >= inner.reading_capacity {
            inner.readings.pop_front();
        }
        inner.readings.push_back((timestamp, *reading));
        Ok(())
    }

    async fn upsert_hourly_aggregate(
        &self,
        reading: &SensorReading,
        hour: HourKey,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock();
        inner.stats.aggregated += 1;
        // Samples with a zero channel carry no load information.
        if reading.voltage != 0.0 && reading.current != 0.0 {
            inner.hourly.entry(hour).or_default().fold(reading);
        }
        Ok(())
    }

    async fn accumulate_power(&self, delta: f64) -> AppResult<()> {
        let mut inner = self.inner.lock();
        inner.stats.accumulated += 1;
        inner.ledger.accumulated_wh += delta;
        Ok(())
    }

    async fn set_named_setting(&self, key: &str, value: serde_json::Value) -> AppResult<()> {
        let mut inner = self.inner.lock();
        inner.stats.settings_written += 1;
        inner.settings.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_named_setting(&self, key: &str) -> AppResult<Option<serde_json::Value>> {
        Ok(self.setting(key))
    }
}
