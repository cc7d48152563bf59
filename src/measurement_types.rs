//! Common data types shared between the pipeline, the protocol actor, storage
//! and the live feed.

use chrono::{DateTime, Datelike, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};

/// Seconds per hour, used to turn an instantaneous power sample into energy.
pub const SECONDS_PER_HOUR: f64 = 3600.0;

/// One validated measurement from the meter.
///
/// `power` is always derived on the server from `voltage` and `current`; the
/// device never supplies it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// RMS voltage in volts
    pub voltage: f64,
    /// RMS current in amperes
    pub current: f64,
    /// Energy increment for this sample (see [`SensorReading::new`])
    pub power: f64,
}

impl SensorReading {
    /// Build a reading, deriving power as `voltage * current * coefficient / 3600`.
    ///
    /// Power is zero unless both voltage and current are non-zero.
    pub fn new(voltage: f64, current: f64, power_coefficient: f64) -> Self {
        let power = if voltage != 0.0 && current != 0.0 {
            voltage * current * power_coefficient / SECONDS_PER_HOUR
        } else {
            0.0
        };

        Self {
            voltage,
            current,
            power,
        }
    }
}

/// The three calibration scalars the device applies to its raw sensor values.
///
/// Compared field-for-field with exact `f64` equality.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationTarget {
    /// Voltage channel correction
    pub voltage_calibration: f64,
    /// Current channel correction
    pub current_calibration: f64,
    /// Power factor correction
    pub power_factor_calibration: f64,
}

impl CalibrationTarget {
    /// Create a calibration triple.
    pub fn new(voltage: f64, current: f64, power_factor: f64) -> Self {
        Self {
            voltage_calibration: voltage,
            current_calibration: current,
            power_factor_calibration: power_factor,
        }
    }
}

impl Default for CalibrationTarget {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }
}

impl std::fmt::Display for CalibrationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.voltage_calibration, self.current_calibration, self.power_factor_calibration
        )
    }
}

/// Firmware identification reported by the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardVersion {
    /// Firmware version string as sent by the device
    pub version: String,
    /// Parsed build date, when the device string could be understood
    pub build_date: Option<DateTime<Local>>,
    /// Build date exactly as received
    pub build_date_raw: String,
}

impl BoardVersion {
    /// Build from the raw `info` frame fields, parsing the date leniently.
    pub fn from_raw(version: impl Into<String>, build_date_raw: impl Into<String>) -> Self {
        let build_date_raw = build_date_raw.into();
        Self {
            version: version.into(),
            build_date: parse_build_date(&build_date_raw),
            build_date_raw,
        }
    }
}

/// Parse the "ISO-8601-ish" build date strings produced by the firmware.
///
/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS` (local time)
/// and the C `__DATE__ __TIME__` form (`Mar  5 2024 12:34:56`).
fn parse_build_date(raw: &str) -> Option<DateTime<Local>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Local));
    }

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%b %d %Y %H:%M:%S"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(&collapsed, fmt).ok())
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
}

/// Key of the rolling per-hour aggregate: calendar day plus hour of day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HourKey {
    /// Local calendar day
    pub day: NaiveDate,
    /// Hour of day, 0-23
    pub hour: u32,
}

impl HourKey {
    /// The aggregate bucket a local timestamp falls into.
    pub fn from_local(timestamp: &DateTime<Local>) -> Self {
        Self {
            day: timestamp.date_naive(),
            hour: timestamp.hour(),
        }
    }
}

impl std::fmt::Display for HourKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}h",
            self.day.year(),
            self.day.month(),
            self.day.day(),
            self.hour
        )
    }
}
