//! Configuration System using Figment
//!
//! Strongly-typed configuration for the monitor. Values are layered, later
//! layers winning:
//! 1. Built-in defaults ([`MonitorConfig::default`])
//! 2. A TOML file (`config/power-monitor.toml` unless overridden)
//! 3. Environment variables prefixed with `POWER_MONITOR_`, nested with `__`
//!
//! Durations are written in humantime form (`"2s"`, `"500ms"`).
//!
//! # Example
//! ```no_run
//! use power_monitor::config::MonitorConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // POWER_MONITOR_SERIAL__PORT=/dev/ttyACM0 overrides the file
//! let config = MonitorConfig::load()?;
//! println!("Reading from {}", config.serial.port);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, MonitorError};
use crate::measurement_types::CalibrationTarget;
use crate::storage::DEFAULT_READING_CAPACITY;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/power-monitor.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "POWER_MONITOR_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link settings
    pub serial: SerialConfig,
    /// Calibration target programmed into the device
    pub calibration: CalibrationConfig,
    /// Measurement validation and power derivation
    pub measurement: MeasurementConfig,
    /// Command/acknowledgment protocol
    pub protocol: ProtocolConfig,
    /// Link liveness monitoring
    pub watchdog: WatchdogConfig,
    /// Periodic hooks and the shutdown marker
    pub scheduler: SchedulerConfig,
    /// Persistence backend
    pub storage: StorageConfig,
    /// Live subscriber fan-out
    pub live: LiveConfig,
}

/// Runtime environment.
///
/// Availability alerts and the shutdown marker are skipped in development.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development; no alerts, no marker file
    #[default]
    Development,
    /// Deployed
    Production,
}

impl Environment {
    /// True for [`Environment::Development`].
    pub fn is_development(self) -> bool {
        self == Environment::Development
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured
    #[default]
    Pretty,
    /// Single-line
    Compact,
    /// Structured JSON
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Runtime environment
    pub environment: Environment,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "power-monitor".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            environment: Environment::default(),
        }
    }
}

/// Serial port configuration (8N1, no flow control)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
        }
    }
}

/// Calibration target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Voltage channel correction
    pub voltage: f64,
    /// Current channel correction
    pub current: f64,
    /// Power factor correction
    pub power_factor: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            voltage: 1.0,
            current: 1.0,
            power_factor: 1.0,
        }
    }
}

impl CalibrationConfig {
    /// The target as the protocol layer sees it.
    pub fn target(&self) -> CalibrationTarget {
        CalibrationTarget::new(self.voltage, self.current, self.power_factor)
    }
}

/// Measurement validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Multiplier in `power = V * I * coefficient / 3600`
    pub power_coefficient: f64,
    /// Readings with a voltage above this are rejected (volts)
    pub max_voltage: f64,
    /// Readings with a current above this are rejected (amperes)
    pub max_current: f64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            power_coefficient: 1.0,
            max_voltage: 300.0,
            max_current: 100.0,
        }
    }
}

/// Retry protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Delay between an unconfirmed send and its retry
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Sends per command before giving up (first send included)
    pub max_attempts: u32,
    /// Consecutive calibration mismatches that trigger a re-program
    pub max_corrective_resends: u32,
    /// Protocol actor mailbox size
    pub mailbox_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(2000),
            max_attempts: 3,
            max_corrective_resends: 3,
            mailbox_capacity: 64,
        }
    }
}

/// Link liveness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// How often the link is checked
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Silence after which the link is declared down
    #[serde(with = "humantime_serde")]
    pub inactivity_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(20),
        }
    }
}

/// Scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the live telemetry snapshot
    #[serde(with = "humantime_serde")]
    pub telemetry_interval: Duration,
    /// File written on clean shutdown and checked on start
    pub shutdown_marker: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            telemetry_interval: Duration::from_secs(60),
            shutdown_marker: PathBuf::from("server.off"),
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Everything in memory
    #[default]
    Memory,
    /// Readings appended to `readings.csv`, the rest in memory
    Csv,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend
    pub backend: StorageBackend,
    /// Output directory for file-based backends
    pub output_dir: PathBuf,
    /// Meter reading (kWh) the energy ledger starts from
    pub start_kwh: f64,
    /// Recent readings kept in memory; older ones are evicted
    pub memory_readings: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            output_dir: PathBuf::from("data"),
            start_kwh: 0.0,
            memory_readings: DEFAULT_READING_CAPACITY,
        }
    }
}

/// Live fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Broadcast buffer; slower subscribers lag past this many events
    pub capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl MonitorConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider chain, exposed for callers that want to inspect it.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Semantic checks on values that parsed but cannot be used.
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(MonitorError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.serial.port.trim().is_empty() {
            return Err(MonitorError::Configuration(
                "serial.port must not be empty".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(MonitorError::Configuration(
                "serial.baud_rate must be > 0".to_string(),
            ));
        }

        let m = &self.measurement;
        for (name, value) in [
            ("measurement.power_coefficient", m.power_coefficient),
            ("measurement.max_voltage", m.max_voltage),
            ("measurement.max_current", m.max_current),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(MonitorError::Configuration(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }

        let c = &self.calibration;
        if ![c.voltage, c.current, c.power_factor]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(MonitorError::Configuration(
                "calibration values must be finite".to_string(),
            ));
        }

        if self.protocol.max_attempts == 0 {
            return Err(MonitorError::Configuration(
                "protocol.max_attempts must be >= 1".to_string(),
            ));
        }
        if self.protocol.retry_delay.is_zero() {
            return Err(MonitorError::Configuration(
                "protocol.retry_delay must be > 0".to_string(),
            ));
        }
        if self.protocol.mailbox_capacity == 0 {
            return Err(MonitorError::Configuration(
                "protocol.mailbox_capacity must be >= 1".to_string(),
            ));
        }

        if self.watchdog.check_interval.is_zero() || self.scheduler.telemetry_interval.is_zero() {
            return Err(MonitorError::Configuration(
                "watchdog.check_interval and scheduler.telemetry_interval must be > 0".to_string(),
            ));
        }
        if self.watchdog.inactivity_timeout < self.watchdog.check_interval {
            return Err(MonitorError::Configuration(format!(
                "watchdog.inactivity_timeout ({:?}) is shorter than check_interval ({:?})",
                self.watchdog.inactivity_timeout, self.watchdog.check_interval
            )));
        }

        if self.live.capacity == 0 {
            return Err(MonitorError::Configuration(
                "live.capacity must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol.retry_delay, Duration::from_secs(2));
        assert_eq!(config.protocol.max_attempts, 3);
        assert_eq!(config.watchdog.inactivity_timeout, Duration::from_secs(20));
        assert_eq!(config.measurement.max_current, 100.0);
        assert_eq!(config.calibration.target(), CalibrationTarget::default());
    }

    #[test]
    fn load_partial_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
environment = "production"
log_format = "json"

[protocol]
retry_delay = "500ms"
max_attempts = 5

[calibration]
current = 1.05
"#
        )
        .unwrap();

        let config = MonitorConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.environment, Environment::Production);
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.protocol.retry_delay, Duration::from_millis(500));
        assert_eq!(config.protocol.max_attempts, 5);
        assert_eq!(config.protocol.max_corrective_resends, 3);
        assert_eq!(
            config.calibration.target(),
            CalibrationTarget::new(1.0, 1.05, 1.0)
        );
        assert_eq!(config.serial.baud_rate, 115_200);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.name, "power-monitor");
    }

    #[test]
    fn invalid_log_level() {
        let mut config = MonitorConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(MonitorError::Configuration(_))
        ));
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = MonitorConfig::default();
        config.protocol.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_limit_rejected() {
        let mut config = MonitorConfig::default();
        config.measurement.max_voltage = -1.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_voltage"));
    }

    #[test]
    fn bad_type_is_a_figment_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[protocol]\nmax_attempts = \"many\"").unwrap();
        assert!(matches!(
            MonitorConfig::load_from(file.path()),
            Err(MonitorError::Config(_))
        ));
    }
}
