//! Custom error types for the monitor.
//!
//! This module defines the primary error type, `MonitorError`, used by every
//! layer that can actually fail: configuration loading, opening the serial
//! port, and the storage/alerting collaborators.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically parse or type errors
//!   in the TOML file or in `POWER_MONITOR_*` environment overrides.
//! - **`Configuration`**: Semantic errors caught by `MonitorConfig::validate`
//!   (values that parse but make no sense, such as a zero retry budget).
//! - **`Io`** / **`Serial`**: Transport-level failures. These are logged by the
//!   transport and never propagate out of the read loop.
//! - **`Storage`** / **`Alerting`**: Failures reported by collaborators. The
//!   core logs them and carries on.
//! - **`Json`**: Serialization of persisted settings.
//!
//! Protocol-level problems (noise, bad JSON, calibration mismatch, retry
//! exhaustion) never surface as `MonitorError`; they are logged where they
//! happen and the read loop keeps going.

use thiserror::Error;

/// Convenience alias for results using the monitor error type.
pub type AppResult<T> = std::result::Result<T, MonitorError>;

/// Errors produced by the monitor and its collaborators.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Alerting error: {0}")]
    Alerting(String),
}

impl From<figment::Error> for MonitorError {
    fn from(value: figment::Error) -> Self {
        MonitorError::Config(Box::new(value))
    }
}

impl MonitorError {
    /// Whether the failure is transient and the caller may try again later.
    ///
    /// The scheduler logs recoverable start failures at warn level and keeps
    /// running.
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::Config(_)
            | MonitorError::Configuration(_)
            | MonitorError::SerialFeatureDisabled => false,
            MonitorError::Io(_)
            | MonitorError::Serial(_)
            | MonitorError::Json(_)
            | MonitorError::Storage(_)
            | MonitorError::Alerting(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_recoverable() {
        let err = MonitorError::Storage("disk full".to_string());
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Storage error: disk full");
    }

    #[test]
    fn configuration_errors_are_fatal() {
        let err = MonitorError::Configuration("max_attempts must be >= 1".into());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn serial_open_failures_are_recoverable() {
        assert!(MonitorError::Serial("port vanished".into()).is_recoverable());
        assert!(!MonitorError::SerialFeatureDisabled.is_recoverable());
    }

    #[test]
    fn figment_errors_convert() {
        let figment_err = figment::Error::from("bad value".to_string());
        let err: MonitorError = figment_err.into();
        assert!(matches!(err, MonitorError::Config(_)));
    }
}
