//! # Power Monitor Core Library
//!
//! Serial telemetry ingestion for a power-metering microcontroller. The meter
//! prints JSON lines (measurements, calibration readback, firmware info); the
//! monitor validates and republishes the measurements and keeps the meter's
//! calibration in sync with server-side configuration through a
//! send/confirm/retry protocol.
//!
//! ## Crate Structure
//!
//! - **`transport`**: `SerialTransport`, the line-oriented link to the meter.
//! - **`protocol`**: Frame decoding (device → server) and wire commands
//!   (server → device).
//! - **`sync`**: The `CommandSynchronizer` actor that correlates commands with
//!   confirming frames and retries them.
//! - **`pipeline`**: Measurement validation, power derivation and fan-out.
//! - **`watchdog`**: Link liveness and the availability alert.
//! - **`feed`**: Live broadcast to in-process subscribers.
//! - **`storage`** / **`alerting`**: Collaborator traits and their backends.
//! - **`service`**: `MonitorService`, which wires the pieces together.
//! - **`scheduler`**: Lifecycle, periodic hooks and the shutdown marker.
//! - **`config`**, **`logging`**, **`error`**: Ambient infrastructure.
//! - **`mock`**: Recording test doubles.

pub mod alerting;
pub mod config;
pub mod error;
pub mod feed;
pub mod logging;
pub mod measurement_types;
pub mod mock;
pub mod pipeline;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod watchdog;

pub use error::{AppResult, MonitorError};
