//! Device → server frame decoding.
//!
//! The meter prints one JSON object per line, interleaved with whatever else
//! the firmware happens to write (boot banners, half-flushed lines after a
//! reset). Decoding therefore happens in two stages:
//!
//! 1. A cheap structural test: after trimming, the line must start with `{`,
//!    end with `}` and contain an even number of `"`. Anything else is
//!    [`Decoded::Noise`] and is dropped at debug level.
//! 2. JSON parsing and dispatch on the `type` discriminator. A line that passed
//!    stage 1 but fails here is a [`DecodeError`], logged at error level with
//!    the raw payload.
//!
//! # Wire format
//!
//! ```text
//! {"type":"data","voltage":<num>,"current":<num>}
//! {"type":"coefficients","voltage":<num>,"current":<num>,"powerFactor":<num>}
//! {"type":"info","version":"<string>","date":"<string>"}
//! ```

use crate::measurement_types::{BoardVersion, CalibrationTarget};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// A decoded unit of device telemetry.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Periodic voltage/current sample
    Measurement {
        /// Volts
        voltage: f64,
        /// Amperes
        current: f64,
    },
    /// Calibration readback
    Coefficients(CalibrationTarget),
    /// Firmware identification
    Info(BoardVersion),
}

impl Frame {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Measurement { .. } => "data",
            Frame::Coefficients(_) => "coefficients",
            Frame::Info(_) => "info",
        }
    }
}

/// Why a structurally valid line was still rejected.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The line looked like JSON but did not parse
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),

    /// The `type` discriminator is missing or not one we know
    #[error("unknown frame type {0:?}")]
    UnknownType(Option<String>),

    /// Known `type`, but required fields are missing or mistyped
    #[error("malformed '{kind}' frame: {source}")]
    Malformed {
        /// The `type` value of the frame
        kind: String,
        /// Field-level deserialization failure
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of decoding one line.
#[derive(Debug)]
pub enum Decoded {
    /// A typed frame
    Frame(Frame),
    /// Not JSON-bearing; silently dropped
    Noise,
    /// JSON-bearing but unusable
    Error(DecodeError),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireFrame {
    Data {
        voltage: f64,
        current: f64,
    },
    Coefficients {
        voltage: f64,
        current: f64,
        #[serde(rename = "powerFactor")]
        power_factor: f64,
    },
    Info {
        version: String,
        date: String,
    },
}

const KNOWN_TYPES: [&str; 3] = ["data", "coefficients", "info"];

impl From<WireFrame> for Frame {
    fn from(wire: WireFrame) -> Self {
        match wire {
            WireFrame::Data { voltage, current } => Frame::Measurement { voltage, current },
            WireFrame::Coefficients {
                voltage,
                current,
                power_factor,
            } => Frame::Coefficients(CalibrationTarget::new(voltage, current, power_factor)),
            WireFrame::Info { version, date } => Frame::Info(BoardVersion::from_raw(version, date)),
        }
    }
}

/// Structural pre-check: braces at both ends and balanced quotes.
pub fn is_json_bearing(line: &str) -> bool {
    line.starts_with('{') && line.ends_with('}') && line.matches('"').count() % 2 == 0
}

/// Decode a raw line without logging. See [`FrameDecoder::decode`].
pub fn decode_line(raw: &str) -> Decoded {
    let line = raw.trim();
    if !is_json_bearing(line) {
        return Decoded::Noise;
    }

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => return Decoded::Error(DecodeError::Json(err)),
    };

    let kind = value.get("type").and_then(|t| t.as_str()).map(str::to_owned);
    match kind {
        Some(kind) if KNOWN_TYPES.contains(&kind.as_str()) => {
            match serde_json::from_value::<WireFrame>(value) {
                Ok(wire) => Decoded::Frame(wire.into()),
                Err(source) => Decoded::Error(DecodeError::Malformed { kind, source }),
            }
        }
        other => Decoded::Error(DecodeError::UnknownType(other)),
    }
}

/// Escape control characters so a raw line is safe to put in a log record.
pub fn escape_control(raw: &str) -> String {
    raw.chars()
        .flat_map(|c| {
            let escaped: Vec<char> = if c.is_control() {
                c.escape_default().collect()
            } else {
                vec![c]
            };
            escaped
        })
        .collect()
}

/// Counters describing what the decoder has seen so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Successfully decoded frames
    pub frames: u64,
    /// Lines dropped as noise
    pub noise: u64,
    /// JSON-bearing lines that could not be used
    pub errors: u64,
}

/// Stateless decoder that logs each outcome and keeps running counters.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    frames: AtomicU64,
    noise: AtomicU64,
    errors: AtomicU64,
}

impl FrameDecoder {
    /// Create a decoder with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one raw line and log the outcome.
    ///
    /// Noise is logged at debug level, unknown frame types at warn and every
    /// other decode failure at error level together with the escaped raw line.
    pub fn decode(&self, raw: &str) -> Decoded {
        let decoded = decode_line(raw);
        match &decoded {
            Decoded::Frame(frame) => {
                self.frames.fetch_add(1, Ordering::Relaxed);
                debug!(kind = frame.kind(), "Decoded frame");
            }
            Decoded::Noise => {
                self.noise.fetch_add(1, Ordering::Relaxed);
                debug!(line = %escape_control(raw), "Discarding non-frame serial line");
            }
            Decoded::Error(err @ DecodeError::UnknownType(_)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(line = %escape_control(raw), "Dropping frame: {err}");
            }
            Decoded::Error(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                error!(line = %escape_control(raw), "Failed to decode serial frame: {err}");
            }
        }
        decoded
    }

    /// Snapshot of the running counters.
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames: self.frames.load(Ordering::Relaxed),
            noise: self.noise.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn frame(raw: &str) -> Frame {
        match decode_line(raw) {
            Decoded::Frame(frame) => frame,
            other => panic!("expected frame for {raw:?}, got {other:?}"),
        }
    }

    #[test]
    fn measurement_with_carriage_return() {
        assert_eq!(
            frame("{\"type\":\"data\",\"voltage\":230,\"current\":5}\r"),
            Frame::Measurement {
                voltage: 230.0,
                current: 5.0
            }
        );
    }

    #[test]
    fn coefficients_frame() {
        assert_eq!(
            frame(r#"{"type":"coefficients","voltage":1.02,"current":0.99,"powerFactor":1}"#),
            Frame::Coefficients(CalibrationTarget::new(1.02, 0.99, 1.0))
        );
    }

    #[test]
    fn info_frame_keeps_raw_date() {
        match frame(r#"{"type":"info","version":"2.1.0","date":"2024-03-05T12:34:56"}"#) {
            Frame::Info(info) => {
                assert_eq!(info.version, "2.1.0");
                assert_eq!(info.build_date_raw, "2024-03-05T12:34:56");
                assert!(info.build_date.is_some());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn extra_fields_are_ignored() {
        // Older firmware also reports its own power estimate.
        assert!(matches!(
            frame(r#"{"type":"data","voltage":1,"current":2,"power":3}"#),
            Frame::Measurement { .. }
        ));
    }

    #[test]
    fn structural_noise() {
        for raw in [
            "",
            "   ",
            "PowerMonitor v2 booting...",
            "{\"type\":\"data\",\"voltage\":23",
            "\"type\":\"data\"}",
            "{\"type\":\"data\",\"voltage\":230,\"current\":5}garbage",
            "{\"type:\"data\"}",
        ] {
            assert!(
                matches!(decode_line(raw), Decoded::Noise),
                "{raw:?} should be noise"
            );
        }
    }

    #[test]
    fn balanced_but_invalid_json_is_an_error() {
        assert!(matches!(
            decode_line("{\"type\" \"data\"}"),
            Decoded::Error(DecodeError::Json(_))
        ));
    }

    #[test]
    fn unknown_and_missing_type() {
        assert!(matches!(
            decode_line(r#"{"type":"debug","msg":"x"}"#),
            Decoded::Error(DecodeError::UnknownType(Some(ref t))) if t == "debug"
        ));
        assert!(matches!(
            decode_line(r#"{"voltage":1}"#),
            Decoded::Error(DecodeError::UnknownType(None))
        ));
    }

    #[test]
    fn missing_field_is_malformed() {
        assert!(matches!(
            decode_line(r#"{"type":"data","voltage":1}"#),
            Decoded::Error(DecodeError::Malformed { ref kind, .. }) if kind == "data"
        ));
    }

    #[test]
    fn control_characters_are_escaped() {
        assert_eq!(escape_control("{a}\r\u{7}"), "{a}\\r\\u{7}");
    }

    #[test]
    #[traced_test]
    fn decoder_logs_and_counts() {
        let decoder = FrameDecoder::new();
        decoder.decode("boot banner");
        decoder.decode("{\"type\" 1}");
        decoder.decode(r#"{"type":"data","voltage":1,"current":1}"#);

        assert_eq!(
            decoder.stats(),
            DecoderStats {
                frames: 1,
                noise: 1,
                errors: 1
            }
        );
        assert!(logs_contain("Failed to decode serial frame"));
    }
}
