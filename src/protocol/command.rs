//! Server → device commands.

use crate::measurement_types::CalibrationTarget;
use std::fmt;

/// A command understood by the meter firmware.
///
/// Every command is a single ASCII line. Numbers use `f64`'s shortest
/// round-trip `Display`, so `1.0` goes out as `1`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DeviceCommand {
    /// `d`: report firmware version and build date
    QueryBuildDate,
    /// `i`: report the calibration currently applied
    QueryCoefficients,
    /// `s<V>:<I>:<PF>`: apply a new calibration
    ProgramCalibration(CalibrationTarget),
}

impl DeviceCommand {
    /// The exact bytes to write, newline included.
    pub fn to_wire(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::QueryBuildDate => f.write_str("d"),
            DeviceCommand::QueryCoefficients => f.write_str("i"),
            DeviceCommand::ProgramCalibration(target) => write!(f, "s{target}"),
        }
    }
}
