//! Line protocol spoken with the meter: frames in, commands out.

pub mod command;
pub mod frame;

pub use command::DeviceCommand;
pub use frame::{DecodeError, Decoded, DecoderStats, Frame, FrameDecoder};
