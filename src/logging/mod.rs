//! Operator event log and hex packet formatting

mod hex;
mod logger;

pub use hex::{decode_lenient, encode_spaced, HexDecodeError};
pub use logger::{Direction, Level, LogCallback, Logger};
