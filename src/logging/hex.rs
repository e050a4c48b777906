//! Hex formatting for packet log lines and injection payloads

use std::fmt::Write as _;

use thiserror::Error;

/// Errors from the lenient hex decoder
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexDecodeError {
    /// The cleaned hex string has an odd number of digits
    #[error("odd hex length: {0} digits")]
    OddLength(usize),

    /// A non-hex character survived cleaning
    #[error("invalid hex character: {0:?}")]
    InvalidCharacter(char),
}

/// Encode bytes as lowercase hex, single-space separated, no trailing space
#[must_use]
pub fn encode_spaced(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Decode a hex string, ignoring whitespace and an optional `0x` prefix
///
/// # Errors
///
/// Returns [`HexDecodeError`] on odd length or non-hex characters.
pub fn decode_lenient(input: &str) -> Result<Vec<u8>, HexDecodeError> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);

    if let Some(bad) = cleaned.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(HexDecodeError::InvalidCharacter(bad));
    }
    if cleaned.len() % 2 != 0 {
        return Err(HexDecodeError::OddLength(cleaned.len()));
    }

    let mut out = Vec::with_capacity(cleaned.len() / 2);
    for i in (0..cleaned.len()).step_by(2) {
        // Slicing is safe: all characters are ASCII hex digits
        let byte = u8::from_str_radix(&cleaned[i..i + 2], 16)
            .expect("validated hex digits");
        out.push(byte);
    }
    Ok(out)
}
