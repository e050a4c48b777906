//! Control-plane payload types
//!
//! JSON shapes exchanged with the external control plane. The engine status
//! payload is [`crate::engine::EngineStatus`].

use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::logging;

/// Encoding of an injection payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Hex,
    Ascii,
}

/// Packet injection request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectRequest {
    /// `upstream` or `downstream`
    pub target: String,
    pub format: PayloadFormat,
    pub data: String,
}

impl InjectRequest {
    /// Decode `data` according to `format`
    ///
    /// The hex decoder accepts an optional `0x` prefix and ignores
    /// whitespace and newlines.
    ///
    /// # Errors
    ///
    /// `ControlError::InvalidPayload` on odd-length or non-hex input.
    pub fn decode_payload(&self) -> Result<Vec<u8>, ControlError> {
        match self.format {
            PayloadFormat::Hex => Ok(logging::decode_lenient(&self.data)?),
            PayloadFormat::Ascii => Ok(self.data.clone().into_bytes()),
        }
    }
}

/// Kind of an enumerated client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Tcp,
    Web,
}

/// One entry of the client enumeration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    pub id: String,
    pub addr: String,
    pub connected_at: String,
    #[serde(rename = "type")]
    pub kind: ClientKind,
}
