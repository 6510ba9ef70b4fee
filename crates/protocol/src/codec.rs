//! Frame codec.
//!
//! Browsers speak JSON over text frames; native clients may send MessagePack
//! over binary frames. Replies are written in the encoding of the frame that
//! carried the request, so a connection never has to negotiate up front.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};
use crate::messages::{Envelope, Outbound};

/// Maximum accepted inbound frame size (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Wire encoding of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF-8 JSON in a text frame.
    #[default]
    Json,
    /// MessagePack (named fields) in a binary frame.
    MessagePack,
}

impl Encoding {
    /// Serialize a value in this encoding.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec(value)?),
            Encoding::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    /// Deserialize a value from bytes in this encoding.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        match self {
            Encoding::Json => {
                let text = std::str::from_utf8(bytes)?;
                Ok(serde_json::from_str(text)?)
            }
            Encoding::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    /// Decode an inbound request envelope.
    pub fn decode_envelope(self, bytes: &[u8]) -> Result<Envelope> {
        self.decode(bytes)
    }

    /// Encode an outbound frame.
    pub fn encode_outbound(self, outbound: &Outbound) -> Result<Vec<u8>> {
        self.encode(outbound)
    }
}
