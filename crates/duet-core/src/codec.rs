//! JSON text-frame codec for the signaling WebSocket.
//!
//! Wire format: one JSON object per WebSocket text frame.

use crate::error::{DuetError, DuetResult};

/// Largest frame accepted from a client (64 KiB). SDP offers with many ICE
/// candidates stay well below this.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Encode a serializable value into a text frame.
pub fn encode_text<T: serde::Serialize>(value: &T) -> DuetResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a text frame into a typed value.
pub fn decode_text<T: serde::de::DeserializeOwned>(text: &str) -> DuetResult<T> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(DuetError::InvalidMessage(format!(
            "frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(serde_json::from_str(text)?)
}
