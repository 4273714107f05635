//! duet-core: Shared protocol library for the duet pairing server.
//!
//! Provides connection identifiers, the JSON message types exchanged over the
//! WebSocket, the text-frame codec, and the common error type.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_text, encode_text, MAX_FRAME_SIZE};
pub use error::{DuetError, DuetResult};
pub use messages::{ClientMessage, ConnId, ServerMessage, GLOBAL_REGION, PROTOCOL_VERSION};
