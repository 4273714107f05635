//! Signaling protocol message types.
//!
//! Every frame is a JSON object tagged by `"type"`. Field names on the wire
//! are camelCase to match the browser client.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "duet-v1";

/// Region label for the shared overflow pool.
pub const GLOBAL_REGION: &str = "Global";

/// Identifier of a live connection. Never reused once the connection ends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(String);

impl ConnId {
    /// Generate a random identifier (8 bytes, 16 hex chars).
    pub fn random() -> Self {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Client → server ───────────────────────────────────────────────────

/// Messages a client may send after the WebSocket is open.
///
/// Connect and disconnect are the socket lifecycle itself and have no frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Update the region used for future pairing attempts.
    SetPreference {
        #[serde(default)]
        region: Option<String>,
    },
    /// Liveness signal; resets the idle timer.
    Activity,
    /// Opaque payload for another connection.
    Signal { to: ConnId, data: serde_json::Value },
    /// Leave the current partner and look for a new one.
    Next {
        #[serde(default, rename = "partnerId")]
        partner_id: Option<ConnId>,
    },
    /// Report a connection for abuse.
    ReportUser {
        #[serde(rename = "partnerId")]
        partner_id: ConnId,
    },
}

// ── Server → client ───────────────────────────────────────────────────

/// Notifications pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every connection: the identifier assigned to it.
    Welcome { id: ConnId },
    /// A partner was assigned. Exactly one side is the initiator.
    PartnerFound {
        #[serde(rename = "partnerId")]
        partner_id: ConnId,
        initiator: bool,
        region: String,
    },
    /// The current partner disconnected or moved on.
    PartnerLeft,
    /// Relayed signaling payload.
    Signal { from: ConnId, data: serde_json::Value },
    /// A frame could not be understood. The connection stays open.
    Error { message: String },
}
