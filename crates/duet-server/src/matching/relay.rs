//! Signaling relay: opaque forwarding between connections.

use super::registry::ConnectionRegistry;
use duet_core::{ConnId, ServerMessage};
use tracing::trace;

/// Forward `data` to `to`, tagged with `from`.
///
/// Best effort. An unknown target is indistinguishable from one that just
/// left, so it is dropped without telling the sender.
pub fn relay(registry: &ConnectionRegistry, from: &ConnId, to: &ConnId, data: serde_json::Value) -> bool {
    let Some(target) = registry.get(to) else {
        trace!(from = %from, to = %to, "signal target not live, dropping");
        return false;
    };
    target.send(ServerMessage::Signal {
        from: from.clone(),
        data,
    })
}
