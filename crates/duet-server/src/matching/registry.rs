//! Connection registry.
//!
//! Owns every live connection record, keyed by connection id. Queues and the
//! session table only ever hold ids that point back into this map.

use duet_core::{ConnId, DuetError, DuetResult, ServerMessage, GLOBAL_REGION};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Country label used until (or unless) geolocation resolves one.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// Why the server closed a connection on its own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Idle,
    Reported,
    ServerFull,
    Shutdown,
    /// Outbound buffer full when a pairing notification was due.
    Backlogged,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Idle => write!(f, "idle timeout"),
            CloseReason::Reported => write!(f, "reported"),
            CloseReason::ServerFull => write!(f, "server full"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
            CloseReason::Backlogged => write!(f, "outbound backlog"),
        }
    }
}

/// Item pushed to a connection's transport task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close(CloseReason),
}

/// A live connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    /// Region preference used for the next pairing attempt.
    pub region: String,
    /// Current partner, if paired.
    pub partner: Option<ConnId>,
    /// Country resolved from the remote address.
    pub country: String,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    outbound: mpsc::Sender<Outbound>,
}

impl Connection {
    /// Push a message to the connection. Best effort: a full or closed
    /// channel drops the message.
    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.outbound.try_send(Outbound::Message(msg)) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = %self.id, error = %e, "dropped outbound message");
                false
            }
        }
    }

    /// Ask the transport task to close the socket.
    pub fn close(&self, reason: CloseReason) {
        if self.outbound.try_send(Outbound::Close(reason)).is_err() {
            // Dropping the sender with the record still ends the transport loop.
            debug!(conn = %self.id, %reason, "close notice not delivered");
        }
    }
}

/// Normalize a client-supplied region label. Empty or absent means global.
pub fn normalize_region(region: Option<&str>) -> String {
    match region.map(str::trim) {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => GLOBAL_REGION.to_string(),
    }
}

/// Registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection under the global region.
    ///
    /// An id that is already live is rejected, never overwritten.
    pub fn register(
        &mut self,
        id: ConnId,
        outbound: mpsc::Sender<Outbound>,
        remote_addr: Option<SocketAddr>,
    ) -> DuetResult<&Connection> {
        if self.connections.contains_key(&id) {
            return Err(DuetError::DuplicateConnection(id.to_string()));
        }

        let now = Instant::now();
        let conn = Connection {
            id: id.clone(),
            region: GLOBAL_REGION.to_string(),
            partner: None,
            country: UNKNOWN_COUNTRY.to_string(),
            remote_addr,
            connected_at: now,
            last_activity: now,
            outbound,
        };
        info!(conn = %id, "connection registered");
        Ok(self.connections.entry(id).or_insert(conn))
    }

    /// Update the region preference. Returns false if the id is not live.
    pub fn set_preference(&mut self, id: &ConnId, region: Option<&str>) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) => {
                conn.region = normalize_region(region);
                debug!(conn = %id, region = %conn.region, "preference updated");
                true
            }
            None => false,
        }
    }

    /// Touch the last-activity timestamp.
    pub fn touch(&mut self, id: &ConnId) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.last_activity = Instant::now();
        }
    }

    pub fn set_partner(&mut self, id: &ConnId, partner: Option<ConnId>) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.partner = partner;
        }
    }

    pub fn set_country(&mut self, id: &ConnId, country: String) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.country = country;
        }
    }

    /// Remove a connection. No-op if absent.
    pub fn remove(&mut self, id: &ConnId) -> Option<Connection> {
        let removed = self.connections.remove(id);
        if removed.is_some() {
            debug!(conn = %id, "connection removed");
        }
        removed
    }

    pub fn get(&self, id: &ConnId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn contains(&self, id: &ConnId) -> bool {
        self.connections.contains_key(id)
    }

    /// Live and not currently paired.
    pub fn is_available(&self, id: &ConnId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|c| c.partner.is_none())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
