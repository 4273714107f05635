//! Session table: the active pairing of each connection.
//!
//! A session is stored once and indexed by both members, so closing it from
//! either side removes both views.

use duet_core::ConnId;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

/// An active pairing of exactly two connections.
#[derive(Debug, Clone)]
pub struct Session {
    /// Side that performed the match and originates the peer handshake.
    pub initiator: ConnId,
    pub responder: ConnId,
    /// Pool the match was drawn from.
    pub region: String,
    pub opened_at: Instant,
    /// Identifier assigned by the journal, if one is configured.
    pub record_id: Option<String>,
}

impl Session {
    /// The member that is not `id`.
    pub fn other(&self, id: &ConnId) -> &ConnId {
        if &self.initiator == id {
            &self.responder
        } else {
            &self.initiator
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.opened_at.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<u64, Session>,
    members: HashMap<ConnId, u64>,
    next_key: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pairing. Neither side may already be paired.
    pub fn open(
        &mut self,
        initiator: ConnId,
        responder: ConnId,
        region: String,
        record_id: Option<String>,
    ) -> &Session {
        debug_assert!(!self.members.contains_key(&initiator));
        debug_assert!(!self.members.contains_key(&responder));
        debug_assert_ne!(initiator, responder);

        let key = self.next_key;
        self.next_key += 1;

        info!(
            initiator = %initiator,
            responder = %responder,
            region = %region,
            "session opened"
        );

        self.members.insert(initiator.clone(), key);
        self.members.insert(responder.clone(), key);
        self.sessions.entry(key).or_insert(Session {
            initiator,
            responder,
            region,
            opened_at: Instant::now(),
            record_id,
        })
    }

    /// Close the session `id` belongs to, removing it for both members.
    pub fn close(&mut self, id: &ConnId) -> Option<Session> {
        let key = self.members.remove(id)?;
        let session = self.sessions.remove(&key)?;
        self.members.remove(session.other(id));
        debug!(
            initiator = %session.initiator,
            responder = %session.responder,
            region = %session.region,
            duration_ms = session.duration_ms(),
            "session closed"
        );
        Some(session)
    }

    #[cfg(test)]
    pub fn get(&self, id: &ConnId) -> Option<&Session> {
        self.members.get(id).and_then(|key| self.sessions.get(key))
    }

    #[cfg(test)]
    pub fn partner_of(&self, id: &ConnId) -> Option<&ConnId> {
        self.get(id).map(|s| s.other(id))
    }

    #[cfg(test)]
    pub fn is_paired(&self, id: &ConnId) -> bool {
        self.members.contains_key(id)
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ConnId {
        ConnId::from(s)
    }

    #[test]
    fn open_is_symmetric() {
        let mut table = SessionTable::new();
        table.open(id("a"), id("b"), "FR".into(), Some("rec1".into()));
        assert_eq!(table.partner_of(&id("a")), Some(&id("b")));
        assert_eq!(table.partner_of(&id("b")), Some(&id("a")));
        assert_eq!(table.get(&id("b")).unwrap().record_id.as_deref(), Some("rec1"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn close_from_either_side_removes_both() {
        let mut table = SessionTable::new();
        table.open(id("a"), id("b"), "Global".into(), None);
        let closed = table.close(&id("b")).unwrap();
        assert_eq!(closed.initiator, id("a"));
        assert!(!table.is_paired(&id("a")));
        assert!(!table.is_paired(&id("b")));
        assert!(table.close(&id("a")).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn independent_sessions() {
        let mut table = SessionTable::new();
        table.open(id("a"), id("b"), "Global".into(), None);
        table.open(id("c"), id("d"), "Global".into(), None);
        table.close(&id("a"));
        assert_eq!(table.partner_of(&id("c")), Some(&id("d")));
        assert_eq!(table.len(), 1);
    }
}
