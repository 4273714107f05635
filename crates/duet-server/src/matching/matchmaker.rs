//! Pairing state machine.
//!
//! `Matchmaker` is the single owner of all matching state: registry, queues,
//! session table, report tallies and idle timers. Its methods are the only
//! mutation entry points. It is synchronous; the hub serializes access behind
//! one lock, which is what makes pop-and-claim in [`Matchmaker::try_pair`]
//! atomic.
//!
//! Per-connection states: unmatched (queued or idle) → paired → unmatched
//! (next / partner left) → terminated (disconnect).

use super::queue::PairingQueue;
use super::registry::{CloseReason, ConnectionRegistry, Outbound};
use super::relay;
use super::sessions::SessionTable;
use crate::journal::{Journal, JournalEvent};
use crate::moderation::{AbuseMonitor, IdleExpiry, IdleMonitor, ReportOutcome};
use duet_core::{ConnId, DuetResult, ServerMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tunables for the matching engine.
#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub idle_timeout: Duration,
    pub report_threshold: u32,
    pub report_window: Duration,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            report_threshold: 3,
            report_window: Duration::from_secs(3600),
        }
    }
}

/// Why a connection left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Socket closed by the client or the network.
    ClientClosed,
    /// Forced by the server.
    Forced(CloseReason),
}

impl DisconnectReason {
    fn label(&self) -> String {
        match self {
            DisconnectReason::ClientClosed => "client closed".to_string(),
            DisconnectReason::Forced(reason) => reason.to_string(),
        }
    }
}

/// Point-in-time counters for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchStats {
    pub connections: usize,
    pub queued: usize,
    pub sessions: usize,
    pub reported: usize,
}

pub struct Matchmaker {
    registry: ConnectionRegistry,
    queue: PairingQueue,
    sessions: SessionTable,
    reports: AbuseMonitor,
    idle: IdleMonitor,
    journal: Arc<dyn Journal>,
}

impl Matchmaker {
    /// Must be called from within a tokio runtime (idle timers are tasks).
    pub fn new(
        settings: &MatchSettings,
        journal: Arc<dyn Journal>,
        expired_tx: mpsc::UnboundedSender<IdleExpiry>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            queue: PairingQueue::new(),
            sessions: SessionTable::new(),
            reports: AbuseMonitor::new(settings.report_threshold, settings.report_window),
            idle: IdleMonitor::new(settings.idle_timeout, expired_tx),
            journal,
        }
    }

    /// Register a connection, arm its idle timer, and try to pair it at once
    /// under the global region.
    pub fn connect(
        &mut self,
        id: ConnId,
        outbound: mpsc::Sender<Outbound>,
        remote_addr: Option<SocketAddr>,
    ) -> DuetResult<()> {
        let conn = self.registry.register(id.clone(), outbound, remote_addr)?;
        conn.send(ServerMessage::Welcome { id: id.clone() });

        self.idle.arm(&id);
        self.journal.record(JournalEvent::ConnectionOpened {
            id: id.clone(),
            remote: remote_addr.map(|a| a.to_string()),
        });

        self.try_pair(&id);
        Ok(())
    }

    /// Store a new region preference. An active session is unaffected.
    pub fn set_preference(&mut self, id: &ConnId, region: Option<&str>) {
        self.registry.set_preference(id, region);
    }

    /// Liveness signal: restart the idle window.
    pub fn activity(&mut self, id: &ConnId) {
        if !self.registry.contains(id) {
            return;
        }
        self.registry.touch(id);
        self.idle.arm(id);
    }

    /// Relay a signaling payload. Unknown targets are ignored.
    pub fn signal(&mut self, from: &ConnId, to: &ConnId, data: serde_json::Value) {
        relay::relay(&self.registry, from, to, data);
    }

    /// Pair `id` with the first usable waiter, or enqueue it.
    ///
    /// Returns the partner on success. The side calling this is the
    /// initiator. A side whose outbound buffer cannot take the notification
    /// is disconnected and the other side looks again.
    pub fn try_pair(&mut self, id: &ConnId) -> Option<ConnId> {
        let conn = self.registry.get(id)?;
        if conn.partner.is_some() {
            return None;
        }
        let region = conn.region.clone();

        self.queue.remove(id);
        let registry = &self.registry;
        let found = self
            .queue
            .find_partner(&region, id, |candidate| registry.is_available(candidate));

        let Some((partner, pool)) = found else {
            debug!(conn = %id, region = %region, "no partner available, queued");
            self.queue.enqueue(id.clone(), &region);
            return None;
        };

        self.queue.remove(&partner);

        let record_id = self.journal.open_session(id, &partner, &pool);
        self.sessions
            .open(id.clone(), partner.clone(), pool.clone(), record_id);
        self.registry.set_partner(id, Some(partner.clone()));
        self.registry.set_partner(&partner, Some(id.clone()));

        let initiator_told = self.registry.get(id).is_some_and(|conn| {
            conn.send(ServerMessage::PartnerFound {
                partner_id: partner.clone(),
                initiator: true,
                region: pool.clone(),
            })
        });
        let responder_told = self.registry.get(&partner).is_some_and(|conn| {
            conn.send(ServerMessage::PartnerFound {
                partner_id: id.clone(),
                initiator: false,
                region: pool,
            })
        });

        match (initiator_told, responder_told) {
            (true, true) => Some(partner),
            (true, false) => {
                self.drop_backlogged(&partner);
                self.try_pair(id)
            }
            (false, true) => {
                self.drop_backlogged(id);
                self.try_pair(&partner);
                None
            }
            (false, false) => {
                self.drop_backlogged(id);
                self.drop_backlogged(&partner);
                None
            }
        }
    }

    /// Disconnect a side that missed its pairing notification.
    fn drop_backlogged(&mut self, id: &ConnId) {
        warn!(conn = %id, "pairing notification not delivered, disconnecting");
        self.disconnect(id, DisconnectReason::Forced(CloseReason::Backlogged));
    }

    /// Leave the current partner (if any) and look for a new one.
    ///
    /// The old partner is notified and left unmatched; only the requester
    /// re-enters the pool. `claimed` is the partner the client believes it
    /// has and is only used for logging.
    pub fn request_next(&mut self, id: &ConnId, claimed: Option<&ConnId>) -> Option<ConnId> {
        if !self.registry.contains(id) {
            return None;
        }
        let previous = self.teardown_session(id);
        if let Some(claimed) = claimed {
            if previous.as_ref() != Some(claimed) {
                debug!(conn = %id, claimed = %claimed, "next named a stale partner");
            }
        }
        self.try_pair(id)
    }

    /// File an abuse report. Force-disconnects the target once the threshold
    /// is reached inside the window.
    pub fn report(&mut self, reporter: &ConnId, target: &ConnId) -> Option<ReportOutcome> {
        if !self.registry.contains(target) {
            debug!(reporter = %reporter, target = %target, "report against non-live target ignored");
            return None;
        }

        let outcome = self.reports.report(target, Instant::now());
        let count = match outcome {
            ReportOutcome::Counted { count } | ReportOutcome::ThresholdReached { count } => count,
        };
        self.journal.record(JournalEvent::ReportFiled {
            reporter: reporter.clone(),
            target: target.clone(),
            count,
        });

        if let ReportOutcome::ThresholdReached { .. } = outcome {
            warn!(target = %target, count, "report threshold reached, disconnecting");
            self.disconnect(target, DisconnectReason::Forced(CloseReason::Reported));
        } else {
            info!(target = %target, count, "report filed");
        }
        Some(outcome)
    }

    /// Terminal teardown. Idempotent: returns false if `id` was not live.
    pub fn disconnect(&mut self, id: &ConnId, reason: DisconnectReason) -> bool {
        self.idle.cancel(id);
        self.teardown_session(id);
        self.queue.remove(id);
        self.reports.clear(id);

        let Some(conn) = self.registry.remove(id) else {
            return false;
        };
        if let DisconnectReason::Forced(close) = reason {
            conn.close(close);
        }
        info!(
            conn = %id,
            reason = %reason.label(),
            country = %conn.country,
            remote = ?conn.remote_addr,
            idle_secs = conn.last_activity.elapsed().as_secs(),
            "connection closed"
        );
        self.journal.record(JournalEvent::ConnectionClosed {
            id: id.clone(),
            reason: reason.label(),
            duration_ms: conn.connected_at.elapsed().as_millis() as u64,
        });
        true
    }

    /// Handle an idle timer firing. Stale expiries are ignored.
    pub fn expire_idle(&mut self, expiry: &IdleExpiry) -> bool {
        if !self.idle.take_if_current(expiry) {
            return false;
        }
        warn!(conn = %expiry.id, timeout_secs = self.idle.timeout().as_secs(), "idle timeout");
        self.disconnect(&expiry.id, DisconnectReason::Forced(CloseReason::Idle))
    }

    /// Record the geolocated country for a connection.
    pub fn set_country(&mut self, id: &ConnId, country: String) {
        if !self.registry.contains(id) {
            return;
        }
        self.journal.record(JournalEvent::CountryResolved {
            id: id.clone(),
            country: country.clone(),
        });
        self.registry.set_country(id, country);
    }

    /// Drop lapsed report tallies.
    pub fn gc(&mut self) {
        self.reports.gc(Instant::now());
    }

    pub fn stats(&self) -> MatchStats {
        MatchStats {
            connections: self.registry.len(),
            queued: self.queue.len(),
            sessions: self.sessions.len(),
            reported: self.reports.tracked(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Current partner of `id`, if paired.
    #[cfg(test)]
    pub fn partner_of(&self, id: &ConnId) -> Option<&ConnId> {
        self.sessions.partner_of(id)
    }

    /// Whether `id` is waiting in a queue.
    #[cfg(test)]
    pub fn is_queued(&self, id: &ConnId) -> bool {
        self.queue.contains(id)
    }

    /// Close the session `id` belongs to and notify the other side, which
    /// becomes unmatched without being re-queued. Returns the ex-partner.
    fn teardown_session(&mut self, id: &ConnId) -> Option<ConnId> {
        let Some(session) = self.sessions.close(id) else {
            // No session: clear any dangling back-reference.
            self.registry.set_partner(id, None);
            return None;
        };
        let other = session.other(id).clone();

        self.registry.set_partner(id, None);
        self.registry.set_partner(&other, None);
        if let Some(record_id) = &session.record_id {
            self.journal.record(JournalEvent::SessionClosed {
                session_id: record_id.clone(),
                duration_ms: session.duration_ms(),
            });
        }

        if let Some(conn) = self.registry.get(&other) {
            conn.send(ServerMessage::PartnerLeft);
        }
        debug!(conn = %id, partner = %other, "session torn down");
        Some(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::NullJournal;
    use duet_core::GLOBAL_REGION;
    use serde_json::json;
    use std::sync::Mutex;

    /// Journal capturing events in memory.
    #[derive(Default)]
    struct MemoryJournal {
        events: Mutex<Vec<JournalEvent>>,
    }

    impl Journal for MemoryJournal {
        fn record(&self, event: JournalEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn open_session(&self, initiator: &ConnId, responder: &ConnId, region: &str) -> Option<String> {
            let id = format!("{initiator}-{responder}");
            self.record(JournalEvent::SessionOpened {
                session_id: id.clone(),
                initiator: initiator.clone(),
                responder: responder.clone(),
                region: region.to_string(),
            });
            Some(id)
        }
    }

    struct Harness {
        mm: Matchmaker,
        expired_rx: mpsc::UnboundedReceiver<IdleExpiry>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_journal(Arc::new(NullJournal))
        }

        fn with_journal(journal: Arc<dyn Journal>) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                mm: Matchmaker::new(&MatchSettings::default(), journal, tx),
                expired_rx: rx,
            }
        }

        /// Connect `name` and return its transport receiver, with the
        /// welcome frame already consumed.
        fn connect(&mut self, name: &str) -> mpsc::Receiver<Outbound> {
            let (tx, mut rx) = mpsc::channel(32);
            self.mm.connect(ConnId::from(name), tx, None).unwrap();
            assert_eq!(
                rx.try_recv().unwrap(),
                Outbound::Message(ServerMessage::Welcome {
                    id: ConnId::from(name)
                })
            );
            rx
        }
    }

    fn id(s: &str) -> ConnId {
        ConnId::from(s)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn found(partner: &str, initiator: bool, region: &str) -> Outbound {
        Outbound::Message(ServerMessage::PartnerFound {
            partner_id: id(partner),
            initiator,
            region: region.to_string(),
        })
    }

    #[tokio::test]
    async fn second_connection_pairs_as_initiator() {
        let mut h = Harness::new();
        let mut a = h.connect("a");
        assert!(h.mm.is_queued(&id("a")));
        assert!(drain(&mut a).is_empty());

        let mut b = h.connect("b");
        assert_eq!(drain(&mut b), vec![found("a", true, GLOBAL_REGION)]);
        assert_eq!(drain(&mut a), vec![found("b", false, GLOBAL_REGION)]);
        assert_eq!(h.mm.partner_of(&id("a")), Some(&id("b")));
        assert!(!h.mm.is_queued(&id("a")));
        assert!(!h.mm.is_queued(&id("b")));
    }

    #[tokio::test]
    async fn region_match_preferred_over_global() {
        let mut h = Harness::new();
        let _g = h.connect("g");
        let _f = h.connect("f");
        // g and f paired immediately; free them so both wait unmatched.
        h.mm.disconnect(&id("g"), DisconnectReason::ClientClosed);
        h.mm.set_preference(&id("f"), Some("FR"));
        h.mm.request_next(&id("f"), None);
        assert!(h.mm.is_queued(&id("f")));

        let _g2 = h.connect("g2");
        assert!(h.mm.is_queued(&id("g2")));

        let mut x = h.connect("x");
        h.mm.set_preference(&id("x"), Some("FR"));
        h.mm.request_next(&id("x"), None);
        // x was paired with g2 on connect; next released it into FR.
        assert_eq!(h.mm.partner_of(&id("x")), Some(&id("f")));
        let msgs = drain(&mut x);
        assert_eq!(msgs.last(), Some(&found("f", true, "FR")));
    }

    #[tokio::test]
    async fn partner_found_labels_the_queue_popped_from() {
        let mut h = Harness::new();
        let mut c = h.connect("c");
        let _e = h.connect("e");
        // Release c into the FR queue, then change its preference while it waits.
        h.mm.set_preference(&id("c"), Some("FR"));
        h.mm.request_next(&id("c"), None);
        h.mm.set_preference(&id("c"), Some("DE"));
        drain(&mut c);

        let mut d = h.connect("d");
        h.mm.set_preference(&id("d"), Some("FR"));
        h.mm.request_next(&id("d"), None);

        assert_eq!(drain(&mut d), vec![found("c", true, "FR")]);
        assert_eq!(drain(&mut c), vec![found("d", false, "FR")]);
    }

    #[tokio::test]
    async fn global_pop_labelled_global_despite_region_preference() {
        let mut h = Harness::new();
        let mut x = h.connect("x");
        let _y = h.connect("y");
        drain(&mut x);

        // g waits in the global queue but now prefers FR.
        let mut g = h.connect("g");
        h.mm.set_preference(&id("g"), Some("FR"));
        drain(&mut g);

        h.mm.set_preference(&id("x"), Some("FR"));
        h.mm.request_next(&id("x"), None);
        assert_eq!(drain(&mut x), vec![found("g", true, GLOBAL_REGION)]);
        assert_eq!(drain(&mut g), vec![found("x", false, GLOBAL_REGION)]);
    }

    #[tokio::test]
    async fn undeliverable_pairing_disconnects_the_backlogged_side() {
        let mut h = Harness::new();
        // One-slot buffer, filled by the welcome frame.
        let (tx, mut stuck) = mpsc::channel(1);
        h.mm.connect(id("stuck"), tx, None).unwrap();

        let mut b = h.connect("b");
        assert_eq!(
            drain(&mut b),
            vec![
                found("stuck", true, GLOBAL_REGION),
                Outbound::Message(ServerMessage::PartnerLeft),
            ]
        );
        assert_eq!(h.mm.connection_count(), 1);
        assert!(h.mm.is_queued(&id("b")));
        assert_eq!(h.mm.partner_of(&id("b")), None);

        // Only the welcome made it; the record and its sender are gone.
        assert!(matches!(
            stuck.try_recv(),
            Ok(Outbound::Message(ServerMessage::Welcome { .. }))
        ));
        assert!(matches!(
            stuck.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // b is found by the next arrival.
        let mut c = h.connect("c");
        assert_eq!(drain(&mut c), vec![found("b", true, GLOBAL_REGION)]);
    }

    #[tokio::test]
    async fn disconnect_notifies_partner_once_without_requeue() {
        let mut h = Harness::new();
        let mut a = h.connect("a");
        let mut b = h.connect("b");
        drain(&mut a);
        drain(&mut b);

        assert!(h.mm.disconnect(&id("a"), DisconnectReason::ClientClosed));
        assert!(!h.mm.disconnect(&id("a"), DisconnectReason::ClientClosed));

        assert_eq!(drain(&mut b), vec![Outbound::Message(ServerMessage::PartnerLeft)]);
        assert_eq!(h.mm.partner_of(&id("b")), None);
        assert!(!h.mm.is_queued(&id("b")));
        // Client-initiated close sends no close notice.
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn next_requeues_only_the_requester() {
        let mut h = Harness::new();
        let mut a = h.connect("a");
        let mut b = h.connect("b");
        drain(&mut a);
        drain(&mut b);

        assert_eq!(h.mm.request_next(&id("a"), Some(&id("b"))), None);
        assert_eq!(drain(&mut b), vec![Outbound::Message(ServerMessage::PartnerLeft)]);
        assert!(drain(&mut a).is_empty());
        assert!(h.mm.is_queued(&id("a")));
        assert!(!h.mm.is_queued(&id("b")));
        assert_eq!(h.mm.stats().queued, 1);

        // The newcomer meets a, not the unqueued b.
        let mut c = h.connect("c");
        assert_eq!(drain(&mut c), vec![found("a", true, GLOBAL_REGION)]);
    }

    #[tokio::test]
    async fn next_without_partner_just_enqueues_once() {
        let mut h = Harness::new();
        let _a = h.connect("a");
        h.mm.request_next(&id("a"), None);
        h.mm.request_next(&id("a"), None);
        assert_eq!(h.mm.stats().queued, 1);
    }

    #[tokio::test]
    async fn signal_relayed_to_partner() {
        let mut h = Harness::new();
        let mut a = h.connect("a");
        let _b = h.connect("b");
        drain(&mut a);

        h.mm.signal(&id("b"), &id("a"), json!({"type": "offer"}));
        h.mm.signal(&id("b"), &id("ghost"), json!(1));
        assert_eq!(
            drain(&mut a),
            vec![Outbound::Message(ServerMessage::Signal {
                from: id("b"),
                data: json!({"type": "offer"}),
            })]
        );
    }

    #[tokio::test]
    async fn three_reports_force_disconnect_once() {
        let journal = Arc::new(MemoryJournal::default());
        let mut h = Harness::with_journal(journal.clone());
        let mut x = h.connect("x");
        let mut p = h.connect("p");
        let _r = h.connect("r");
        drain(&mut x);
        drain(&mut p);

        assert_eq!(
            h.mm.report(&id("p"), &id("x")),
            Some(ReportOutcome::Counted { count: 1 })
        );
        assert_eq!(
            h.mm.report(&id("p"), &id("x")),
            Some(ReportOutcome::Counted { count: 2 })
        );
        assert!(drain(&mut x).is_empty());

        assert_eq!(
            h.mm.report(&id("r"), &id("x")),
            Some(ReportOutcome::ThresholdReached { count: 3 })
        );
        assert_eq!(drain(&mut x), vec![Outbound::Close(CloseReason::Reported)]);
        assert_eq!(drain(&mut p), vec![Outbound::Message(ServerMessage::PartnerLeft)]);

        // Target gone: further reports are ignored.
        assert_eq!(h.mm.report(&id("r"), &id("x")), None);
        assert_eq!(h.mm.stats().reported, 0);

        let events = journal.events.lock().unwrap();
        let closes = events
            .iter()
            .filter(|e| matches!(e, JournalEvent::ConnectionClosed { id: c, .. } if *c == id("x")))
            .count();
        assert_eq!(closes, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, JournalEvent::SessionClosed { session_id, .. } if session_id == "p-x")));
    }

    #[tokio::test]
    async fn two_reports_do_not_disconnect() {
        let mut h = Harness::new();
        let _x = h.connect("x");
        h.mm.report(&id("a"), &id("x"));
        h.mm.report(&id("b"), &id("x"));
        assert_eq!(h.mm.connection_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_connect_rejected() {
        let mut h = Harness::new();
        let _a = h.connect("a");
        let (tx, _rx) = mpsc::channel(4);
        assert!(h.mm.connect(id("a"), tx, None).is_err());
        assert_eq!(h.mm.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_evicted_once() {
        let mut h = Harness::new();
        let mut a = h.connect("a");
        let mut b = h.connect("b");
        drain(&mut a);
        drain(&mut b);

        // Keep b alive halfway through.
        tokio::time::sleep(Duration::from_secs(200)).await;
        h.mm.activity(&id("b"));

        tokio::time::sleep(Duration::from_secs(101)).await;
        let expiry = h.expired_rx.recv().await.unwrap();
        assert_eq!(expiry.id, id("a"));
        assert!(h.mm.expire_idle(&expiry));
        assert!(!h.mm.expire_idle(&expiry));

        assert_eq!(drain(&mut a), vec![Outbound::Close(CloseReason::Idle)]);
        assert_eq!(drain(&mut b), vec![Outbound::Message(ServerMessage::PartnerLeft)]);
        assert_eq!(h.mm.connection_count(), 1);
        assert!(h.expired_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_expiry_after_disconnect_ignored() {
        let mut h = Harness::new();
        let _a = h.connect("a");
        h.mm.disconnect(&id("a"), DisconnectReason::ClientClosed);
        let expiry = IdleExpiry {
            id: id("a"),
            generation: 1,
        };
        assert!(!h.mm.expire_idle(&expiry));
    }

    #[tokio::test]
    async fn country_recorded_for_live_connection_only() {
        let journal = Arc::new(MemoryJournal::default());
        let mut h = Harness::with_journal(journal.clone());
        let _a = h.connect("a");
        h.mm.set_country(&id("a"), "FR".into());
        h.mm.set_country(&id("ghost"), "DE".into());
        let resolved = journal
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, JournalEvent::CountryResolved { .. }))
            .count();
        assert_eq!(resolved, 1);
    }
}
