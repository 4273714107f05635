//! Async front door to the matching engine.
//!
//! Every operation, including idle expiry, goes through one
//! `tokio::sync::Mutex<Matchmaker>`. Nothing is awaited while the lock is
//! held except acquiring it. Geolocation runs in its own task after the
//! connection is already matching.

use crate::geo::GeoResolver;
use crate::journal::Journal;
use crate::matching::{DisconnectReason, MatchSettings, MatchStats, Matchmaker, Outbound};
use crate::moderation::IdleExpiry;
use duet_core::{ClientMessage, ConnId, DuetResult};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

#[derive(Clone)]
pub struct Hub {
    state: Arc<Mutex<Matchmaker>>,
    geo: Arc<GeoResolver>,
}

impl Hub {
    /// Build the engine and start the idle reaper. Must be called within a
    /// tokio runtime.
    pub fn new(settings: &MatchSettings, journal: Arc<dyn Journal>, geo: GeoResolver) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(Matchmaker::new(settings, journal, expired_tx)));
        tokio::spawn(reap_idle(Arc::downgrade(&state), expired_rx));
        Self {
            state,
            geo: Arc::new(geo),
        }
    }

    /// Register a new connection and attempt an immediate pairing.
    pub async fn connect(
        &self,
        id: ConnId,
        outbound: mpsc::Sender<Outbound>,
        remote_addr: Option<SocketAddr>,
    ) -> DuetResult<()> {
        self.state
            .lock()
            .await
            .connect(id.clone(), outbound, remote_addr)?;

        if let Some(addr) = remote_addr {
            if self.geo.is_enabled() {
                let geo = self.geo.clone();
                let state = Arc::downgrade(&self.state);
                tokio::spawn(async move {
                    let country = geo.country_for(addr.ip()).await;
                    if let Some(state) = state.upgrade() {
                        state.lock().await.set_country(&id, country);
                    }
                });
            }
        }
        Ok(())
    }

    /// Apply one client message.
    pub async fn dispatch(&self, id: &ConnId, msg: ClientMessage) {
        let mut mm = self.state.lock().await;
        match msg {
            ClientMessage::SetPreference { region } => mm.set_preference(id, region.as_deref()),
            ClientMessage::Activity => mm.activity(id),
            ClientMessage::Signal { to, data } => mm.signal(id, &to, data),
            ClientMessage::Next { partner_id } => {
                mm.request_next(id, partner_id.as_ref());
            }
            ClientMessage::ReportUser { partner_id } => {
                mm.report(id, &partner_id);
            }
        }
    }

    pub async fn disconnect(&self, id: &ConnId, reason: DisconnectReason) -> bool {
        self.state.lock().await.disconnect(id, reason)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connection_count()
    }

    /// Periodic housekeeping; returns current stats.
    pub async fn maintain(&self) -> MatchStats {
        let mut mm = self.state.lock().await;
        mm.gc();
        mm.stats()
    }
}

/// Apply idle expiries under the state lock until the hub is dropped.
async fn reap_idle(state: Weak<Mutex<Matchmaker>>, mut expired_rx: mpsc::UnboundedReceiver<IdleExpiry>) {
    while let Some(expiry) = expired_rx.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        let evicted = state.lock().await.expire_idle(&expiry);
        if !evicted {
            debug!(conn = %expiry.id, "stale idle expiry ignored");
        }
    }
}
