//! Idle timers.
//!
//! One single-shot timer per connection. A firing timer does not touch shared
//! state itself: it sends an [`IdleExpiry`] to the hub's reaper, which takes
//! the state lock and checks the generation before disconnecting. An expiry
//! whose timer was re-armed or cancelled in the meantime is discarded.

use duet_core::ConnId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Notification that a connection's idle window elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleExpiry {
    pub id: ConnId,
    pub generation: u64,
}

struct IdleTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct IdleMonitor {
    timeout: Duration,
    timers: HashMap<ConnId, IdleTimer>,
    next_generation: u64,
    expired_tx: mpsc::UnboundedSender<IdleExpiry>,
}

impl IdleMonitor {
    /// Must be called from within a tokio runtime.
    pub fn new(timeout: Duration, expired_tx: mpsc::UnboundedSender<IdleExpiry>) -> Self {
        Self {
            timeout,
            timers: HashMap::new(),
            next_generation: 0,
            expired_tx,
        }
    }

    /// Start (or restart) the idle window for `id`.
    pub fn arm(&mut self, id: &ConnId) {
        self.cancel(id);

        self.next_generation += 1;
        let generation = self.next_generation;
        let timeout = self.timeout;
        let tx = self.expired_tx.clone();
        let expiry = IdleExpiry {
            id: id.clone(),
            generation,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(expiry);
        });

        trace!(conn = %id, generation, "idle timer armed");
        self.timers.insert(id.clone(), IdleTimer { generation, handle });
    }

    pub fn cancel(&mut self, id: &ConnId) {
        if let Some(timer) = self.timers.remove(id) {
            timer.handle.abort();
        }
    }

    /// Consume an expiry if it belongs to the currently armed timer.
    pub fn take_if_current(&mut self, expiry: &IdleExpiry) -> bool {
        match self.timers.get(&expiry.id) {
            Some(timer) if timer.generation == expiry.generation => {
                self.timers.remove(&expiry.id);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, id: &ConnId) -> bool {
        self.timers.contains_key(id)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn fires_after_window() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = IdleMonitor::new(WINDOW, tx);
        let id = ConnId::from("a");
        monitor.arm(&id);

        tokio::time::sleep(WINDOW - Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let expiry = rx.recv().await.unwrap();
        assert_eq!(expiry.id, id);
        assert!(monitor.take_if_current(&expiry));
        assert!(!monitor.is_armed(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_supersedes_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = IdleMonitor::new(WINDOW, tx);
        let id = ConnId::from("a");
        monitor.arm(&id);

        tokio::time::sleep(WINDOW - Duration::from_secs(10)).await;
        monitor.arm(&id);

        // Original deadline passes without an expiry
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(WINDOW).await;
        let expiry = rx.recv().await.unwrap();
        assert!(monitor.take_if_current(&expiry));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = IdleMonitor::new(WINDOW, tx);
        let id = ConnId::from("a");
        monitor.arm(&id);
        monitor.cancel(&id);

        tokio::time::sleep(WINDOW * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_generation_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut monitor = IdleMonitor::new(WINDOW, tx);
        let id = ConnId::from("a");
        monitor.arm(&id);
        monitor.arm(&id);
        let stale = IdleExpiry {
            id: id.clone(),
            generation: 1,
        };
        assert!(!monitor.take_if_current(&stale));
        assert!(monitor.is_armed(&id));
    }
}
