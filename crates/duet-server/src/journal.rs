//! Lifecycle journal: the persistence sink for analytics and moderation
//! history.
//!
//! Nothing in matching reads the journal back. Writes are fire-and-forget:
//! the JSON-lines implementation hands entries to a background task, so
//! recording never waits on disk while the matching lock is held.

use duet_core::ConnId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Lifecycle events written to the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    ConnectionOpened {
        id: ConnId,
        remote: Option<String>,
    },
    CountryResolved {
        id: ConnId,
        country: String,
    },
    ConnectionClosed {
        id: ConnId,
        reason: String,
        duration_ms: u64,
    },
    SessionOpened {
        session_id: String,
        initiator: ConnId,
        responder: ConnId,
        region: String,
    },
    SessionClosed {
        session_id: String,
        duration_ms: u64,
    },
    ReportFiled {
        reporter: ConnId,
        target: ConnId,
        count: u32,
    },
}

/// A single timestamped line in the journal file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub event: JournalEvent,
}

/// Persistence collaborator.
///
/// Implementations must not block: they are called with the matching state
/// locked.
pub trait Journal: Send + Sync {
    /// Record a lifecycle event.
    fn record(&self, event: JournalEvent);

    /// Record a new session and return its external record id, if this
    /// journal assigns one.
    fn open_session(&self, initiator: &ConnId, responder: &ConnId, region: &str) -> Option<String>;
}

/// Journal that persists nothing.
#[derive(Debug, Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn record(&self, _event: JournalEvent) {}

    fn open_session(&self, _initiator: &ConnId, _responder: &ConnId, _region: &str) -> Option<String> {
        None
    }
}

/// Journal appending newline-delimited JSON to a file.
pub struct JsonlJournal {
    path: PathBuf,
    tx: mpsc::UnboundedSender<JournalEntry>,
}

impl JsonlJournal {
    /// Start the background writer. Must be called within a tokio runtime.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(path.clone(), rx));
        Self { path, tx }
    }
}

impl Journal for JsonlJournal {
    fn record(&self, event: JournalEvent) {
        let entry = JournalEntry {
            timestamp_ms: now_ms(),
            event,
        };
        if self.tx.send(entry).is_err() {
            error!(path = %self.path.display(), "journal writer stopped, dropping event");
        }
    }

    fn open_session(&self, initiator: &ConnId, responder: &ConnId, region: &str) -> Option<String> {
        let session_id = generate_record_id();
        self.record(JournalEvent::SessionOpened {
            session_id: session_id.clone(),
            initiator: initiator.clone(),
            responder: responder.clone(),
            region: region.to_string(),
        });
        Some(session_id)
    }
}

async fn write_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<JournalEntry>) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!(path = %parent.display(), error = %e, "cannot create journal directory");
        }
    }

    let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot open journal, events will be dropped");
            // Keep draining so senders never see a closed channel.
            while rx.recv().await.is_some() {}
            return;
        }
    };
    debug!(path = %path.display(), "journal opened");

    while let Some(entry) = rx.recv().await {
        match serde_json::to_string(&entry) {
            Ok(mut line) => {
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!(path = %path.display(), error = %e, "failed to write journal entry");
                    continue;
                }
                if let Err(e) = file.flush().await {
                    error!(path = %path.display(), error = %e, "failed to flush journal");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to serialize journal entry");
            }
        }
    }
}

/// Read back a journal file, skipping malformed lines.
#[cfg(test)]
pub async fn load_journal(path: &std::path::Path) -> std::io::Result<Vec<JournalEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                error!(error = %e, "skipping malformed journal line");
            }
        }
    }
    Ok(entries)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Random record id (hex-encoded, 16 bytes = 32 hex chars).
fn generate_record_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
