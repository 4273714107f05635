//! Matching engine: connection registry, pairing queues, session table,
//! signaling relay, and the state machine tying them together.

pub mod matchmaker;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod sessions;

pub use matchmaker::{DisconnectReason, MatchSettings, MatchStats, Matchmaker};
pub use registry::{CloseReason, Outbound};
