//! Moderation: abuse-report tallies and idle eviction.

pub mod idle;
pub mod reports;

pub use idle::{IdleExpiry, IdleMonitor};
pub use reports::{AbuseMonitor, ReportOutcome};
