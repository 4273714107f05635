//! Abuse report tallies.
//!
//! Sliding-window counter per reported connection. Every report counts once,
//! whoever filed it. Reaching the threshold is the caller's cue to
//! force-disconnect the target; the tally is cleared at that point.

use duet_core::ConnId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Result of filing a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Report counted; `count` reports are now inside the window.
    Counted { count: u32 },
    /// Threshold reached. The tally has been cleared.
    ThresholdReached { count: u32 },
}

#[derive(Debug)]
pub struct AbuseMonitor {
    /// Reports within the window that trigger disconnection.
    threshold: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-target report timestamps.
    tallies: HashMap<ConnId, Vec<Instant>>,
}

impl AbuseMonitor {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            tallies: HashMap::new(),
        }
    }

    /// Record one report against `target` at `now`.
    pub fn report(&mut self, target: &ConnId, now: Instant) -> ReportOutcome {
        let window = self.window;
        let reports = self.tallies.entry(target.clone()).or_default();

        // Remove expired entries
        reports.retain(|t| now.saturating_duration_since(*t) < window);
        reports.push(now);

        let count = reports.len() as u32;
        if count >= self.threshold {
            self.tallies.remove(target);
            ReportOutcome::ThresholdReached { count }
        } else {
            ReportOutcome::Counted { count }
        }
    }

    /// Reports against `target` still inside the window.
    #[cfg(test)]
    pub fn count(&self, target: &ConnId, now: Instant) -> u32 {
        self.tallies
            .get(target)
            .map(|reports| {
                reports
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < self.window)
                    .count() as u32
            })
            .unwrap_or(0)
    }

    /// Forget a target entirely (on disconnect).
    pub fn clear(&mut self, target: &ConnId) {
        self.tallies.remove(target);
    }

    /// Drop lapsed reports and empty tallies.
    pub fn gc(&mut self, now: Instant) {
        let window = self.window;
        self.tallies.retain(|_, reports| {
            reports.retain(|t| now.saturating_duration_since(*t) < window);
            !reports.is_empty()
        });
    }

    /// Number of targets with a live tally.
    pub fn tracked(&self) -> usize {
        self.tallies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn third_report_trips_and_clears() {
        let mut monitor = AbuseMonitor::new(3, HOUR);
        let target = ConnId::from("x");
        let t0 = Instant::now();

        assert_eq!(monitor.report(&target, t0), ReportOutcome::Counted { count: 1 });
        assert_eq!(monitor.report(&target, t0), ReportOutcome::Counted { count: 2 });
        assert_eq!(
            monitor.report(&target, t0 + Duration::from_secs(1)),
            ReportOutcome::ThresholdReached { count: 3 }
        );
        assert_eq!(monitor.count(&target, t0), 0);
        assert_eq!(monitor.tracked(), 0);
    }

    #[test]
    fn lapsed_reports_do_not_count() {
        let mut monitor = AbuseMonitor::new(3, HOUR);
        let target = ConnId::from("x");
        let t0 = Instant::now();

        monitor.report(&target, t0);
        monitor.report(&target, t0 + Duration::from_secs(10));
        let later = t0 + HOUR + Duration::from_secs(5);
        assert_eq!(monitor.report(&target, later), ReportOutcome::Counted { count: 2 });
    }

    #[test]
    fn targets_are_independent() {
        let mut monitor = AbuseMonitor::new(2, HOUR);
        let t0 = Instant::now();
        monitor.report(&ConnId::from("x"), t0);
        assert_eq!(
            monitor.report(&ConnId::from("y"), t0),
            ReportOutcome::Counted { count: 1 }
        );
    }

    #[test]
    fn clear_and_gc() {
        let mut monitor = AbuseMonitor::new(3, HOUR);
        let t0 = Instant::now();
        monitor.report(&ConnId::from("x"), t0);
        monitor.report(&ConnId::from("y"), t0);
        monitor.clear(&ConnId::from("x"));
        assert_eq!(monitor.tracked(), 1);

        monitor.gc(t0 + HOUR * 2);
        assert_eq!(monitor.tracked(), 0);
    }
}
