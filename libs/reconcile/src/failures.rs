//! Consecutive failure tracking.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Counts consecutive failures per key inside a time window.
///
/// The reconciler retries every failure on the next tick anyway; the tracker
/// only decides when a repeating failure deserves louder reporting.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    /// Failures tolerated before a key counts as escalated.
    threshold: u32,

    /// Window after which a key's count starts over.
    window: Duration,

    /// key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl FailureTracker {
    /// Create a new failure tracker.
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a key and return its consecutive count.
    pub fn record_failure(&mut self, key: &str) -> u32 {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count
    }

    /// Returns true once a key has failed more often than the threshold.
    pub fn is_escalated(&self, key: &str) -> bool {
        self.count(key) > self.threshold
    }

    /// Current consecutive failure count for a key.
    pub fn count(&self, key: &str) -> u32 {
        match self.failures.get(key) {
            Some((count, first)) if first.elapsed() <= self.window => *count,
            _ => 0,
        }
    }

    /// Forget a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Drop every key owned by `owner`.
    ///
    /// Keys are `{owner}/{kind}`, where `kind` never contains `/`. The owner
    /// is matched whole, so clearing `a` leaves `a/b/...` alone.
    pub fn clear_owner(&mut self, owner: &str) {
        self.failures
            .retain(|key, _| key.rsplit_once('/').map(|(o, _)| o) != Some(owner));
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| first.elapsed() <= window);
    }
}
