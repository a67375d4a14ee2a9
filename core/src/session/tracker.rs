//! Per-host connection bookkeeping.
//!
//! `ConnectionTracker` records the state of each host's session and how many
//! connection attempts it took. The pool updates it; the run report reads it.
//! No network activity happens here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};


// ---------------------------------------------------------------------------
// ConnState
// ---------------------------------------------------------------------------

/// Where a host's session stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnState {
    /// Never connected, or closed on purpose.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting {
        /// Epoch milliseconds when the attempt started.
        since_ms: u64,
    },
    /// The control channel is up.
    Connected {
        /// Epoch milliseconds when the session opened.
        since_ms: u64,
    },
    /// The last attempt or command hit a transport failure.
    Failed {
        /// The transport error, as displayed.
        reason: String,
        /// Epoch milliseconds of the failure.
        at_ms: u64,
    },
}


// ---------------------------------------------------------------------------
// ConnectionInfo
// ---------------------------------------------------------------------------

/// Connection history of one host over a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Inventory name of the host.
    pub host: String,
    /// Current state.
    pub state: ConnState,
    /// Every connection attempt over the run, successful or not.
    pub attempts: u32,
    /// Sessions opened (first connect plus transparent reconnects).
    pub sessions_opened: u32,
    /// Epoch milliseconds of the latest successful connect.
    pub last_success_ms: Option<u64>,
    /// Epoch milliseconds of the latest failure.
    pub last_failure_ms: Option<u64>,
    /// Time the latest successful connect took.
    pub latency_ms: Option<u64>,
}

impl ConnectionInfo {
    fn new(host: &str) -> Self {
        ConnectionInfo {
            host: host.to_string(),
            state: ConnState::Disconnected,
            attempts: 0,
            sessions_opened: 0,
            last_success_ms: None,
            last_failure_ms: None,
            latency_ms: None,
        }
    }
}


// ---------------------------------------------------------------------------
// ConnectionSummary
// ---------------------------------------------------------------------------

/// Host counts per connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// Hosts the tracker has seen.
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub failed: usize,
    pub disconnected: usize,
}


// ---------------------------------------------------------------------------
// ConnectionTracker
// ---------------------------------------------------------------------------

/// Connection state of every host the pool has touched, keyed by name.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: BTreeMap<String, ConnectionInfo>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        ConnectionTracker::default()
    }

    fn entry(&mut self, host: &str) -> &mut ConnectionInfo {
        self.connections
            .entry(host.to_string())
            .or_insert_with(|| ConnectionInfo::new(host))
    }

    /// Count an attempt and mark the host as connecting.
    pub fn start_connecting(&mut self, host: &str, now_ms: u64) {
        let info = self.entry(host);
        info.state = ConnState::Connecting { since_ms: now_ms };
        info.attempts += 1;
    }

    /// Record an opened session and how long the connect took.
    pub fn mark_connected(&mut self, host: &str, now_ms: u64, latency_ms: u64) {
        let info = self.entry(host);
        info.state = ConnState::Connected { since_ms: now_ms };
        info.sessions_opened += 1;
        info.last_success_ms = Some(now_ms);
        info.latency_ms = Some(latency_ms);
    }

    /// Record a transport failure. The attempt count is left alone.
    pub fn mark_failed(&mut self, host: &str, reason: &str, now_ms: u64) {
        let info = self.entry(host);
        info.state = ConnState::Failed {
            reason: reason.to_string(),
            at_ms: now_ms,
        };
        info.last_failure_ms = Some(now_ms);
    }

    /// Session closed on purpose (reset or teardown).
    pub fn disconnect(&mut self, host: &str) {
        if let Some(info) = self.connections.get_mut(host) {
            info.state = ConnState::Disconnected;
        }
    }

    pub fn state(&self, host: &str) -> Option<&ConnState> {
        self.connections.get(host).map(|i| &i.state)
    }

    pub fn info(&self, host: &str) -> Option<&ConnectionInfo> {
        self.connections.get(host)
    }

    pub fn is_connected(&self, host: &str) -> bool {
        matches!(self.state(host), Some(ConnState::Connected { .. }))
    }

    /// Snapshot of every host, sorted by name.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections.values().cloned().collect()
    }

    pub fn summary(&self) -> ConnectionSummary {
        let mut s = ConnectionSummary {
            total: self.connections.len(),
            connected: 0,
            connecting: 0,
            failed: 0,
            disconnected: 0,
        };
        for info in self.connections.values() {
            match info.state {
                ConnState::Disconnected => s.disconnected += 1,
                ConnState::Connecting { .. } => s.connecting += 1,
                ConnState::Connected { .. } => s.connected += 1,
                ConnState::Failed { .. } => s.failed += 1,
            }
        }
        s
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        let mut tracker = ConnectionTracker::new();
        tracker.start_connecting("m1", 1000);
        assert!(matches!(
            tracker.state("m1"),
            Some(ConnState::Connecting { since_ms: 1000 })
        ));

        tracker.mark_connected("m1", 1050, 50);
        assert!(tracker.is_connected("m1"));
        let info = tracker.info("m1").unwrap();
        assert_eq!(info.attempts, 1);
        assert_eq!(info.sessions_opened, 1);
        assert_eq!(info.latency_ms, Some(50));

        tracker.disconnect("m1");
        assert_eq!(tracker.state("m1"), Some(&ConnState::Disconnected));
    }

    #[test]
    fn failures_accumulate_attempts() {
        let mut tracker = ConnectionTracker::new();
        tracker.start_connecting("w1", 100);
        tracker.mark_failed("w1", "connection refused", 150);
        tracker.start_connecting("w1", 1200);
        tracker.mark_connected("w1", 1210, 10);

        let info = tracker.info("w1").unwrap();
        assert_eq!(info.attempts, 2);
        assert_eq!(info.sessions_opened, 1);
        assert_eq!(info.last_failure_ms, Some(150));
        assert_eq!(info.last_success_ms, Some(1210));
    }

    #[test]
    fn disconnect_unknown_is_noop() {
        let mut tracker = ConnectionTracker::new();
        tracker.disconnect("ghost");
        assert!(tracker.state("ghost").is_none());
    }

    #[test]
    fn summary_counts() {
        let mut tracker = ConnectionTracker::new();
        tracker.start_connecting("a", 1);
        tracker.mark_connected("a", 2, 1);
        tracker.start_connecting("b", 1);
        tracker.mark_failed("b", "refused", 2);
        tracker.start_connecting("c", 1);
        tracker.start_connecting("d", 1);
        tracker.mark_connected("d", 2, 1);
        tracker.disconnect("d");

        let s = tracker.summary();
        assert_eq!(s.total, 4);
        assert_eq!(s.connected, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.connecting, 1);
        assert_eq!(s.disconnected, 1);
    }

    #[test]
    fn snapshot_sorted_by_host() {
        let mut tracker = ConnectionTracker::new();
        tracker.start_connecting("w2", 1);
        tracker.start_connecting("m1", 1);
        tracker.start_connecting("w1", 1);
        let names: Vec<String> = tracker.snapshot().into_iter().map(|i| i.host).collect();
        assert_eq!(names, vec!["m1", "w1", "w2"]);
    }
}
