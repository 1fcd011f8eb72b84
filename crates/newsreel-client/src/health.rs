//! Per-server circuit breakers.
//!
//! One entry per server id, mutated only through `record_success` and
//! `record_failure`. A circuit opens after `failure_threshold` consecutive
//! failures and stays open until `cooldown` has elapsed since the most
//! recent failure; at that point the server becomes available again and the
//! next real operation is the probe. Success closes the circuit, another
//! failure re-arms the cooldown. There is no separate half-open bookkeeping
//! to get out of sync.
//!
//! Entries are keyed by server id and outlive configuration reloads: a
//! flapping server does not get a clean slate just because an unrelated
//! descriptor changed. `reset` exists for the operator who wants to hand one
//! out anyway.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use newsreel_core::Error;

use crate::pool::PoolStats;

#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Quiet period after the last failure before the server is probed again.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        CircuitConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Default)]
struct CircuitEntry {
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    open: bool,
    last_failure: Option<Instant>,
    last_error: Option<String>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl CircuitEntry {
    fn available(&self, cooldown: Duration) -> bool {
        if !self.open {
            return true;
        }
        self.last_failure
            .map_or(true, |at| at.elapsed() >= cooldown)
    }
}

/// Serializable per-server health row for the operability surface.
#[derive(Clone, Debug, Serialize)]
pub struct ServerHealth {
    pub id: String,
    pub available: bool,
    pub circuit_open: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Filled in by the router, which owns the pools.
    pub connections: Option<PoolStats>,
}

pub struct HealthTracker {
    cfg: CircuitConfig,
    entries: DashMap<String, CircuitEntry>,
}

impl HealthTracker {
    pub fn new(cfg: CircuitConfig) -> Self {
        HealthTracker {
            cfg,
            entries: DashMap::new(),
        }
    }

    /// Any successful exchange, including an authoritative not-found answer.
    pub fn record_success(&self, server: &str) {
        let mut entry = self.entries.entry(server.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.total_successes += 1;
        entry.last_success_at = Some(Utc::now());
        if entry.open {
            entry.open = false;
            tracing::info!(server, "circuit closed after successful operation");
        }
    }

    /// Failures that do not speak about the server (cancellation, acquire
    /// timeouts) are ignored here no matter what the caller passes.
    pub fn record_failure(&self, server: &str, error: &Error) {
        if !error.records_health_failure() {
            return;
        }
        let mut entry = self.entries.entry(server.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.total_failures += 1;
        entry.last_failure = Some(Instant::now());
        entry.last_failure_at = Some(Utc::now());
        entry.last_error = Some(error.to_string());
        if !entry.open && entry.consecutive_failures >= self.cfg.failure_threshold {
            entry.open = true;
            tracing::warn!(
                server,
                failures = entry.consecutive_failures,
                error = %error,
                "circuit opened"
            );
        }
    }

    /// The only gate failover consults. Unknown servers are available.
    pub fn is_available(&self, server: &str) -> bool {
        self.entries
            .get(server)
            .map_or(true, |entry| entry.available(self.cfg.cooldown))
    }

    /// Forget everything about one server.
    pub fn reset(&self, server: &str) {
        if self.entries.remove(server).is_some() {
            tracing::info!(server, "circuit state reset");
        }
    }

    pub fn health_of(&self, server: &str) -> ServerHealth {
        match self.entries.get(server) {
            Some(entry) => ServerHealth {
                id: server.to_string(),
                available: entry.available(self.cfg.cooldown),
                circuit_open: entry.open,
                consecutive_failures: entry.consecutive_failures,
                total_failures: entry.total_failures,
                total_successes: entry.total_successes,
                last_error: entry.last_error.clone(),
                last_failure_at: entry.last_failure_at,
                last_success_at: entry.last_success_at,
                connections: None,
            },
            None => ServerHealth {
                id: server.to_string(),
                available: true,
                circuit_open: false,
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
                last_error: None,
                last_failure_at: None,
                last_success_at: None,
                connections: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> HealthTracker {
        HealthTracker::new(CircuitConfig {
            failure_threshold: 5,
            cooldown: Duration::from_millis(50),
        })
    }

    fn connect_err() -> Error {
        Error::connect("s1", "connection refused")
    }

    #[test]
    fn unknown_servers_are_available() {
        assert!(quick().is_available("never-seen"));
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let tracker = quick();
        for i in 0..5 {
            assert!(tracker.is_available("s1"), "still closed after {i}");
            tracker.record_failure("s1", &connect_err());
        }
        assert!(!tracker.is_available("s1"));
        let health = tracker.health_of("s1");
        assert!(health.circuit_open);
        assert_eq!(health.consecutive_failures, 5);
        assert_eq!(health.total_failures, 5);
    }

    #[test]
    fn success_resets_the_consecutive_count() {
        let tracker = quick();
        for _ in 0..4 {
            tracker.record_failure("s1", &connect_err());
        }
        tracker.record_success("s1");
        tracker.record_failure("s1", &connect_err());
        assert!(tracker.is_available("s1"));
        assert_eq!(tracker.health_of("s1").consecutive_failures, 1);
    }

    #[tokio::test]
    async fn cooldown_reopens_the_gate_and_failure_rearms_it() {
        let tracker = quick();
        for _ in 0..5 {
            tracker.record_failure("s1", &connect_err());
        }
        assert!(!tracker.is_available("s1"));

        tokio::time::sleep(Duration::from_millis(70)).await;
        // Cooldown elapsed: the next operation is the probe.
        assert!(tracker.is_available("s1"));
        assert!(tracker.health_of("s1").circuit_open);

        // Probe fails: unavailable again for a fresh cooldown.
        tracker.record_failure("s1", &connect_err());
        assert!(!tracker.is_available("s1"));

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(tracker.is_available("s1"));
        tracker.record_success("s1");
        assert!(!tracker.health_of("s1").circuit_open);
        assert!(tracker.is_available("s1"));
    }

    #[test]
    fn interruptions_do_not_count() {
        let tracker = quick();
        for _ in 0..20 {
            tracker.record_failure("s1", &Error::Cancelled);
            tracker.record_failure(
                "s1",
                &Error::AcquireTimeout {
                    server: "s1".into(),
                    waited: Duration::from_secs(1),
                },
            );
        }
        assert!(tracker.is_available("s1"));
        assert_eq!(tracker.health_of("s1").total_failures, 0);
    }

    #[test]
    fn reset_forgets_the_server() {
        let tracker = quick();
        for _ in 0..5 {
            tracker.record_failure("s1", &connect_err());
        }
        assert!(!tracker.is_available("s1"));
        tracker.reset("s1");
        assert!(tracker.is_available("s1"));
        assert_eq!(tracker.health_of("s1").total_failures, 0);
    }

    #[test]
    fn health_rows_serialize() {
        let tracker = quick();
        tracker.record_failure("s1", &connect_err());
        let json = serde_json::to_string(&tracker.health_of("s1")).unwrap();
        assert!(json.contains("\"consecutive_failures\":1"));
        assert!(json.contains("connection refused"));
    }
}
