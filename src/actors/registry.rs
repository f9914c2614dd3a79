//! Process-wide liveness table.
//!
//! Every actor forwards its heartbeats here (through the substrate). The
//! registry is for monitoring only: nothing in the control path reads it.
//! Entries are created on the first heartbeat and removed by the final one.

use crate::clock::Timestamp;
use crate::messages::HeartbeatReport;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

/// Last known liveness of one actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThreadRegistration {
    /// Time of the last heartbeat.
    pub timestamp: Option<Timestamp>,
    /// Heartbeat count reported with it.
    pub count: u64,
}

/// Named view of a registration, as returned by [`ThreadRegistry::thread_states`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadState {
    /// Actor name.
    pub name: String,
    /// Time of the last heartbeat.
    pub timestamp: Option<Timestamp>,
    /// Heartbeat count.
    pub count: u64,
}

/// Registry of actor heartbeats.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    entries: Mutex<BTreeMap<String, ThreadRegistration>>,
}

impl ThreadRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one heartbeat. Returns the stored state, or `None` when the
    /// report was final and the entry was evicted.
    ///
    /// Reports may arrive twice or out of order; a report with a lower count
    /// than the stored one is ignored.
    pub fn receive_heartbeat(&self, report: &HeartbeatReport) -> Option<ThreadRegistration> {
        let mut entries = self.entries.lock();
        if report.is_final {
            entries.remove(&report.name);
            return None;
        }

        let entry = entries.entry(report.name.clone()).or_default();
        if report.count >= entry.count {
            entry.timestamp = report.timestamp;
            entry.count = report.count;
        }
        Some(*entry)
    }

    /// State of one actor.
    pub fn thread_state(&self, name: &str) -> Option<ThreadState> {
        self.entries.lock().get(name).map(|reg| ThreadState {
            name: name.to_string(),
            timestamp: reg.timestamp,
            count: reg.count,
        })
    }

    /// Names of all registered actors, sorted.
    pub fn thread_list(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// State of every registered actor, sorted by name.
    pub fn thread_states(&self) -> Vec<ThreadState> {
        self.entries
            .lock()
            .iter()
            .map(|(name, reg)| ThreadState {
                name: name.clone(),
                timestamp: reg.timestamp,
                count: reg.count,
            })
            .collect()
    }

    /// Actors whose last heartbeat is older than `max_age_secs` at `now`.
    pub fn stale_threads(&self, now: Timestamp, max_age_secs: f64) -> Vec<ThreadState> {
        self.thread_states()
            .into_iter()
            .filter(|state| match state.timestamp {
                Some(ts) => now.seconds_since(ts) > max_age_secs,
                None => true,
            })
            .collect()
    }

    /// Number of registered actors.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no actor is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(name: &str, ts: f64, count: u64, is_final: bool) -> HeartbeatReport {
        HeartbeatReport {
            name: name.to_string(),
            timestamp: Some(Timestamp::from_secs(ts)),
            count,
            is_final,
        }
    }

    #[test]
    fn heartbeat_creates_and_updates_entry() {
        let registry = ThreadRegistry::new();
        registry.receive_heartbeat(&beat("ECC", 10.0, 1, false));
        let state = registry.receive_heartbeat(&beat("ECC", 10.2, 2, false)).unwrap();

        assert_eq!(state.count, 2);
        assert_eq!(state.timestamp, Some(Timestamp::from_secs(10.2)));
        assert_eq!(registry.thread_list(), vec!["ECC".to_string()]);
    }

    #[test]
    fn final_heartbeat_evicts_entry() {
        let registry = ThreadRegistry::new();
        registry.receive_heartbeat(&beat("capture_thread", 1.0, 1, false));
        assert!(registry.receive_heartbeat(&beat("capture_thread", 2.0, 2, true)).is_none());
        assert!(registry.is_empty());
        // evicting something unknown is harmless
        assert!(registry.receive_heartbeat(&beat("ghost", 2.0, 2, true)).is_none());
    }

    #[test]
    fn late_duplicate_does_not_roll_back() {
        let registry = ThreadRegistry::new();
        registry.receive_heartbeat(&beat("job", 5.0, 5, false));
        let state = registry.receive_heartbeat(&beat("job", 3.0, 3, false)).unwrap();
        assert_eq!(state.count, 5);
        assert_eq!(state.timestamp, Some(Timestamp::from_secs(5.0)));
    }

    #[test]
    fn stale_threads_reports_silent_actors() {
        let registry = ThreadRegistry::new();
        registry.receive_heartbeat(&beat("fresh", 99.5, 10, false));
        registry.receive_heartbeat(&beat("stuck", 90.0, 3, false));

        let stale = registry.stale_threads(Timestamp::from_secs(100.0), 5.0);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name, "stuck");
        assert_eq!(registry.thread_state("fresh").unwrap().count, 10);
    }
}
