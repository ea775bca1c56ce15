//! Heartbeat tracking and stall detection for consumers holding claims.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::types::{Claim, ConsumerId};

/// A claim whose holder has gone quiet, or was dropped without finishing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StalledClaim {
    pub consumer: ConsumerId,
    pub claim: Claim,
    /// Time since the holder was last seen.
    pub idle: Duration,
    /// The consumer handle was dropped while still holding the claim.
    pub abandoned: bool,
}

struct HeldClaim {
    claim: Claim,
    abandoned: bool,
}

struct MonitorState {
    last_seen: HashMap<ConsumerId, Instant>,
    held: HashMap<ConsumerId, HeldClaim>,
    stalled: HashSet<ConsumerId>,
}

/// Tracks consumer heartbeats and reports claims that are not progressing.
///
/// The monitor only reports. Commands behind a stalled claim stay claimed and
/// their producers stay blocked.
pub struct ClaimMonitor {
    state: Mutex<MonitorState>,
}

impl ClaimMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                last_seen: HashMap::new(),
                held: HashMap::new(),
                stalled: HashSet::new(),
            }),
        }
    }

    // Diagnostic state stays usable after a panic elsewhere.
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a consumer; no-op if already registered.
    pub fn register_consumer(&self, consumer: ConsumerId) {
        let mut guard = self.lock();
        guard.last_seen.entry(consumer).or_insert_with(Instant::now);
    }

    /// Record a heartbeat; clears any prior stall mark for the consumer.
    pub fn heartbeat(&self, consumer: ConsumerId) {
        let mut guard = self.lock();
        guard.last_seen.insert(consumer, Instant::now());
        guard.stalled.remove(&consumer);
    }

    /// Record that `consumer` now holds `claim`. Counts as a heartbeat.
    pub fn claimed(&self, consumer: ConsumerId, claim: Claim) {
        let mut guard = self.lock();
        guard.last_seen.insert(consumer, Instant::now());
        guard.stalled.remove(&consumer);
        guard.held.insert(
            consumer,
            HeldClaim {
                claim,
                abandoned: false,
            },
        );
    }

    /// Record that `consumer` retired its claim. Counts as a heartbeat.
    pub fn released(&self, consumer: ConsumerId) {
        let mut guard = self.lock();
        guard.last_seen.insert(consumer, Instant::now());
        guard.stalled.remove(&consumer);
        guard.held.remove(&consumer);
    }

    /// Mark the claim of a dropped consumer as abandoned; it is reported on
    /// every later scan.
    pub fn abandoned(&self, consumer: ConsumerId) {
        let mut guard = self.lock();
        if let Some(held) = guard.held.get_mut(&consumer) {
            held.abandoned = true;
        }
    }

    /// Stop tracking a consumer that holds nothing.
    pub fn deregister(&self, consumer: ConsumerId) {
        let mut guard = self.lock();
        if guard.held.contains_key(&consumer) {
            return;
        }
        guard.last_seen.remove(&consumer);
        guard.stalled.remove(&consumer);
    }

    /// Claims whose holder has been silent longer than `timeout`, plus every
    /// abandoned claim, ordered by claim id.
    pub fn detect_stalled(&self, timeout: Duration) -> Vec<StalledClaim> {
        let mut guard = self.lock();
        let now = Instant::now();
        let mut stalled: Vec<StalledClaim> = guard
            .held
            .iter()
            .filter_map(|(&consumer, held)| {
                let idle = guard
                    .last_seen
                    .get(&consumer)
                    .map(|&last| now.duration_since(last))
                    .unwrap_or_default();
                if held.abandoned || idle > timeout {
                    Some(StalledClaim {
                        consumer,
                        claim: held.claim,
                        idle,
                        abandoned: held.abandoned,
                    })
                } else {
                    None
                }
            })
            .collect();
        stalled.sort_by_key(|entry| entry.claim.id());
        for entry in &stalled {
            guard.stalled.insert(entry.consumer);
        }
        stalled
    }

    /// Consumers marked stalled by a previous scan and not heard from since.
    pub fn stalled_consumers(&self) -> HashSet<ConsumerId> {
        self.lock().stalled.clone()
    }

    /// Test-only hook to set deterministic timestamps without sleeping.
    #[cfg(test)]
    fn set_last_seen_for_test(&self, consumer: ConsumerId, instant: Instant) {
        self.lock().last_seen.insert(consumer, instant);
    }
}

impl Default for ClaimMonitor {
    fn default() -> Self {
        Self::new()
    }
}
