//! Hybrid clock for stamping log insertion times.
//!
//! Every replica stamps `write_timestamp` with its own clock when a row enters
//! its log, whether the write was authored locally or received from a peer.
//! Delta scans compare against that stamp, so it has to be strictly increasing
//! on one replica even when the wall clock stalls or steps backwards.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// A clock that never repeats or goes back.
///
/// Ordering rules:
/// 1. A tick returns the wall time if it is ahead of the last value handed out
/// 2. Otherwise it returns the last value plus one
///
/// Observing a remote timestamp pulls the clock forward so later local writes
/// sort after everything this replica has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridClock {
    /// Last value handed out
    pub last: Timestamp,
}

impl HybridClock {
    /// Create a clock that has handed nothing out yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock resuming after `last`.
    pub fn starting_at(last: Timestamp) -> Self {
        Self { last }
    }

    /// Advance and return the next value given the current wall time.
    pub fn tick(&mut self, now: Timestamp) -> Timestamp {
        self.last = now.max(self.last.saturating_add(1));
        self.last
    }

    /// Pull the clock forward to at least `seen`.
    pub fn observe(&mut self, seen: Timestamp) {
        self.last = self.last.max(seen);
    }

    pub fn current(&self) -> Timestamp {
        self.last
    }
}
