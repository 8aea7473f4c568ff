//! Simulated time.
//!
//! The scheduler never reads wall-clock time for its own decisions; delay
//! arithmetic and macrotask readiness run against a logical millisecond
//! counter that the caller advances explicitly. Wall-clock milliseconds are
//! used only for informational stamps on recorded events and snapshots.

use std::time::SystemTime;

/// Logical millisecond clock. Starts at zero and only moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimClock {
    current_ms: u64,
}

impl SimClock {
    pub fn new() -> Self {
        Self { current_ms: 0 }
    }

    /// Starts the clock at an arbitrary point, for restoring saved state.
    pub fn starting_at(now_ms: u64) -> Self {
        Self { current_ms: now_ms }
    }

    pub fn now_ms(&self) -> u64 {
        self.current_ms
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&mut self, delta_ms: u64) {
        self.current_ms = self.current_ms.saturating_add(delta_ms);
    }

    /// Moves the clock forward to `target_ms`. Targets in the past are
    /// ignored; the clock never runs backwards.
    pub fn advance_to(&mut self, target_ms: u64) {
        if target_ms > self.current_ms {
            self.current_ms = target_ms;
        }
    }
}

/// Milliseconds since the Unix epoch, for informational timestamps.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
