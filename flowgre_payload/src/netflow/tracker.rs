//! Per-exporter sequence and uptime state.

use std::time::Instant;

/// Uptime reported at the moment a tracker is created, in milliseconds.
///
/// Starting above zero keeps `first_switched` values derived from the
/// uptime from landing on zero.
pub const UPTIME_BIAS_MILLIS: u32 = 1000;

/// Tracks the start time and flow sequence of one virtual exporter.
///
/// A tracker is owned by exactly one sender. Sequence numbers are only
/// meaningful per `SourceID` so trackers are never shared.
#[derive(Debug, Clone, Copy)]
pub struct FlowTracker {
    start: Instant,
    sequence: u32,
}

impl FlowTracker {
    /// Create a tracker starting now with sequence 0.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Create a tracker whose uptime is measured from `start`.
    #[must_use]
    pub fn starting_at(start: Instant) -> Self {
        Self { start, sequence: 0 }
    }

    /// Advance the sequence and return the new value.
    ///
    /// The first call returns 1. After `u32::MAX` the sequence wraps to 1,
    /// 0 is never handed out.
    pub fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.checked_add(1).unwrap_or(1);
        self.sequence
    }

    /// The most recently issued sequence, 0 if none has been issued.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Milliseconds elapsed between tracker start and `now`, plus
    /// [`UPTIME_BIAS_MILLIS`]. Wraps at `u32::MAX` like a router's
    /// `sysUptime`.
    #[must_use]
    pub fn uptime_millis(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.start).as_millis() as u32;
        elapsed.wrapping_add(UPTIME_BIAS_MILLIS)
    }
}

impl Default for FlowTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use proptest::prelude::*;

    use super::{FlowTracker, UPTIME_BIAS_MILLIS};

    #[test]
    fn first_sequence_is_one() {
        let mut tracker = FlowTracker::new();
        assert_eq!(tracker.sequence(), 0);
        assert_eq!(tracker.next_sequence(), 1);
        assert_eq!(tracker.next_sequence(), 2);
        assert_eq!(tracker.sequence(), 2);
    }

    #[test]
    fn uptime_is_biased_and_elapsed() {
        let start = Instant::now();
        let tracker = FlowTracker::starting_at(start);
        assert_eq!(tracker.uptime_millis(start), UPTIME_BIAS_MILLIS);
        assert_eq!(
            tracker.uptime_millis(start + Duration::from_millis(2_500)),
            UPTIME_BIAS_MILLIS + 2_500
        );
    }

    #[test]
    fn uptime_before_start_is_the_bias() {
        let now = Instant::now();
        let tracker = FlowTracker::starting_at(now + Duration::from_secs(5));
        assert_eq!(tracker.uptime_millis(now), UPTIME_BIAS_MILLIS);
    }

    proptest! {
        #[test]
        fn sequence_strictly_increases(calls in 1usize..2_000) {
            let mut tracker = FlowTracker::new();
            let mut previous = 0;
            for _ in 0..calls {
                let next = tracker.next_sequence();
                prop_assert!(next > previous);
                previous = next;
            }
            prop_assert_eq!(previous as usize, calls);
        }
    }
}
