//! The flow-control governor.
//!
//! Tracks permits the server has granted for inbound frames on one stream
//! and issues a refill once a batch of permits has been consumed. The grant
//! is cumulative on the server side; the client never decreases it, so the
//! governor only needs to track how much of the current batch has been
//! consumed, not the running total granted.

use parking_lot::Mutex;

/// Per-stream inbound permit accounting.
pub struct FlowControlGovernor {
    batch: u32,
    consumed: Mutex<u32>,
}

impl FlowControlGovernor {
    /// Builds a governor that refills `batch` permits once `batch` frames
    /// have been consumed since the last refill (or since enabling).
    #[must_use]
    pub fn new(batch: u32) -> Self {
        Self {
            batch: batch.max(1),
            consumed: Mutex::new(0),
        }
    }

    /// Consumes one permit. Returns `Some(batch)` if a refill is now due
    /// (the caller should enqueue a `FlowControl { permits: batch }` frame
    /// and the counter has already been reset), `None` otherwise.
    pub fn consume_one(&self) -> Option<u32> {
        let mut consumed = self.consumed.lock();
        *consumed += 1;
        if *consumed >= self.batch {
            *consumed = 0;
            Some(self.batch)
        } else {
            None
        }
    }

    /// Begins flow-control accounting for a freshly (re)connected stream:
    /// resets consumed-since-refill to zero (a fresh connection starts a
    /// fresh batch window) and returns `permits`, the initial grant the
    /// caller should send to the server.
    pub fn enable_flow_control(&self, permits: u32) -> u32 {
        *self.consumed.lock() = 0;
        permits
    }

    /// The configured refill batch size.
    #[must_use]
    pub fn batch(&self) -> u32 {
        self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refills_exactly_on_batch_boundary() {
        let governor = FlowControlGovernor::new(5);
        let mut refills = Vec::new();
        for _ in 0..12 {
            if let Some(delta) = governor.consume_one() {
                refills.push(delta);
            }
        }
        assert_eq!(refills, vec![5, 5]);
    }

    #[test]
    fn no_refill_before_first_batch_is_exhausted() {
        let governor = FlowControlGovernor::new(10);
        for _ in 0..9 {
            assert_eq!(governor.consume_one(), None);
        }
        assert_eq!(governor.consume_one(), Some(10));
    }

    #[test]
    fn enable_flow_control_returns_the_initial_grant_and_resets_the_window() {
        let governor = FlowControlGovernor::new(5);
        for _ in 0..3 {
            assert_eq!(governor.consume_one(), None);
        }
        assert_eq!(governor.enable_flow_control(50), 50);
        // The reconnect window starts fresh: the pre-reconnect partial batch
        // doesn't carry over.
        for _ in 0..4 {
            assert_eq!(governor.consume_one(), None);
        }
        assert_eq!(governor.consume_one(), Some(5));
    }
}
