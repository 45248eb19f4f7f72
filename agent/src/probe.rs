/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! Sustained-failure detection for the consumer's liveness probe loop. A
//! single missed probe is noise; `threshold` consecutive misses mean the
//! gateway's network identity has most likely changed and the overlay must
//! be re-established from scratch.

pub struct ProbeState {
    threshold: u32,
    consecutive_failures: u32,
}

impl ProbeState {
    pub fn new(threshold: u32) -> Self {
        ProbeState {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Records a miss; returns true when failure is now sustained. The
    /// counter resets on trigger so a failed re-establishment gets a full
    /// window before the next attempt.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.consecutive_failures = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_does_not_trigger() {
        let mut state = ProbeState::new(3);
        assert!(!state.record_failure());
        assert!(!state.record_failure());
    }

    #[test]
    fn threshold_triggers_and_resets() {
        let mut state = ProbeState::new(3);
        state.record_failure();
        state.record_failure();
        assert!(state.record_failure());
        // counter restarted after trigger
        assert!(!state.record_failure());
    }

    #[test]
    fn success_resets_the_counter() {
        let mut state = ProbeState::new(2);
        state.record_failure();
        state.record_success();
        assert!(!state.record_failure());
        assert!(state.record_failure());
    }
}
