//! Simulated traffic: producers publish at a fixed rate, consumers count
//! what they receive.

pub mod consumer;
pub mod producer;

pub use consumer::Consumer;
pub use producer::Producer;

/// Frozen totals of one worker, as read after it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSample {
    pub room: usize,
    pub messages: u64,
    pub bytes: u64,
}

/// Tracks a run of consecutive publish failures so only the first failure
/// and the first recovery get logged.
#[derive(Debug, Default)]
pub struct FailureStreak {
    failing: bool,
}

impl FailureStreak {
    /// Returns true if this failure starts a new streak
    pub fn record_failure(&mut self) -> bool {
        !std::mem::replace(&mut self.failing, true)
    }

    /// Returns true if this success ends a streak
    pub fn record_success(&mut self) -> bool {
        std::mem::replace(&mut self.failing, false)
    }

    pub fn is_failing(&self) -> bool {
        self.failing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_streak_is_edge_triggered() {
        let mut streak = FailureStreak::default();
        assert!(!streak.record_success());

        assert!(streak.record_failure());
        assert!(!streak.record_failure());
        assert!(!streak.record_failure());
        assert!(streak.is_failing());

        assert!(streak.record_success());
        assert!(!streak.record_success());

        // Alternating outcomes log every transition
        assert!(streak.record_failure());
        assert!(streak.record_success());
        assert!(streak.record_failure());
    }
}
