//! Reconnect delay schedule.

use std::time::Duration;

/// Fixed list of reconnect delays indexed by attempt number.
///
/// Attempts past the end of the list reuse the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl Default for BackoffSchedule {
    /// 1s, 2s, 5s, 10s, 30s.
    fn default() -> Self {
        Self::from_secs(&[1, 2, 5, 10, 30])
    }
}

impl BackoffSchedule {
    /// Creates a schedule from explicit delays.
    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps }
    }

    /// Creates a schedule from delays in seconds.
    pub fn from_secs(steps: &[u64]) -> Self {
        Self::new(steps.iter().copied().map(Duration::from_secs).collect())
    }

    /// Creates a schedule from delays in milliseconds.
    pub fn from_millis(steps: &[u64]) -> Self {
        Self::new(steps.iter().copied().map(Duration::from_millis).collect())
    }

    /// Delay for the given zero-based attempt.
    pub fn delay(&self, attempt: usize) -> Duration {
        match self.steps.get(attempt) {
            Some(delay) => *delay,
            None => self.steps.last().copied().unwrap_or_default(),
        }
    }
}

/// Attempt counter walking a [`BackoffSchedule`].
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: BackoffSchedule,
    attempt: usize,
}

impl Backoff {
    /// Starts at attempt zero.
    pub fn new(schedule: BackoffSchedule) -> Self {
        Self {
            schedule,
            attempt: 0,
        }
    }

    /// Number of consecutive failed attempts.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Returns the delay for the current attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.schedule.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Resets the counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
