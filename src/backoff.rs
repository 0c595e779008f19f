//! # Fibonacci Backoff
//!
//! Progressive backoff for retrying provider API calls and failed refresh
//! passes. Grows more slowly than exponential backoff, so repeated transient
//! failures do not push the retry interval out unreasonably fast.
//!
//! Sequence for `new(1, 30)`: 1s, 1s, 2s, 3s, 5s, 8s, 13s, 21s, 30s (max).

use std::time::Duration;

/// Fibonacci backoff calculator.
///
/// Each delay is the sum of the previous two, capped at a maximum.
/// [`reset`](FibonacciBackoff::reset) returns to the initial delay after a
/// success.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum delay in seconds (for reset)
    min_secs: u64,
    /// Previous delay in seconds
    prev_secs: u64,
    /// Current delay in seconds
    current_secs: u64,
    /// Maximum delay in seconds
    max_secs: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Get the next delay in seconds and advance the sequence.
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result_secs = self.current_secs;

        let next_secs = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = std::cmp::min(next_secs, self.max_secs);

        result_secs
    }

    /// Get the next delay as a [`Duration`] and advance the sequence.
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the sequence to the initial delay.
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}
