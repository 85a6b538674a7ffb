//! Exponential backoff for retrying board API calls.

use std::time::Duration;

/// Exponential backoff with a capped number of attempts and no jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    current: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, allowing `max_attempts` tries in total.
    pub fn new(initial: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            current: initial,
            attempt: 0,
        }
    }

    /// Returns how many attempts have been recorded.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Records a failed attempt.
    ///
    /// Returns the delay to wait before retrying, or `None` once the attempt
    /// budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.current;
        self.current *= 2;
        Some(delay)
    }
}
