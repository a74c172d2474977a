//! Exponential backoff implementations

use std::{iter::Iterator, time::Duration};

/// Exponential backoff iterator
///
/// This struct implements the iterator trait and returns monotonically increasing values until a specified limit of iterations, specified by the `limit` field, is reached.
/// Each element in the Iterator is the previous element multiplied by the `multiplier` property.
#[derive(Debug, Clone)]
pub struct Backoff {
    retries: u32,
    limit: u32,
    multiplier: u32,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            retries: 0,
            limit: 13,
            multiplier: 2,
            current: Duration::from_millis(25),
        }
    }
}

impl Backoff {
    /// Creates a new backoff which starts at `initial * multiplier` and yields at most `limit` values
    pub fn new(initial: Duration, multiplier: u32, limit: u32) -> Self {
        Self {
            retries: 0,
            limit,
            multiplier,
            current: initial,
        }
    }

    /// Delay that has to pass before the given attempt (starting at one) may be executed
    ///
    /// Returns `None` if the attempt exceeds the limit of this backoff.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::default());
        }

        self.clone().nth(attempt as usize - 1)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.retries += 1;

        if self.retries > self.limit {
            None
        } else {
            self.current *= self.multiplier;
            Some(self.current)
        }
    }
}
