use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;

/// Backoff multiplier (2x per attempt).
const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Randomization factor (0 which is no randomization).
const DEFAULT_RANDOMIZATION: f64 = 0.0;
/// Initial interval in milliseconds.
const INITIAL_INTERVAL: u64 = 500;

/// A retry interval generator that increases timeouts with exponential backoff.
#[derive(Debug)]
pub struct RetryBackoff {
    backoff: ExponentialBackoff,
    attempt: u32,
}

impl RetryBackoff {
    /// Creates a new retry backoff based on configured thresholds.
    pub fn new(max_interval: Duration) -> Self {
        let backoff = ExponentialBackoff {
            current_interval: Duration::from_millis(INITIAL_INTERVAL),
            initial_interval: Duration::from_millis(INITIAL_INTERVAL),
            randomization_factor: DEFAULT_RANDOMIZATION,
            multiplier: DEFAULT_MULTIPLIER,
            max_interval,
            max_elapsed_time: None,
            clock: Default::default(),
            start_time: Instant::now(),
        };

        RetryBackoff {
            backoff,
            attempt: 0,
        }
    }

    /// Resets this backoff to its initial state.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempt = 0;
    }

    /// Indicates whether a backoff attempt has started.
    pub fn started(&self) -> bool {
        self.attempt > 0
    }

    /// Returns the number of the retry attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the next backoff duration.
    pub fn next_backoff(&mut self) -> Duration {
        let duration = match self.attempt {
            0 => Duration::new(0, 0),
            _ => self.backoff.next_backoff().unwrap_or(self.backoff.max_interval),
        };

        self.attempt += 1;
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(30));
        assert_eq!(backoff.next_backoff(), Duration::ZERO);
        assert!(backoff.started());

        let first = backoff.next_backoff();
        let second = backoff.next_backoff();
        assert!(first >= Duration::from_millis(500));
        assert!(second > first);
        assert!(second <= Duration::from_secs(30));
    }

    #[test]
    fn test_reset() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(30));
        backoff.next_backoff();
        backoff.next_backoff();

        backoff.reset();
        assert!(!backoff.started());
        assert_eq!(backoff.next_backoff(), Duration::ZERO);
    }
}
