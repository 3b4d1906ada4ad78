//! Reconnect pacing.
//!
//! Delays grow geometrically and are capped:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max)
//! ```
//!
//! A reconnecting forklift terminal never gives up on its own, so by default
//! there is no attempt limit; once the cap is reached every further attempt
//! waits `max`. A limit can still be set for one-shot tools.

use std::time::Duration;

use thiserror::Error;

use super::config::BackoffConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffError {
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    /// `None` retries forever.
    max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(initial);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            // Below 1.0 the delay would shrink towards zero.
            multiplier: multiplier.max(1.0),
            attempt: 0,
            max_attempts: None,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        let mut backoff = Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.multiplier,
        );
        backoff.max_attempts = config.max_attempts;
        backoff
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the delay before the next attempt and advances the schedule.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt += 1;
        if let Some(limit) = self.max_attempts {
            if self.attempt > limit {
                return Err(BackoffError::MaxAttemptLimitError(limit));
            }
        }

        let sleep = self.current_delay;
        let next = self.current_delay.as_secs_f64() * self.multiplier;
        // Overflowing or non-finite products saturate at the cap.
        self.current_delay = Duration::try_from_secs_f64(next)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        Ok(sleep)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_then_plateau() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);
        let delays: Vec<_> = (0..7).map(|_| backoff.next_sleep().unwrap()).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 10, 10, 10].map(Duration::from_secs).to_vec()
        );
        assert_eq!(backoff.attempt(), 7);
    }

    #[test]
    fn unlimited_by_default() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 2.0);
        for _ in 0..1000 {
            assert!(backoff.next_sleep().is_ok());
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::from_config(&BackoffConfig::default());
        let first = backoff.next_sleep().unwrap();
        backoff.next_sleep().unwrap();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_sleep().unwrap(), first);
    }

    #[test]
    fn attempt_limit() {
        let mut backoff = Backoff::from_config(&BackoffConfig {
            max_attempts: Some(2),
            ..BackoffConfig::default()
        });
        assert!(backoff.next_sleep().is_ok());
        assert!(backoff.next_sleep().is_ok());
        assert_eq!(
            backoff.next_sleep(),
            Err(BackoffError::MaxAttemptLimitError(2))
        );
    }

    #[test]
    fn degenerate_parameters_do_not_shrink() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1), 0.5);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn huge_multiplier_saturates_at_the_cap() {
        let config = BackoffConfig {
            initial_ms: 1000,
            max_ms: 60_000,
            multiplier: 1e300,
            max_attempts: None,
        };
        let mut backoff = Backoff::from_config(&config);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
        for _ in 0..5 {
            assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(60));
        }
    }
}
