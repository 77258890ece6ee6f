use std::time;

#[derive(Copy, Clone, Debug)]
/// The retry policy the broker `ConnectionManager` follows while establishing a connection.
pub struct RetryPolicy {
    /// Total number of connection attempts before giving up for good.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The wait after the first failed attempt.
    initial_interval: time::Duration,
    /// The maximum possible wait between attempts.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            max_attempts,
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// A policy that waits the same `interval` between every one of `max_attempts` attempts.
    pub fn fixed(max_attempts: u32, interval: time::Duration) -> Self {
        Self::new(max_attempts, 1, interval, None)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow the given (1-based) failed attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Calculate the wait after the given (1-based) failed attempt.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(exponent));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(10, time::Duration::from_secs(5))
    }
}
