use reqwest_retry::{self, RetryDecision, RetryPolicy};
use std::{
    cmp,
    time::{Duration, SystemTime},
};

/// Calculate exponential using base and number of past retries
fn calculate_exponential(base: u32, n_past_retries: u32) -> u32 {
    base.checked_pow(n_past_retries).unwrap_or(u32::MAX)
}

/// Fixed waits for the first `n_fixed_retries`, then doubling.
///
/// With `max_n_retries = 6`, `n_fixed_retries = 3` and `wait_time = 500ms`
/// the waits are (ms): 500, 500, 500, 1000, 2000, 4000
///
/// Used both as the HTTP middleware policy and by the coordinator when a
/// segment is retried on the mirror that just failed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct FixedThenExponentialRetry {
    /// Maximum number of allowed retries attempts.
    pub max_n_retries: u32,
    /// Fixed wait time between retries. Also expo base 2 is multiplied by this amount.
    pub wait_time: Duration,
    /// times after which we start backing off exponentially.
    /// must be smaller or equal to max_n_retries, otherwise max_n_retries will be used
    pub n_fixed_retries: u32,
}

impl FixedThenExponentialRetry {
    pub fn new(max_n_retries: u32, wait_time: Duration, n_fixed_retries: u32) -> Self {
        Self {
            max_n_retries,
            wait_time,
            n_fixed_retries,
        }
    }

    fn too_many_attempts(&self, n_past_retries: u32) -> bool {
        n_past_retries >= self.max_n_retries
    }

    /// Wait before retry number `n_past_retries + 1`, or None once the
    /// budget is spent.
    pub fn delay_for(&self, n_past_retries: u32) -> Option<Duration> {
        if self.too_many_attempts(n_past_retries) {
            return None;
        }
        let wait_time = if n_past_retries < cmp::min(self.n_fixed_retries, self.max_n_retries) {
            self.wait_time
        } else {
            let exp = calculate_exponential(2, n_past_retries - self.n_fixed_retries + 1);
            self.wait_time.saturating_mul(exp)
        };
        Some(wait_time)
    }
}

impl RetryPolicy for FixedThenExponentialRetry {
    fn should_retry(
        &self,
        _request_start_time: SystemTime,
        n_past_retries: u32,
    ) -> reqwest_retry::RetryDecision {
        match self.delay_for(n_past_retries) {
            None => RetryDecision::DoNotRetry,
            Some(wait_time) => RetryDecision::Retry {
                execute_after: SystemTime::now() + wait_time,
            },
        }
    }
}
