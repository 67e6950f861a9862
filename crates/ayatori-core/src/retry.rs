//! Bounded retry policies for closure-defined steps.

use crate::error::ProcessError;
use std::time::Duration;

/// How often, and how patiently, a step retries a failed `execute`.
///
/// The engine itself never limits attempts; a policy is one way for a step
/// to bound its own retries.
///
/// # Examples
///
/// ```
/// use ayatori_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
///
/// assert_eq!(policy.delay_before(1), Some(Duration::from_millis(100)));
/// assert_eq!(policy.delay_before(2), Some(Duration::from_millis(200)));
/// assert_eq!(policy.delay_before(4), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Never retry.
    #[default]
    None,
    /// Retry up to `max_retries` times, waiting `delay` before each retry.
    Fixed {
        /// Retries allowed after the first attempt.
        max_retries: u32,
        /// Wait before every retry.
        delay: Duration,
    },
    /// Retry with a delay that grows by `multiplier` each time, capped at
    /// `max_delay`.
    ExponentialBackoff {
        /// Retries allowed after the first attempt.
        max_retries: u32,
        /// Wait before the first retry.
        initial_delay: Duration,
        /// Upper bound on any single wait.
        max_delay: Duration,
        /// Growth factor between consecutive waits.
        multiplier: u32,
    },
}

impl RetryPolicy {
    /// Retries up to `max_retries` times with a constant `delay`.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy::Fixed { max_retries, delay }
    }

    /// Exponential backoff doubling from `initial_delay`, capped at 60s.
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    /// Exponential backoff with explicit bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Configuration`] if `multiplier` is outside
    /// `1..=10` or `max_delay` is shorter than `initial_delay`.
    pub fn exponential_backoff(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self, ProcessError> {
        if !(1..=10).contains(&multiplier) {
            return Err(ProcessError::Configuration(format!(
                "retry multiplier must be between 1 and 10, got {}",
                multiplier
            )));
        }
        if max_delay < initial_delay {
            return Err(ProcessError::Configuration(
                "retry max_delay must be >= initial_delay".to_string(),
            ));
        }
        Ok(RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        })
    }

    /// Number of retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed { max_retries, .. }
            | RetryPolicy::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// Returns the wait before the `retry`-th retry (1-based), or `None` once
    /// the policy is exhausted.
    pub fn delay_before(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries() {
            return None;
        }
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed { delay, .. } => Some(*delay),
            RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let factor = (*multiplier as u64).saturating_pow(retry - 1);
                let millis = (initial_delay.as_millis() as u64).saturating_mul(factor);
                Some(Duration::from_millis(millis.min(max_delay.as_millis() as u64)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_retries() {
        assert_eq!(RetryPolicy::None.max_retries(), 0);
        assert_eq!(RetryPolicy::None.delay_before(1), None);
    }

    #[test]
    fn test_fixed() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(5));
        assert_eq!(policy.delay_before(1), Some(Duration::from_millis(5)));
        assert_eq!(policy.delay_before(2), Some(Duration::from_millis(5)));
        assert_eq!(policy.delay_before(3), None);
    }

    #[test]
    fn test_exponential_is_capped() {
        let policy = RetryPolicy::exponential_backoff(
            20,
            Duration::from_millis(100),
            Duration::from_secs(1),
            3,
        )
        .expect("valid policy");
        assert_eq!(policy.delay_before(2), Some(Duration::from_millis(300)));
        assert_eq!(policy.delay_before(3), Some(Duration::from_millis(900)));
        assert_eq!(policy.delay_before(15), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_exponential_validation() {
        let zero = RetryPolicy::exponential_backoff(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
            0,
        );
        assert!(matches!(zero, Err(ProcessError::Configuration(_))));

        let inverted = RetryPolicy::exponential_backoff(
            3,
            Duration::from_secs(1),
            Duration::from_millis(100),
            2,
        );
        assert!(matches!(inverted, Err(ProcessError::Configuration(_))));
    }
}
