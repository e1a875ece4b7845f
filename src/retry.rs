//! Retry policies for failed fetch attempts.
//!
//! A policy is a pure function of the number of retries already performed:
//! it either stops or asks for another attempt after a delay.
//!
//! | Policy | Behavior |
//! |--------|----------|
//! | `Never` | First failure settles the entity into `error` |
//! | `Fixed` | Up to `count` retries, `delay` apart |
//! | `Exponential` | Up to `count` retries, `base * 2^n`, capped at `max` |

use std::time::Duration;

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up; the failure is dispatched as `error`.
    Stop,
    /// Suspend for the given delay, then invoke the fetch function again.
    RetryAfter(Duration),
}

/// Retry policy for fetch failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Never retry.
    Never,

    /// Fixed attempt budget with a fixed delay between attempts.
    Fixed {
        /// Number of retries after the initial attempt
        count: u32,
        /// Delay before each retry
        delay: Duration,
    },

    /// Attempt budget with exponentially growing delay.
    Exponential {
        /// Number of retries after the initial attempt
        count: u32,
        /// Delay before the first retry
        base: Duration,
        /// Upper bound for any single delay
        max: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed {
            count: 3,
            delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Fixed policy; `count == 0` disables retries entirely.
    pub fn fixed(count: u32, delay: Duration) -> Self {
        if count == 0 {
            RetryPolicy::Never
        } else {
            RetryPolicy::Fixed { count, delay }
        }
    }

    /// Maximum number of retries after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::Never => 0,
            RetryPolicy::Fixed { count, .. } | RetryPolicy::Exponential { count, .. } => *count,
        }
    }

    /// Decide what to do after a failure, given how many retries already ran.
    pub fn decide(&self, retries_done: u32) -> RetryDecision {
        if retries_done >= self.max_retries() {
            return RetryDecision::Stop;
        }

        match self {
            RetryPolicy::Never => RetryDecision::Stop,
            RetryPolicy::Fixed { delay, .. } => RetryDecision::RetryAfter(*delay),
            RetryPolicy::Exponential { base, max, .. } => {
                let factor = 2u32.saturating_pow(retries_done);
                let delay = base.checked_mul(factor).unwrap_or(*max).min(*max);
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_budget() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(50));
        assert_eq!(
            policy.decide(0),
            RetryDecision::RetryAfter(Duration::from_millis(50))
        );
        assert_eq!(
            policy.decide(1),
            RetryDecision::RetryAfter(Duration::from_millis(50))
        );
        assert_eq!(policy.decide(2), RetryDecision::Stop);
    }

    #[test]
    fn test_zero_count_is_never() {
        let policy = RetryPolicy::fixed(0, Duration::from_secs(1));
        assert_eq!(policy, RetryPolicy::Never);
        assert_eq!(policy.decide(0), RetryDecision::Stop);
    }

    #[test]
    fn test_exponential_caps() {
        let policy = RetryPolicy::Exponential {
            count: 10,
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(
            policy.decide(0),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(2),
            RetryDecision::RetryAfter(Duration::from_millis(400))
        );
        assert_eq!(
            policy.decide(3),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
        assert_eq!(policy.decide(10), RetryDecision::Stop);
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(RetryPolicy::default().max_retries(), 3);
    }
}
