//! Retry scheduling for failed deliveries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::DeliveryMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Constant interval.
    Linear,
    /// `base * 2^(attempt - 1)`, capped.
    Exponential,
}

impl RetryStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linear" => Some(Self::Linear),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

/// Delay before the next attempt, after `attempt` attempts have failed.
///
/// `attempt` is 1-based. Exponential delays are capped at `max_delay`.
#[must_use]
pub fn retry_delay(
    strategy: RetryStrategy,
    base: Duration,
    attempt: u32,
    max_delay: Duration,
) -> Duration {
    match strategy {
        RetryStrategy::Linear => base,
        RetryStrategy::Exponential => {
            let exponent = attempt.saturating_sub(1).min(31);
            base.checked_mul(1u32 << exponent)
                .map_or(max_delay, |delay| delay.min(max_delay))
        }
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { at: DateTime<Utc> },
    Exhausted,
}

/// Decide whether a delivery that has made `attempts` attempts gets another.
#[must_use]
pub fn next_attempt(
    metadata: &DeliveryMetadata,
    attempts: u32,
    max_delay: Duration,
    now: DateTime<Utc>,
) -> RetryDecision {
    if attempts >= metadata.retry_limit {
        return RetryDecision::Exhausted;
    }

    let delay = retry_delay(
        metadata.strategy,
        Duration::from_secs(metadata.interval_secs),
        attempts,
        max_delay,
    );
    match chrono::Duration::from_std(delay) {
        Ok(delay) => RetryDecision::Retry { at: now + delay },
        Err(_) => RetryDecision::Exhausted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: Duration = Duration::from_secs(7200);

    #[test]
    fn test_exponential_doubles_from_base() {
        let base = Duration::from_secs(10);
        let delays: Vec<u64> = (1..=4)
            .map(|n| retry_delay(RetryStrategy::Exponential, base, n, CAP).as_secs())
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80]);
    }

    #[test]
    fn test_exponential_is_capped() {
        let delay = retry_delay(
            RetryStrategy::Exponential,
            Duration::from_secs(10),
            40,
            Duration::from_secs(300),
        );
        assert_eq!(delay, Duration::from_secs(300));
    }

    #[test]
    fn test_linear_is_constant() {
        for n in 1..10 {
            assert_eq!(
                retry_delay(RetryStrategy::Linear, Duration::from_secs(10), n, CAP),
                Duration::from_secs(10)
            );
        }
    }

    #[test]
    fn test_next_attempt_exhaustion() {
        let metadata = DeliveryMetadata {
            strategy: RetryStrategy::Exponential,
            interval_secs: 1,
            retry_limit: 3,
        };
        let now = Utc::now();
        assert_eq!(
            next_attempt(&metadata, 2, CAP, now),
            RetryDecision::Retry {
                at: now + chrono::Duration::seconds(2)
            }
        );
        assert_eq!(next_attempt(&metadata, 3, CAP, now), RetryDecision::Exhausted);
    }
}
