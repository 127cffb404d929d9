//! Cross-attempt retry policy.

use std::time::Duration;

use ferry_protocol::ErrorKind;
use ferry_transfer::EngineError;

/// Backoff and retry limits applied by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first transient retry.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Retries granted for `NETWORK_TIMEOUT` and `REMOTE_DISCONNECT`.
    pub max_retries: u32,
    /// Extra whole-task retries after a chunked attempt that left a
    /// checkpoint behind.
    pub partial_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_factor: 2.0,
            max_retries: 3,
            partial_retries: 1,
        }
    }
}

/// Retries already spent by one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryHistory {
    pub transient: u32,
    pub partial: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Transient,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, reason: RetryReason },
    GiveUp,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): 1s, 2s, 4s with the
    /// default policy.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Decides whether a failed attempt is tried again.
    pub fn decide(&self, err: &EngineError, history: RetryHistory) -> RetryDecision {
        let kind = err.kind();
        if matches!(kind, ErrorKind::PermissionDenied | ErrorKind::ValidationFailed) {
            return RetryDecision::GiveUp;
        }
        if kind.is_transient() && history.transient < self.max_retries {
            return RetryDecision::Retry {
                delay: self.delay_for_attempt(history.transient + 1),
                reason: RetryReason::Transient,
            };
        }
        if err.is_partial() && history.partial < self.partial_retries {
            return RetryDecision::Retry {
                delay: self.initial_delay,
                reason: RetryReason::Partial,
            };
        }
        RetryDecision::GiveUp
    }
}
