//! Retry decisions and backoff delays for steps and actions.

use std::time::Duration;

use stepwise_types::definition::{BackoffStrategy, RetryPolicy};

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler. All logic lives in associated functions that take
/// the policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow a failed `attempt` (1-based).
    ///
    /// `code` is the handler's error code, if it reported one. A non-empty
    /// `retry_on` list restricts retries to the listed codes; `no_retry_on`
    /// always wins.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, code: Option<&str>) -> bool {
        if attempt >= policy.max_attempts {
            return false;
        }
        if let Some(code) = code {
            if policy.no_retry_on.iter().any(|c| c == code) {
                return false;
            }
        }
        if !policy.retry_on.is_empty() {
            return code.is_some_and(|code| policy.retry_on.iter().any(|c| c == code));
        }
        true
    }

    /// Delay before the attempt that follows failed `attempt` (1-based).
    ///
    /// - `fixed`: `delay_ms`
    /// - `linear`: `delay_ms * attempt`
    /// - `exponential`: `delay_ms * 2^(attempt - 1)`
    ///
    /// Capped at `max_delay_ms` when set.
    pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = policy.delay_ms;
        let ms = match policy.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        let ms = policy.max_delay_ms.map_or(ms, |cap| ms.min(cap));
        Duration::from_millis(ms)
    }

    /// Policy for a step or action with no explicit retry: one attempt.
    pub fn single_attempt() -> RetryPolicy {
        RetryPolicy::new(1, 0, BackoffStrategy::Fixed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
