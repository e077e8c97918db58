//! Reconnect strategies for the connection loop.
//!
//! The loop never hard-codes a backoff schedule. After every failed attempt it
//! asks the injected [`RetryPolicy`] how long to wait, or whether to give up.

use std::time::Duration;

use crate::error::StreamError;

/// What the connection loop should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then reconnect.
    RetryAfter(Duration),
    /// Stop reconnecting; pending requests fail with `RetryExhausted`.
    Stop,
}

/// Strategy deciding the delay before the next connection attempt.
///
/// `failures` counts consecutive failures since the last successful
/// connection, starting at 1.
pub trait RetryPolicy: Send + Sync {
    fn next_delay(&self, failures: u32, last_error: &StreamError) -> RetryDecision;

    /// Side-effecting hook invoked right before a retry is scheduled.
    fn on_before_retry(&self, _error: &StreamError, _failures: u32) {}
}

impl<F> RetryPolicy for F
where
    F: Fn(u32, &StreamError) -> RetryDecision + Send + Sync,
{
    fn next_delay(&self, failures: u32, last_error: &StreamError) -> RetryDecision {
        self(failures, last_error)
    }
}

/// Constant delay between attempts.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy for FixedBackoff {
    fn next_delay(&self, failures: u32, _last_error: &StreamError) -> RetryDecision {
        if self.max_attempts.is_some_and(|max| failures >= max) {
            return RetryDecision::Stop;
        }
        RetryDecision::RetryAfter(self.delay)
    }
}

/// Doubling delay capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, failures: u32, _last_error: &StreamError) -> RetryDecision {
        if self.max_attempts.is_some_and(|max| failures >= max) {
            return RetryDecision::Stop;
        }
        let shift = failures.saturating_sub(1).min(31);
        let delay = self.initial.saturating_mul(1u32 << shift).min(self.max);
        RetryDecision::RetryAfter(delay)
    }
}

/// Failure bookkeeping owned by the connection loop.
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<StreamError>,
}

impl RetryState {
    /// Record a failed attempt and return the new failure count.
    pub fn record_failure(&mut self, error: StreamError) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error);
        self.attempts
    }

    /// Called on every successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost() -> StreamError {
        StreamError::ConnectionLost("test".into())
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.next_delay(1, &lost()), RetryDecision::RetryAfter(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2, &lost()), RetryDecision::RetryAfter(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(4, &lost()), RetryDecision::RetryAfter(Duration::from_millis(800)));
        assert_eq!(policy.next_delay(40, &lost()), RetryDecision::RetryAfter(Duration::from_secs(30)));
    }

    #[test]
    fn fixed_stops_at_max_attempts() {
        let policy = FixedBackoff { delay: Duration::from_millis(10), max_attempts: Some(3) };
        assert_eq!(policy.next_delay(2, &lost()), RetryDecision::RetryAfter(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(3, &lost()), RetryDecision::Stop);
    }

    #[test]
    fn closure_policy() {
        let policy = |failures: u32, _: &StreamError| {
            if failures > 1 { RetryDecision::Stop } else { RetryDecision::RetryAfter(Duration::ZERO) }
        };
        assert_eq!(policy.next_delay(1, &lost()), RetryDecision::RetryAfter(Duration::ZERO));
        assert_eq!(policy.next_delay(2, &lost()), RetryDecision::Stop);
    }

    #[test]
    fn retry_state_resets() {
        let mut state = RetryState::default();
        assert_eq!(state.record_failure(lost()), 1);
        assert_eq!(state.record_failure(lost()), 2);
        assert_eq!(state.last_error, Some(lost()));
        state.reset();
        assert_eq!(state.attempts, 0);
        assert!(state.last_error.is_none());
    }
}
