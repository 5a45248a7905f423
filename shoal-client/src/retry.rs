//! Retry classification and scheduling.
//!
//! Every failed attempt is classified into a [`RetryReason`]; the configured
//! [`RetryStrategy`] then decides whether the operation gets another attempt
//! and after how long. The dispatcher owns the outer deadline: a strategy
//! only ever proposes a delay, and a delay that would overrun the remaining
//! time surfaces as a timeout instead.

use std::fmt::Debug;
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;

pub use shoal_errors::RetryReason;

/// What the strategy decided for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    DoNotRetry,
    RetryAfter(Duration),
}

/// Per-operation retry bookkeeping carried inside the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub idempotent: bool,
    pub attempts: u32,
    pub reasons: Vec<RetryReason>,
}

impl RetryState {
    pub fn new(idempotent: bool) -> Self {
        RetryState {
            idempotent,
            ..Default::default()
        }
    }

    pub fn record(&mut self, reason: RetryReason) {
        self.attempts += 1;
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }
}

/// Decides whether (and when) a failed attempt is retried.
pub trait RetryStrategy: Send + Sync + Debug {
    fn retry_after(&self, state: &RetryState, reason: RetryReason) -> RetryAction;
}

/// The default strategy: retry everything retriable with truncated
/// exponential backoff.
#[derive(Debug, Clone)]
pub struct BestEffortRetryStrategy {
    backoff: BackoffCalculator,
}

impl BestEffortRetryStrategy {
    pub fn new(backoff: BackoffCalculator) -> Self {
        BestEffortRetryStrategy { backoff }
    }
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        BestEffortRetryStrategy::new(BackoffCalculator::default())
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn retry_after(&self, state: &RetryState, reason: RetryReason) -> RetryAction {
        if reason == RetryReason::DoNotRetry {
            return RetryAction::DoNotRetry;
        }
        if state.idempotent || reason.allows_non_idempotent_retry() {
            return RetryAction::RetryAfter(self.backoff.delay_for(state.attempts));
        }
        RetryAction::DoNotRetry
    }
}

/// Never retries; every failure surfaces immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn retry_after(&self, _state: &RetryState, _reason: RetryReason) -> RetryAction {
        RetryAction::DoNotRetry
    }
}

/// Truncated exponential backoff: `min * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffCalculator {
    min: Duration,
    max: Duration,
}

impl BackoffCalculator {
    pub fn new(min: Duration, max: Duration) -> Self {
        BackoffCalculator { min, max }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = (self.min.as_millis() as u64).max(1);
        let mut iter = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max);
        iter.nth(attempt.saturating_sub(1) as usize % 32)
            .unwrap_or(self.max)
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        BackoffCalculator::new(Duration::from_millis(1), Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let calc = BackoffCalculator::new(Duration::from_millis(1), Duration::from_millis(100));
        let d1 = calc.delay_for(1);
        let d2 = calc.delay_for(2);
        let d3 = calc.delay_for(3);
        assert!(d1 < d2 && d2 < d3);
        for attempt in 0..32 {
            assert!(calc.delay_for(attempt) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn best_effort_refuses_do_not_retry() {
        let strategy = BestEffortRetryStrategy::default();
        let state = RetryState::new(true);
        assert_eq!(
            strategy.retry_after(&state, RetryReason::DoNotRetry),
            RetryAction::DoNotRetry
        );
    }

    #[test]
    fn non_idempotent_socket_close_is_not_retried() {
        let strategy = BestEffortRetryStrategy::default();
        let state = RetryState::new(false);
        assert_eq!(
            strategy.retry_after(&state, RetryReason::SocketClosedWhileInFlight),
            RetryAction::DoNotRetry
        );
        let idempotent = RetryState::new(true);
        assert!(matches!(
            strategy.retry_after(&idempotent, RetryReason::SocketClosedWhileInFlight),
            RetryAction::RetryAfter(_)
        ));
    }

    #[test]
    fn routing_failures_retry_regardless_of_idempotency() {
        let strategy = BestEffortRetryStrategy::default();
        let state = RetryState::new(false);
        for reason in [RetryReason::KvNotMyVbucket, RetryReason::KvCollectionOutdated] {
            assert!(matches!(
                strategy.retry_after(&state, reason),
                RetryAction::RetryAfter(_)
            ));
        }
    }

    #[test]
    fn fail_fast_never_retries() {
        let strategy = FailFastRetryStrategy;
        let state = RetryState::new(true);
        assert_eq!(
            strategy.retry_after(&state, RetryReason::KvTemporaryFailure),
            RetryAction::DoNotRetry
        );
    }

    #[test]
    fn retry_state_dedupes_reasons() {
        let mut state = RetryState::new(true);
        state.record(RetryReason::KvLocked);
        state.record(RetryReason::KvLocked);
        state.record(RetryReason::KvNotMyVbucket);
        assert_eq!(state.attempts, 3);
        assert_eq!(
            state.reasons,
            vec![RetryReason::KvLocked, RetryReason::KvNotMyVbucket]
        );
    }
}
