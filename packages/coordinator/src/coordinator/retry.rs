//! Bounded retry with exponential backoff
//!
//! Every external call the coordinator makes runs under a per-attempt
//! timeout and an attempt budget. Only transient kinds are retried.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

/// Retry configuration for external calls
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per step (first try included)
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Upper bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if another attempt fits in the budget
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Finality polling budget
#[derive(Debug, Clone)]
pub struct FinalityConfig {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_polls: 40,
        }
    }
}

/// Coordinator step an external call belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Lock,
    Sign,
    Release,
    Refund,
    Finality,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Lock => "lock",
            Step::Sign => "sign",
            Step::Release => "release",
            Step::Refund => "refund",
            Step::Finality => "finality",
        }
    }

    /// Error reported when an attempt of this step times out
    pub fn timeout_error(&self, after: Duration) -> BridgeError {
        let msg = format!("{} attempt timed out after {:?}", self.as_str(), after);
        match self {
            Step::Sign => BridgeError::SigningUnavailable(msg),
            _ => BridgeError::ChainUnavailable(msg),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action to take after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Retry after a backoff period
    RetryAfter(Duration),
    /// Stop and surface the error
    GiveUp,
}

/// Explicit attempt state for one step
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub config: RetryConfig,
    pub step: Step,
    pub attempt: u32,
    pub last_error: Option<BridgeError>,
}

impl RetryContext {
    pub fn new(config: RetryConfig, step: Step) -> Self {
        Self::resuming(config, step, 0)
    }

    /// Continue a budget that already spent `attempts` (persisted on the
    /// record before each submission)
    pub fn resuming(config: RetryConfig, step: Step, attempts: u32) -> Self {
        Self {
            config,
            step,
            attempt: attempts,
            last_error: None,
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, error: BridgeError) {
        self.attempt += 1;
        self.last_error = Some(error);
    }

    pub fn is_exhausted(&self) -> bool {
        !self.config.should_retry(self.attempt)
    }

    /// Get the decision for the next attempt
    pub fn next_action(&self) -> RetryAction {
        let Some(error) = self.last_error.as_ref() else {
            return RetryAction::RetryAfter(Duration::ZERO);
        };

        if !error.is_transient() {
            debug!(step = %self.step, error = %error, "Permanent error - not retrying");
            return RetryAction::GiveUp;
        }
        if self.is_exhausted() {
            warn!(
                step = %self.step,
                attempts = self.attempt,
                error = %error,
                "Retry budget exhausted"
            );
            return RetryAction::GiveUp;
        }

        let backoff = self
            .config
            .backoff_for_attempt(self.attempt.saturating_sub(1));
        RetryAction::RetryAfter(backoff)
    }
}

/// Run one attempt under the per-attempt timeout
pub async fn attempt_with_timeout<T, Fut>(config: &RetryConfig, step: Step, fut: Fut) -> BridgeResult<T>
where
    Fut: Future<Output = BridgeResult<T>>,
{
    match tokio::time::timeout(config.attempt_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(step.timeout_error(config.attempt_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
    }

    #[test]
    fn test_permanent_error_gives_up_immediately() {
        let mut ctx = RetryContext::new(fast_config(5), Step::Lock);
        ctx.record_failure(BridgeError::InsufficientFunds("0".into()));
        assert_eq!(ctx.next_action(), RetryAction::GiveUp);
    }

    #[test]
    fn test_resumed_budget_counts_prior_attempts() {
        let mut ctx = RetryContext::resuming(fast_config(3), Step::Lock, 2);
        ctx.record_failure(BridgeError::ChainUnavailable("down".into()));
        assert!(ctx.is_exhausted());
        assert_eq!(ctx.next_action(), RetryAction::GiveUp);
    }

    #[test]
    fn test_transient_errors_back_off_until_budget() {
        let mut ctx = RetryContext::new(fast_config(3), Step::Release);
        ctx.record_failure(BridgeError::ChainUnavailable("503".into()));
        assert_eq!(ctx.next_action(), RetryAction::RetryAfter(Duration::from_millis(1)));
        ctx.record_failure(BridgeError::ChainUnavailable("503".into()));
        assert_eq!(ctx.next_action(), RetryAction::RetryAfter(Duration::from_millis(2)));
        ctx.record_failure(BridgeError::ChainUnavailable("503".into()));
        assert_eq!(ctx.next_action(), RetryAction::GiveUp);
    }

    #[tokio::test]
    async fn test_attempt_timeout_maps_to_step_kind() {
        let config = RetryConfig {
            attempt_timeout: Duration::from_millis(5),
            ..fast_config(1)
        };
        let result: BridgeResult<()> = attempt_with_timeout(&config, Step::Sign, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(BridgeError::SigningUnavailable(_))));
    }
}
