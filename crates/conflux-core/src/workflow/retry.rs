//! Retry policy evaluation: backoff delays and attempt budgets.
//!
//! Stateless, like the other policy helpers: every function takes the policy
//! and the attempt count as parameters, so the decision for a given attempt is
//! reproducible when the log is replayed.

use std::time::Duration;

use conflux_types::error::{FailureKind, StepFailure};
use conflux_types::workflow::RetryPolicy;

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt after the given delay.
    RetryAfter(Duration),
    /// The failure is terminal for this round of attempts.
    Exhausted,
}

// ---------------------------------------------------------------------------
// RetryEvaluator
// ---------------------------------------------------------------------------

/// Stateless retry policy evaluator.
pub struct RetryEvaluator;

impl RetryEvaluator {
    /// Delay before attempt `n + 1`, given that attempt `n` (1-based) failed:
    /// `base_delay * multiplier^(n-1)`, capped at `max_delay`.
    pub fn delay_for(policy: &RetryPolicy, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = policy.base_delay_ms as f64 * policy.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(policy.max_delay_ms as f64)
        } else {
            policy.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0).round() as u64)
    }

    /// Whether a failure of this kind may be retried under the policy.
    ///
    /// Transient and circuit-open failures always may; timeouts only when the
    /// policy opts in; permanent and cancellation failures never.
    pub fn is_retryable(policy: &RetryPolicy, kind: FailureKind) -> bool {
        match kind {
            FailureKind::Transient | FailureKind::CircuitOpen => true,
            FailureKind::Timeout => policy.retry_on_timeout,
            FailureKind::Permanent | FailureKind::Cancelled => false,
        }
    }

    /// Decide what follows the `attempts_in_round`-th failed attempt.
    ///
    /// A circuit-open rejection waits for at least the remaining cooldown.
    pub fn decide(
        policy: &RetryPolicy,
        attempts_in_round: u32,
        failure: &StepFailure,
    ) -> RetryDecision {
        if attempts_in_round >= policy.max_attempts || !Self::is_retryable(policy, failure.kind) {
            return RetryDecision::Exhausted;
        }
        let backoff = Self::delay_for(policy, attempts_in_round);
        let delay = match failure.retry_after_ms {
            Some(ms) if failure.kind == FailureKind::CircuitOpen => {
                backoff.max(Duration::from_millis(ms))
            }
            _ => backoff,
        };
        RetryDecision::RetryAfter(delay)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
