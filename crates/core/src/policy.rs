use chrono::{DateTime, Duration, Utc};

use crate::types::{Challenge, ChallengeStatus, PropagationState};

const DEFAULT_BASE_SECS: i64 = 30;
const DEFAULT_FACTOR: i64 = 2;
const DEFAULT_CAP_SECS: i64 = 3600;

/// Exponential retry policy applied between probe attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_secs: i64,
    factor: i64,
    cap_secs: i64,
}

impl RetryPolicy {
    /// Creates a policy with a custom base delay, growth factor and cap.
    pub fn new(base_secs: i64, factor: i64, cap_secs: i64) -> Self {
        Self {
            base_secs: base_secs.max(0),
            factor: factor.max(1),
            cap_secs: cap_secs.max(0),
        }
    }

    /// Returns the delay to apply after the `attempt`-th failed attempt.
    ///
    /// Attempt `0` means nothing has failed yet and yields no delay. From
    /// there the delay grows as `base * factor^(attempt - 1)` until it hits
    /// the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::zero();
        }

        let delay = self
            .factor
            .checked_pow(attempt - 1)
            .and_then(|multiplier| self.base_secs.checked_mul(multiplier))
            .map_or(self.cap_secs, |delay| delay.min(self.cap_secs));

        Duration::seconds(delay)
    }

    /// Returns the next due time for a challenge that just recorded `attempt` failures.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now + self.backoff(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_SECS, DEFAULT_FACTOR, DEFAULT_CAP_SECS)
    }
}

/// Returns `true` when the challenge should be picked up by the prober at `now`.
pub fn is_due(challenge: &Challenge, now: DateTime<Utc>) -> bool {
    challenge.status == ChallengeStatus::Issued
        && challenge.propagation_state != PropagationState::Ready
        && challenge.attempt_count < challenge.max_attempts
        && challenge
            .next_attempt_at
            .map(|due| due <= now)
            .unwrap_or(false)
}
