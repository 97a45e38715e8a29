//! Retry with exponential backoff around connection establishment.
//!
//! Only [`ErrorKind::RateLimited`](crate::error::ErrorKind::RateLimited) and
//! [`ErrorKind::TransientTransport`](crate::error::ErrorKind::TransientTransport)
//! are retried. Everything else surfaces on the first failure.
//!
//! ```ignore
//! let policy = RetryPolicy::default().with_max_attempts(5);
//! let stream = with_retry(&policy, &cancel, |_| adapter.connect(&req), |n| {
//!     tracing::info!(attempt = n.attempt, "retrying");
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{GenerationError, Result};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry).
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Uniform jitter ratio applied to each delay (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// [`backoff_delay`](Self::backoff_delay) with uniform jitter applied,
    /// still bounded by `max_delay`.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let offset = rand::rng().random_range(-self.jitter..=self.jitter);
        let jittered = (base * (1.0 + offset)).max(0.0);
        Duration::from_secs_f64(jittered).min(self.max_delay)
    }
}

/// Emitted before each backoff wait.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryNotice {
    /// The attempt about to be made (2 for the first retry).
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    /// Message of the error that triggered the retry.
    pub reason: String,
}

impl RetryNotice {
    /// Status line shown to the user while waiting.
    #[must_use]
    pub fn message(&self) -> String {
        format!(
            "{}. Retrying in {:.1}s (attempt {} of {})...",
            self.reason.trim_end().trim_end_matches('.'),
            self.delay.as_secs_f64(),
            self.attempt,
            self.max_attempts
        )
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// attempts run out.
///
/// `operation` receives the 1-based attempt number. `on_retry` is called
/// before every wait. Exhaustion returns the last error unchanged. Firing
/// `cancel` during a wait or before an attempt returns an abort.
pub async fn with_retry<T, F, Fut, N>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
    mut on_retry: N,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(&RetryNotice),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(GenerationError::aborted());
        }

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if cancel.is_cancelled() {
            return Err(GenerationError::aborted());
        }
        if !error.is_retryable() || attempt >= max_attempts {
            if error.is_retryable() {
                tracing::warn!(attempts = attempt, error = %error, "Retries exhausted");
            }
            return Err(error);
        }

        let delay = policy.jittered_delay(attempt);
        attempt += 1;

        let notice = RetryNotice {
            attempt,
            max_attempts,
            delay,
            reason: error.message().to_string(),
        };
        tracing::info!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            kind = %error.kind(),
            "Retrying after backoff"
        );
        on_retry(&notice);

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GenerationError::aborted()),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
