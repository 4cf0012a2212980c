//! Retry with exponential backoff and jitter, plus a polling helper.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ConductorError;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial backoff duration.
    #[serde(with = "crate::util::duration_ms")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    #[serde(with = "crate::util::duration_ms")]
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Scale each sleep by a random 75%-125%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Execute an async operation with retry.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, ConductorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConductorError>>,
    {
        self.execute_cancellable(&CancellationToken::new(), operation)
            .await
    }

    /// Execute with retry, giving up with `CancelledByCaller` as soon as
    /// `cancel` fires (including mid-attempt and mid-backoff).
    pub async fn execute_cancellable<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ConductorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConductorError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = self.initial_backoff.min(self.max_backoff);

        for attempt in 1..=max_attempts {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConductorError::CancelledByCaller),
                outcome = operation() => outcome,
            };
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
                Err(e) => e,
            };

            let mut sleep_for = self.jittered(backoff);
            if let ConductorError::RateLimited {
                retry_after_ms: Some(ms),
            } = &error
            {
                sleep_for = sleep_for.max(Duration::from_millis(*ms));
            }
            tracing::warn!(
                attempt,
                max_attempts,
                backoff_ms = sleep_for.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConductorError::CancelledByCaller),
                _ = tokio::time::sleep(sleep_for) => {}
            }
            backoff = self.next_backoff(backoff);
        }

        Err(ConductorError::InvalidState("retry loop ended without an attempt".into()))
    }

    /// Reject settings the backoff arithmetic cannot use.
    pub fn validate(&self) -> Result<(), ConductorError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConductorError::Configuration(format!(
                "retry.multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConductorError::Configuration(format!(
                "retry.initial_backoff ({}ms) exceeds retry.max_backoff ({}ms)",
                self.initial_backoff.as_millis(),
                self.max_backoff.as_millis()
            )));
        }
        Ok(())
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.multiplier;
        Duration::try_from_secs_f64(next)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        if !self.jitter {
            return backoff;
        }
        let factor = 0.75 + (rand_factor() * 0.5);
        Duration::try_from_secs_f64(backoff.as_secs_f64() * factor).unwrap_or(self.max_backoff)
    }
}

/// Call `probe` until it yields a value, backing off between empty polls.
///
/// Gives up with `Timeout` (total time waited, in ms) once
/// `policy.max_attempts` probes came back empty, and with `CancelledByCaller`
/// when `cancel` fires. Probe errors are returned immediately.
pub async fn poll_until<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, ConductorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ConductorError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff.min(policy.max_backoff);
    let mut waited = Duration::ZERO;

    for attempt in 1..=max_attempts {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConductorError::CancelledByCaller),
            polled = probe() => polled?,
        };
        if let Some(value) = polled {
            return Ok(value);
        }
        if attempt == max_attempts {
            break;
        }

        let sleep_for = policy.jittered(backoff);
        tracing::debug!(attempt, wait_ms = sleep_for.as_millis() as u64, "poll not ready");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConductorError::CancelledByCaller),
            _ = tokio::time::sleep(sleep_for) => {}
        }
        waited = waited.saturating_add(sleep_for);
        backoff = policy.next_backoff(backoff);
    }

    Err(ConductorError::Timeout(u64::try_from(waited.as_millis()).unwrap_or(u64::MAX)))
}

/// Pseudo-random factor in [0, 1) from the clock and thread id.
fn rand_factor() -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);

    (hasher.finish() % 10_000) as f64 / 10_000.0
}
