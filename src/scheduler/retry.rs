//! Bounded retries with exponential backoff.

use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::{CheckResult, Monitor};
use crate::probe::classify::classify;
use crate::probe::{run_probe, Checker};

/// Retry/backoff settings shared by every monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt, and the minimum delay
    pub base_delay: Duration,
    /// Upper bound on any delay, jitter included
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

/// The decisive result of a cycle and how many attempts it took.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub result: CheckResult,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait after `failed_attempts` consecutive failures.
    pub fn backoff_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let delay = if self.jitter && !delay.is_zero() {
            // Up to +25% so monitors sharing a failed dependency spread out
            let spread = delay.as_millis() as u64 / 4;
            delay + Duration::from_millis(rand::random::<u64>() % (spread + 1))
        } else {
            delay
        };

        delay.clamp(self.base_delay, self.max_delay)
    }

    /// Probe `monitor` up to `retry_attempts + 1` times, stopping at the first success.
    ///
    /// Returns `None` if `cancel` fires before a result is decided.
    pub async fn run(
        &self,
        monitor: &Monitor,
        checker: &dyn Checker,
        cancel: &CancellationToken,
    ) -> Option<RetryOutcome> {
        let total = monitor.retry_attempts.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return None;
            }

            let outcome = run_probe(checker, monitor, cancel).await?;
            if outcome.success || attempt >= total {
                return Some(RetryOutcome {
                    result: classify(monitor.id, Utc::now(), outcome),
                    attempts: attempt,
                });
            }

            let delay = self.backoff_delay(attempt);
            tracing::warn!(
                "Monitor {}: attempt {}/{} failed ({}), retrying in {:?}",
                monitor.id,
                attempt,
                total,
                outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no detail".to_string()),
                delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
