use crate::error::{ErrorCategory, NetworkErrorKind};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry configuration, immutable per call
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Initial delay between attempts
    #[serde(with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    /// Cap on the computed delay
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Randomize each delay by +/-10% to avoid synchronized retry storms
    pub jitter: bool,
    /// Transport failure kinds worth retrying
    pub retryable_network_errors: HashSet<NetworkErrorKind>,
    /// HTTP statuses worth retrying
    pub retryable_status_codes: HashSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            retryable_network_errors: HashSet::from([
                NetworkErrorKind::ConnectionRefused,
                NetworkErrorKind::ConnectionReset,
                NetworkErrorKind::BrokenPipe,
                NetworkErrorKind::DnsFailure,
                NetworkErrorKind::Timeout,
            ]),
            retryable_status_codes: HashSet::from([408, 429, 500, 502, 503, 504]),
        }
    }
}

impl RetryConfig {
    /// Classify an error against this configuration.
    ///
    /// Retryable when the transport kind or HTTP status is in the configured
    /// sets. Everything the taxonomy marks permanent stays permanent.
    #[must_use]
    pub fn is_retryable(&self, error: &Error) -> bool {
        if error.category() != ErrorCategory::Transient {
            return false;
        }
        if let Some(kind) = error.network_kind() {
            return self.retryable_network_errors.contains(&kind);
        }
        if let Some(status) = error.http_status() {
            return self.retryable_status_codes.contains(&status);
        }
        // Transient without a tag (e.g. Service) follows the default taxonomy
        true
    }
}

/// Result of a successful retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Attempts consumed, counting the successful one
    pub attempts: u32,
    /// Wall time across all attempts and backoff sleeps
    pub elapsed: Duration,
}

/// Runs operations with bounded attempts and exponential backoff.
///
/// Holds no shared state, so one executor can serve concurrent independent
/// calls.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute `operation` with up to `max_retries + 1` attempts.
    ///
    /// Non-retryable errors propagate immediately, untouched. Once attempts
    /// are exhausted the last error is wrapped in
    /// [`Error::RetriesExhausted`] with the attempt count.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<RetryOutcome<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_cancellable(operation_name, &CancellationToken::new(), operation)
            .await
    }

    /// Like [`execute`](Self::execute), but a cancelled `cancel` token aborts
    /// the backoff sleep and surfaces the pending failure immediately.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<RetryOutcome<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 1u32;

        loop {
            debug!(
                "Executing operation '{}' (attempt {}/{})",
                operation_name, attempt, max_attempts
            );

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            "Operation '{}' succeeded after {} attempts",
                            operation_name, attempt
                        );
                    }
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Err(error) => {
                    if !self.config.is_retryable(&error) {
                        debug!(
                            "Operation '{}' failed with non-retryable error: {}",
                            operation_name, error
                        );
                        return Err(error);
                    }

                    if attempt >= max_attempts {
                        warn!(
                            "Operation '{}' failed after {} attempts: {}",
                            operation_name, attempt, error
                        );
                        return Err(Error::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(error),
                        });
                    }

                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        "Operation '{}' failed (attempt {}), retrying after {:?}: {}",
                        operation_name, attempt, delay, error
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            debug!(
                                "Operation '{}' cancelled during backoff",
                                operation_name
                            );
                            return Err(Error::RetriesExhausted {
                                attempts: attempt,
                                source: Box::new(error),
                            });
                        }
                        () = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff delay after the given 1-based attempt:
    /// `min(base * factor^(attempt-1), max)`, jittered when enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1);
        let exponential_ms = base_ms * self.config.backoff_factor.powi(exponent as i32);
        let capped_ms = exponential_ms.min(self.config.max_delay.as_millis() as f64);
        let delay = Duration::from_millis(capped_ms as u64);

        if self.config.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }
}

/// Uniform +/-10% offset, clamped at zero
fn apply_jitter(delay: Duration) -> Duration {
    use rand::Rng;

    let delay_ms = delay.as_millis() as i64;
    let spread = delay_ms / 10;
    if spread == 0 {
        return delay;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis(delay_ms.saturating_add(offset).max(0) as u64)
}
