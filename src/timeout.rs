use crate::{Error, Result};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Timeout budgets for outbound calls. Every call leaving the process goes
/// through one of these bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout for the caller-supplied operation attempt
    #[serde(with = "crate::config::duration_ms")]
    pub operation_timeout: Duration,
    /// Timeout for a single health probe request
    #[serde(with = "crate::config::duration_ms")]
    pub probe_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Extension trait to bound a future with a deadline
pub trait TimeoutExt<T> {
    /// Run the future, failing with [`Error::Timeout`] once `duration` elapses.
    fn with_timeout(self, duration: Duration) -> impl Future<Output = Result<T>>;
}

impl<F, T> TimeoutExt<T> for F
where
    F: Future<Output = T>,
{
    async fn with_timeout(self, duration: Duration) -> Result<T> {
        match timeout(duration, self).await {
            Ok(value) => Ok(value),
            Err(_) => Err(Error::Timeout { timeout: duration }),
        }
    }
}
