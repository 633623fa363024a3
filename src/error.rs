use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure kinds, tagged once at the call boundary so the
/// retry classifier can match on them instead of sniffing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    ConnectionRefused,
    ConnectionReset,
    BrokenPipe,
    DnsFailure,
    Timeout,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionReset => "connection reset",
            Self::BrokenPipe => "broken pipe",
            Self::DnsFailure => "dns resolution failed",
            Self::Timeout => "network timeout",
        };
        f.write_str(label)
    }
}

/// Error taxonomy for the resilience layer
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (permanent failures)
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors (permanent)
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    // Transport errors (transient - should retry)
    #[error("Network error ({kind}): {endpoint}")]
    Network {
        kind: NetworkErrorKind,
        endpoint: String,
    },

    // HTTP responses carrying an error status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    // Local deadline elapsed before the operation finished
    #[error("Operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    // Client errors (permanent - don't retry)
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    // Circuit breaker short-circuit
    #[error("Circuit breaker open for service: {service}")]
    CircuitOpen { service: String },

    // Terminal wrapper once the retry budget is spent
    #[error("Operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    // Cache errors
    #[error("Cache error: {operation} failed - {reason}")]
    Cache { operation: String, reason: String },

    // General service error
    #[error("Service error: {0}")]
    Service(String),
}

/// Error categorization for retry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Permanent errors - should not retry
    Permanent,
    /// Transient errors - safe to retry
    Transient,
    /// Circuit breaker short-circuit - stop calling temporarily
    CircuitOpen,
}

impl Error {
    /// Categorize error for retry logic
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::Serde(_)
            | Self::InvalidInput { .. }
            | Self::Cache { .. }
            | Self::RetriesExhausted { .. } => ErrorCategory::Permanent,

            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,

            Self::Network { .. } | Self::Timeout { .. } => ErrorCategory::Transient,

            // 408/429 and server errors are transient, other 4xx permanent
            Self::Http { status, .. } => match *status {
                408 | 429 | 500..=599 => ErrorCategory::Transient,
                400..=499 => ErrorCategory::Permanent,
                _ => ErrorCategory::Transient,
            },

            Self::Service(_) => ErrorCategory::Transient,
        }
    }

    /// Check if error is retryable under the default classification
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Transport kind, when this error was tagged at a network boundary
    #[must_use]
    pub const fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::Network { kind, .. } => Some(*kind),
            Self::Timeout { .. } => Some(NetworkErrorKind::Timeout),
            _ => None,
        }
    }

    /// HTTP status, when this error carries one
    #[must_use]
    pub const fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify a reqwest failure once, at the boundary where it happened.
    #[must_use]
    pub fn from_reqwest(endpoint: impl Into<String>, err: &reqwest::Error) -> Self {
        let endpoint = endpoint.into();
        if err.is_timeout() {
            Self::Network {
                kind: NetworkErrorKind::Timeout,
                endpoint,
            }
        } else if err.is_connect() {
            Self::Network {
                kind: NetworkErrorKind::ConnectionRefused,
                endpoint,
            }
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: format!("{endpoint}: {err}"),
            }
        } else {
            Self::Network {
                kind: NetworkErrorKind::ConnectionReset,
                endpoint,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
