use crate::cache::{CacheConfig, ResponseCache};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::fallback::FallbackPolicyEngine;
use crate::health::{HealthMonitor, HealthMonitorConfig};
use crate::orchestrator::ResilienceOrchestrator;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Serde helper: durations declared as integer milliseconds in files/env
pub mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Aggregated configuration for the whole resilience layer.
///
/// Layering: struct defaults, then an optional TOML file, then
/// `RESILIENCE_`-prefixed environment variables (e.g.
/// `RESILIENCE_CACHE__CAPACITY=500`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub health: HealthMonitorConfig,
    pub timeouts: TimeoutConfig,
}

impl ResilienceConfig {
    /// Load from the environment, honoring `RESILIENCE_CONFIG` as an
    /// optional config-file path.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("RESILIENCE_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("RESILIENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load from an explicit TOML file over the defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        let loaded: Self = settings.try_deserialize()?;
        loaded.validate()?;
        info!("Loaded resilience configuration from {}", path.display());
        Ok(loaded)
    }

    /// Reject configurations that would disable or distort the layer.
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.circuit_breaker.open_timeout.is_zero() {
            return Err(invalid("circuit_breaker.open_timeout", "must be non-zero"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor", "must be at least 1.0"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(invalid("retry.base_delay", "must not exceed retry.max_delay"));
        }
        if self.cache.capacity == 0 {
            return Err(invalid("cache.capacity", "must be at least 1"));
        }
        if self.cache.default_ttl.is_zero() {
            return Err(invalid("cache.default_ttl", "must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.health.error_rate_threshold) {
            return Err(invalid(
                "health.error_rate_threshold",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.health.alert_history_limit == 0 {
            return Err(invalid("health.alert_history_limit", "must be at least 1"));
        }
        if self.timeouts.operation_timeout.is_zero() || self.timeouts.probe_timeout.is_zero() {
            return Err(invalid("timeouts", "timeout budgets must be non-zero"));
        }
        Ok(())
    }

    /// Build a fresh orchestrator from this configuration. Each call yields
    /// isolated instances; tests construct one per case.
    #[must_use]
    pub fn build_orchestrator(&self) -> ResilienceOrchestrator {
        ResilienceOrchestrator::new(
            Arc::new(CircuitBreakerRegistry::new(self.circuit_breaker.clone())),
            Arc::new(ResponseCache::new(self.cache.clone())),
            Arc::new(FallbackPolicyEngine::new()),
            self.timeouts.clone(),
        )
    }

    /// Build a fresh health monitor from this configuration.
    #[must_use]
    pub fn build_monitor(&self) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(self.health.clone()))
    }
}

fn invalid(field: &str, reason: &str) -> Error {
    Error::InvalidInput {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_validate() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[circuit_breaker]
failure_threshold = 2
open_timeout = 5000

[cache]
capacity = 50

[retry]
max_retries = 1
jitter = false
"#
        )
        .unwrap();

        let config = ResilienceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.open_timeout, Duration::from_secs(5));
        assert_eq!(config.cache.capacity, 50);
        assert_eq!(config.retry.max_retries, 1);
        assert!(!config.retry.jitter);
        // Untouched sections keep their defaults
        assert_eq!(config.health.alert_history_limit, 1000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = ResilienceConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidInput { field, .. }) if field == "circuit_breaker.failure_threshold"
        ));

        let mut config = ResilienceConfig::default();
        config.retry.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.health.error_rate_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_build_orchestrator_yields_isolated_instances() {
        let config = ResilienceConfig::default();
        let first = config.build_orchestrator();
        let second = config.build_orchestrator();

        first.breakers().record_failure("ai-backend").await;
        let snapshot = second.breakers().snapshot().await;
        assert!(snapshot.is_empty());
    }
}
