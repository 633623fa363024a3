pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod orchestrator;
pub mod retry;
pub mod timeout;

pub use cache::{CacheConfig, CacheStats, ResponseCache};
pub use circuit_breaker::{
    BreakerSnapshot, CheckOutcome, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitEvent,
    CircuitState,
};
pub use config::ResilienceConfig;
pub use error::{Error, ErrorCategory, NetworkErrorKind, Result};
pub use fallback::{FallbackContext, FallbackPolicyEngine};
pub use health::{
    Alert, AlertSeverity, AlertType, HealthMonitor, HealthMonitorConfig, HealthProbe,
    HealthResult, HttpHealthProbe, ServiceRegistration, ServiceStatus, SystemStatus,
};
pub use orchestrator::{OrchestratorStats, Resolution, ResilienceOrchestrator, ResponseSource};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
pub use timeout::{TimeoutConfig, TimeoutExt};
