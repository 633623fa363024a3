use crate::cache::{CacheStats, ResponseCache};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use crate::fallback::{FallbackContext, FallbackPolicyEngine};
use crate::timeout::{TimeoutConfig, TimeoutExt};
use crate::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a resolved payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// The live operation succeeded
    Live,
    /// The live path failed; a last-known-good cached response was served
    Cache,
    /// Both the live path and the cache failed; a static fallback was served
    Fallback,
}

/// A degraded-or-live response. The orchestrator always resolves to one of
/// these; it never surfaces an error to its caller.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub payload: Value,
    pub source: ResponseSource,
}

impl Resolution {
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        !matches!(self.source, ResponseSource::Live)
    }
}

/// Aggregate view for the stats surface
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub cache: CacheStats,
    pub breakers: HashMap<String, BreakerSnapshot>,
    pub fallback_categories: Vec<String>,
}

/// Composes the breaker gate, the bounded operation attempt, the response
/// cache and the fallback policy into one call path.
///
/// Construct one per process with explicitly injected parts; tests build
/// isolated instances per case.
pub struct ResilienceOrchestrator {
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<ResponseCache>,
    fallbacks: Arc<FallbackPolicyEngine>,
    timeouts: TimeoutConfig,
}

impl ResilienceOrchestrator {
    #[must_use]
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        cache: Arc<ResponseCache>,
        fallbacks: Arc<FallbackPolicyEngine>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            breakers,
            cache,
            fallbacks,
            timeouts,
        }
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run `operation` against `service`, degrading through cache and
    /// fallback instead of failing.
    ///
    /// The breaker is consulted first; an open circuit resolves a fallback
    /// without invoking the operation. A successful attempt is recorded and
    /// cached; a failed one is recorded, then the cache and finally the
    /// fallback policy answer. The attempt itself is bounded by the
    /// configured operation timeout. Callers wanting retries wrap them
    /// inside `operation`.
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        service: &str,
        category: &str,
        context: &FallbackContext,
        operation: F,
    ) -> Resolution
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let gate = self.breakers.check(service).await;
        if !gate.can_proceed {
            debug!(
                "Circuit open for '{}', resolving fallback for category '{}'",
                service, category
            );
            return Resolution {
                payload: self.fallbacks.resolve(category, context),
                source: ResponseSource::Fallback,
            };
        }

        let key = cache_key(service, category, context);

        match operation().with_timeout(self.timeouts.operation_timeout).await {
            Ok(Ok(payload)) => {
                self.breakers.record_success(service).await;
                self.cache.insert(&key, payload.clone(), None).await;
                Resolution {
                    payload,
                    source: ResponseSource::Live,
                }
            }
            Ok(Err(error)) | Err(error) => {
                self.breakers.record_failure(service).await;
                warn!(
                    "Operation for '{}' (category '{}') failed: {}",
                    service, category, error
                );

                if let Some(cached) = self.cache.get(&key).await {
                    debug!("Serving last-known-good response for '{}'", service);
                    return Resolution {
                        payload: cached,
                        source: ResponseSource::Cache,
                    };
                }

                Resolution {
                    payload: self.fallbacks.resolve(category, context),
                    source: ResponseSource::Fallback,
                }
            }
        }
    }

    /// Cache size, per-service breaker snapshots and known fallback
    /// categories in one view.
    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            cache: self.cache.stats().await,
            breakers: self.breakers.snapshot().await,
            fallback_categories: self.fallbacks.categories(),
        }
    }
}

/// Deterministic cache key over service, category and the ordered context.
fn cache_key(service: &str, category: &str, context: &FallbackContext) -> String {
    let serialized = serde_json::to_string(context).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(service.as_bytes());
    hasher.update(b":");
    hasher.update(category.as_bytes());
    hasher.update(b":");
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}
