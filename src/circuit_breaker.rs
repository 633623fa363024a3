use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the open timeout elapses
    Open,
    /// One trial request is allowed through
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial
    #[serde(with = "crate::config::duration_ms")]
    pub open_timeout: Duration,
    /// Event channel capacity; oldest events are dropped on overflow
    pub event_capacity: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            event_capacity: 64,
        }
    }
}

/// Per-service mutable state.
///
/// Invariant: `next_attempt_time` is `Some` exactly while `state` is `Open`.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

/// Outcome of a gate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub can_proceed: bool,
    pub state: CircuitState,
}

/// Emitted when a circuit transitions to open
#[derive(Debug, Clone, Serialize)]
pub struct CircuitEvent {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Read-only view of a breaker for stats reporting
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Time until the next trial is allowed, when open
    pub retry_in: Option<Duration>,
}

/// Per-service-name circuit breakers, created lazily on first reference and
/// kept for the life of the process.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<Mutex<BreakerState>>>>,
    config: CircuitBreakerConfig,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            events,
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Subscribe to circuit-open events. The channel is bounded; slow
    /// subscribers observe a lag error and miss the oldest events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    async fn breaker_for(&self, service: &str) -> Arc<Mutex<BreakerState>> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(service) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!("Registering circuit breaker for service: {}", service);
                Arc::new(Mutex::new(BreakerState::new()))
            })
            .clone()
    }

    /// Gate check for one logical call.
    ///
    /// Closed and half-open circuits allow the call. An open circuit rejects
    /// it unless the open timeout has elapsed, in which case the circuit
    /// moves to half-open and this call becomes the trial.
    pub async fn check(&self, service: &str) -> CheckOutcome {
        let breaker = self.breaker_for(service).await;
        let mut state = breaker.lock().await;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => CheckOutcome {
                can_proceed: true,
                state: state.state,
            },
            CircuitState::Open => {
                let elapsed = state
                    .next_attempt_time
                    .is_some_and(|at| Instant::now() >= at);
                if elapsed {
                    state.state = CircuitState::HalfOpen;
                    state.next_attempt_time = None;
                    info!(
                        "Circuit breaker '{}': transitioning from open to half-open",
                        service
                    );
                    CheckOutcome {
                        can_proceed: true,
                        state: CircuitState::HalfOpen,
                    }
                } else {
                    CheckOutcome {
                        can_proceed: false,
                        state: CircuitState::Open,
                    }
                }
            }
        }
    }

    /// Record a successful call: the circuit closes and counters reset.
    pub async fn record_success(&self, service: &str) {
        let breaker = self.breaker_for(service).await;
        let mut state = breaker.lock().await;

        if state.state != CircuitState::Closed {
            info!("Circuit breaker '{}': closing after success", service);
        }
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.last_failure_time = None;
        state.next_attempt_time = None;
    }

    /// Record a failed call. Reaching the threshold while closed, or any
    /// failure while half-open, opens the circuit and emits a
    /// [`CircuitEvent`].
    pub async fn record_failure(&self, service: &str) {
        let breaker = self.breaker_for(service).await;
        let mut state = breaker.lock().await;

        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        let should_open = match state.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            state.state = CircuitState::Open;
            state.next_attempt_time = Some(Instant::now() + self.config.open_timeout);
            warn!(
                "Circuit breaker '{}': opening after {} failures",
                service, state.failure_count
            );
            let _ = self.events.send(CircuitEvent {
                service: service.to_string(),
                state: CircuitState::Open,
                failure_count: state.failure_count,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Current state without side effects (no half-open transition)
    pub async fn state(&self, service: &str) -> CircuitState {
        let breaker = self.breaker_for(service).await;
        let state = breaker.lock().await;
        state.state
    }

    /// Snapshot of every known breaker, for stats reporting
    pub async fn snapshot(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers = self.breakers.read().await;
        let mut snapshots = HashMap::with_capacity(breakers.len());

        for (service, breaker) in breakers.iter() {
            let state = breaker.lock().await;
            snapshots.insert(
                service.clone(),
                BreakerSnapshot {
                    state: state.state,
                    failure_count: state.failure_count,
                    retry_in: state
                        .next_attempt_time
                        .map(|at| at.saturating_duration_since(Instant::now())),
                },
            );
        }

        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn registry(threshold: u32, open_timeout: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            open_timeout,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_unknown_service_starts_closed() {
        let registry = CircuitBreakerRegistry::with_defaults();
        let outcome = registry.check("ai-backend").await;

        assert!(outcome.can_proceed);
        assert_eq!(outcome.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let registry = registry(3, Duration::from_secs(60));

        for _ in 0..2 {
            registry.record_failure("ai-backend").await;
            assert!(registry.check("ai-backend").await.can_proceed);
        }

        registry.record_failure("ai-backend").await;
        let outcome = registry.check("ai-backend").await;
        assert!(!outcome.can_proceed);
        assert_eq!(outcome.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let registry = registry(3, Duration::from_secs(60));

        registry.record_failure("ai-backend").await;
        registry.record_failure("ai-backend").await;
        registry.record_success("ai-backend").await;

        // Two more failures stay under the threshold after the reset
        registry.record_failure("ai-backend").await;
        registry.record_failure("ai-backend").await;
        assert!(registry.check("ai-backend").await.can_proceed);
    }

    #[tokio::test]
    async fn test_half_open_after_timeout_then_closes_on_success() {
        let registry = registry(1, Duration::from_millis(20));

        registry.record_failure("ai-backend").await;
        assert!(!registry.check("ai-backend").await.can_proceed);

        sleep(Duration::from_millis(30)).await;

        let outcome = registry.check("ai-backend").await;
        assert!(outcome.can_proceed);
        assert_eq!(outcome.state, CircuitState::HalfOpen);

        registry.record_success("ai-backend").await;
        assert_eq!(registry.state("ai-backend").await, CircuitState::Closed);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot["ai-backend"].failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let registry = registry(1, Duration::from_millis(20));

        registry.record_failure("ai-backend").await;
        sleep(Duration::from_millis(30)).await;
        assert!(registry.check("ai-backend").await.can_proceed);

        registry.record_failure("ai-backend").await;
        let outcome = registry.check("ai-backend").await;
        assert!(!outcome.can_proceed);
        assert_eq!(outcome.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_emits_single_event() {
        let registry = registry(2, Duration::from_secs(60));
        let mut events = registry.subscribe();

        registry.record_failure("ai-backend").await;
        registry.record_failure("ai-backend").await;
        // Further failures while open do not re-emit
        registry.record_failure("ai-backend").await;

        let event = events.try_recv().unwrap();
        assert_eq!(event.service, "ai-backend");
        assert_eq!(event.state, CircuitState::Open);
        assert_eq!(event.failure_count, 2);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_services_are_independent() {
        let registry = registry(1, Duration::from_secs(60));

        registry.record_failure("ai-backend").await;
        assert!(!registry.check("ai-backend").await.can_proceed);
        assert!(registry.check("semantic-engine").await.can_proceed);
    }
}
