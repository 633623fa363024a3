use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rolling window of response-time samples kept per service
const RESPONSE_TIME_WINDOW: usize = 100;

/// How a dependency should be probed. One registration per service name;
/// re-registration overwrites (last write wins).
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    /// Base URL of the dependency, e.g. `http://localhost:8100`
    pub base_url: String,
    /// Health endpoint path appended to the base URL
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Per-attempt probe timeout
    #[serde(default = "default_probe_timeout", with = "crate::config::duration_ms")]
    pub timeout: Duration,
    /// Transport-failure re-attempts within a single probe
    #[serde(default)]
    pub retries: u32,
    /// Critical services escalate alert severity
    #[serde(default)]
    pub critical: bool,
}

fn default_health_path() -> String {
    "/health".to_string()
}

const fn default_probe_timeout() -> Duration {
    Duration::from_secs(3)
}

impl ServiceRegistration {
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            health_path: default_health_path(),
            timeout: default_probe_timeout(),
            retries: 0,
            critical: false,
        }
    }

    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn probe_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.health_path)
    }
}

/// Latest probed status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Outcome of a single probe
#[derive(Debug, Clone)]
pub struct HealthResult {
    pub service: String,
    pub status: ServiceStatus,
    pub response_time: Duration,
    pub error: Option<String>,
}

/// Alert categories raised by threshold evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighResponseTime,
    HighErrorRate,
    ServiceDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A threshold crossing. History is capped; only `acknowledge` mutates one.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub service: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// Default probe cadence used by `start` when none is given
    #[serde(with = "crate::config::duration_ms")]
    pub probe_interval: Duration,
    /// Mean response time above this raises `HighResponseTime`
    #[serde(with = "crate::config::duration_ms")]
    pub response_time_threshold: Duration,
    /// Error rate (0..=1) above this raises `HighErrorRate`
    pub error_rate_threshold: f64,
    /// Alerts kept in history; oldest dropped beyond this
    pub alert_history_limit: usize,
    /// Alert channel capacity; slow subscribers miss the oldest
    pub alert_channel_capacity: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            response_time_threshold: Duration::from_secs(5),
            error_rate_threshold: 0.5,
            alert_history_limit: 1000,
            alert_channel_capacity: 256,
        }
    }
}

/// Transport seam for issuing probes, so tests can script outcomes.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the service once, returning the HTTP status code.
    /// Transport failures surface as tagged errors.
    async fn probe(&self, registration: &ServiceRegistration) -> Result<u16>;
}

/// Probe over HTTP with a bounded per-request timeout
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, registration: &ServiceRegistration) -> Result<u16> {
        let url = registration.probe_url();
        let response = self
            .client
            .get(&url)
            .timeout(registration.timeout)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&url, &e))?;
        Ok(response.status().as_u16())
    }
}

/// Rolling metrics per service, mutated only by the probe path
#[derive(Debug)]
struct HealthMetrics {
    success_count: u64,
    error_count: u64,
    response_times: VecDeque<u64>,
    last_error: Option<LastError>,
    status: ServiceStatus,
    last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthMetrics {
    const fn new() -> Self {
        Self {
            success_count: 0,
            error_count: 0,
            response_times: VecDeque::new(),
            last_error: None,
            status: ServiceStatus::Unknown,
            last_checked: None,
        }
    }

    fn record_sample(&mut self, response_time: Duration) {
        if self.response_times.len() >= RESPONSE_TIME_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times
            .push_back(response_time.as_millis() as u64);
    }

    fn average_response_time(&self) -> Option<Duration> {
        if self.response_times.is_empty() {
            return None;
        }
        let sum: u64 = self.response_times.iter().sum();
        Some(Duration::from_millis(
            sum / self.response_times.len() as u64,
        ))
    }

    fn error_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }
}

/// Per-service summary exposed alongside the system status
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub status: ServiceStatus,
    pub success_count: u64,
    pub error_count: u64,
    pub average_response_time_ms: Option<u64>,
    pub last_error: Option<LastError>,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Aggregate view for the system-status query
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub status: ServiceStatus,
    pub services: ServiceCounts,
    pub alerts: AlertCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceCounts {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertCounts {
    pub total: usize,
    pub unacknowledged: usize,
}

struct MonitorTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Actively probes registered dependencies, keeps rolling metrics, and
/// raises threshold alerts. Independent of the circuit breaker registry:
/// this component only observes, it never gates calls.
pub struct HealthMonitor {
    registrations: RwLock<HashMap<String, ServiceRegistration>>,
    metrics: RwLock<HashMap<String, HealthMetrics>>,
    alerts: RwLock<VecDeque<Alert>>,
    alert_tx: broadcast::Sender<Alert>,
    probe_impl: Arc<dyn HealthProbe>,
    config: HealthMonitorConfig,
    task: Mutex<Option<MonitorTask>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self::with_probe(config, Arc::new(HttpHealthProbe::new()))
    }

    /// Construct with a custom probe transport (tests script outcomes here)
    #[must_use]
    pub fn with_probe(config: HealthMonitorConfig, probe_impl: Arc<dyn HealthProbe>) -> Self {
        let (alert_tx, _) = broadcast::channel(config.alert_channel_capacity.max(1));
        Self {
            registrations: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            alerts: RwLock::new(VecDeque::new()),
            alert_tx,
            probe_impl,
            config,
            task: Mutex::new(None),
        }
    }

    /// Register or replace a service. Metrics are initialized once and
    /// survive re-registration.
    pub async fn register(&self, registration: ServiceRegistration) {
        let name = registration.name.clone();
        info!("Registering service '{}' for health monitoring", name);
        self.registrations
            .write()
            .await
            .insert(name.clone(), registration);
        self.metrics
            .write()
            .await
            .entry(name)
            .or_insert_with(HealthMetrics::new);
    }

    /// Subscribe to the alert stream
    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alert_tx.subscribe()
    }

    /// Probe one service now, updating its metrics and evaluating thresholds.
    pub async fn probe(&self, name: &str) -> Result<HealthResult> {
        let registration = self
            .registrations
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Service(format!("service '{name}' is not registered")))?;

        let result = self.run_probe(&registration).await;
        self.record(&result).await;
        self.evaluate_thresholds(&registration).await;
        Ok(result)
    }

    async fn run_probe(&self, registration: &ServiceRegistration) -> HealthResult {
        let started = Instant::now();
        let mut last_error: Option<Error> = None;

        for attempt in 0..=registration.retries {
            match self.probe_impl.probe(registration).await {
                Ok(status) if status < 500 => {
                    return HealthResult {
                        service: registration.name.clone(),
                        status: ServiceStatus::Healthy,
                        response_time: started.elapsed(),
                        error: None,
                    };
                }
                Ok(status) => {
                    // An answering-but-erroring service is not retried
                    return HealthResult {
                        service: registration.name.clone(),
                        status: ServiceStatus::Degraded,
                        response_time: started.elapsed(),
                        error: Some(format!("health endpoint returned HTTP {status}")),
                    };
                }
                Err(error) => {
                    debug!(
                        "Probe for '{}' failed (attempt {}/{}): {}",
                        registration.name,
                        attempt + 1,
                        registration.retries + 1,
                        error
                    );
                    last_error = Some(error);
                }
            }
        }

        HealthResult {
            service: registration.name.clone(),
            status: ServiceStatus::Unhealthy,
            response_time: started.elapsed(),
            error: last_error.map(|e| e.to_string()),
        }
    }

    async fn record(&self, result: &HealthResult) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics
            .entry(result.service.clone())
            .or_insert_with(HealthMetrics::new);

        entry.record_sample(result.response_time);
        entry.status = result.status;
        entry.last_checked = Some(Utc::now());

        if result.status == ServiceStatus::Healthy {
            entry.success_count += 1;
        } else {
            entry.error_count += 1;
            if let Some(message) = &result.error {
                entry.last_error = Some(LastError {
                    message: message.clone(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    async fn evaluate_thresholds(&self, registration: &ServiceRegistration) {
        let (average, error_rate, status) = {
            let metrics = self.metrics.read().await;
            let Some(entry) = metrics.get(&registration.name) else {
                return;
            };
            (entry.average_response_time(), entry.error_rate(), entry.status)
        };

        if let Some(average) = average {
            if average > self.config.response_time_threshold {
                self.raise_alert(
                    AlertType::HighResponseTime,
                    registration,
                    AlertSeverity::Warning,
                    format!(
                        "average response time {}ms exceeds threshold {}ms",
                        average.as_millis(),
                        self.config.response_time_threshold.as_millis()
                    ),
                )
                .await;
            }
        }

        if error_rate > self.config.error_rate_threshold {
            let severity = if registration.critical {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            self.raise_alert(
                AlertType::HighErrorRate,
                registration,
                severity,
                format!(
                    "error rate {:.0}% exceeds threshold {:.0}%",
                    error_rate * 100.0,
                    self.config.error_rate_threshold * 100.0
                ),
            )
            .await;
        }

        if status == ServiceStatus::Unhealthy && registration.critical {
            self.raise_alert(
                AlertType::ServiceDown,
                registration,
                AlertSeverity::Critical,
                "critical service is unreachable".to_string(),
            )
            .await;
        }
    }

    /// Append an alert unless an unacknowledged one of the same kind is
    /// already pending for this service.
    async fn raise_alert(
        &self,
        alert_type: AlertType,
        registration: &ServiceRegistration,
        severity: AlertSeverity,
        message: String,
    ) {
        let mut alerts = self.alerts.write().await;

        let already_pending = alerts.iter().any(|alert| {
            alert.alert_type == alert_type
                && alert.service == registration.name
                && !alert.acknowledged
        });
        if already_pending {
            return;
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type,
            service: registration.name.clone(),
            severity,
            message,
            timestamp: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        };
        warn!(
            "Health alert for '{}': {:?} ({:?}) - {}",
            alert.service, alert.alert_type, alert.severity, alert.message
        );

        if alerts.len() >= self.config.alert_history_limit {
            alerts.pop_front();
        }
        alerts.push_back(alert.clone());
        let _ = self.alert_tx.send(alert);
    }

    /// Acknowledge an alert by id. Returns false for unknown ids.
    pub async fn acknowledge(&self, id: Uuid) -> bool {
        let mut alerts = self.alerts.write().await;
        for alert in alerts.iter_mut() {
            if alert.id == id && !alert.acknowledged {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(Utc::now());
                info!("Alert {} acknowledged", id);
                return true;
            }
        }
        false
    }

    /// Snapshot of the alert history, newest last
    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.iter().cloned().collect()
    }

    /// Probe every registered service concurrently
    pub async fn probe_all(&self) {
        let names: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        let probes = names.iter().map(|name| self.probe(name));
        for result in join_all(probes).await {
            if let Err(error) = result {
                debug!("Probe round error: {}", error);
            }
        }
    }

    /// Start the periodic probe loop. Idempotent: a second call while the
    /// loop is running is a no-op. One immediate round runs before the
    /// ticker takes over.
    pub async fn start(self: Arc<Self>, interval: Option<Duration>) {
        let interval = interval.unwrap_or(self.config.probe_interval);
        let mut task = self.task.lock().await;

        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Health monitor already running");
            return;
        }

        info!("Starting health monitor (interval {:?})", interval);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let monitor = Arc::clone(&self);

        let handle = tokio::spawn(async move {
            monitor.probe_all().await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // the immediate tick, already consumed above

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => monitor.probe_all().await,
                }
            }
        });

        *task = Some(MonitorTask { handle, cancel });
    }

    /// Stop the probe loop and wait for it to finish. Safe to call when the
    /// monitor is not running.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
            info!("Health monitor stopped");
        }
    }

    /// Per-service rolling summaries
    pub async fn service_report(&self) -> HashMap<String, ServiceSummary> {
        let metrics = self.metrics.read().await;
        metrics
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    ServiceSummary {
                        status: entry.status,
                        success_count: entry.success_count,
                        error_count: entry.error_count,
                        average_response_time_ms: entry
                            .average_response_time()
                            .map(|d| d.as_millis() as u64),
                        last_error: entry.last_error.clone(),
                        last_checked: entry.last_checked,
                    },
                )
            })
            .collect()
    }

    /// Aggregate system status for the monitoring surface
    pub async fn system_status(&self) -> SystemStatus {
        let metrics = self.metrics.read().await;
        let total = metrics.len();
        let healthy = metrics
            .values()
            .filter(|m| m.status == ServiceStatus::Healthy)
            .count();
        let unhealthy = metrics
            .values()
            .filter(|m| m.status == ServiceStatus::Unhealthy)
            .count();
        let degraded_or_unknown = total - healthy - unhealthy;

        let status = if total == 0 {
            ServiceStatus::Unknown
        } else if unhealthy > 0 {
            ServiceStatus::Unhealthy
        } else if degraded_or_unknown > 0 {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Healthy
        };
        drop(metrics);

        let alerts = self.alerts.read().await;
        let unacknowledged = alerts.iter().filter(|a| !a.acknowledged).count();

        SystemStatus {
            status,
            services: ServiceCounts {
                total,
                healthy,
                unhealthy,
            },
            alerts: AlertCounts {
                total: alerts.len(),
                unacknowledged,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    /// Scripted probe transport: pops outcomes front-to-back, then repeats
    /// the configured steady state.
    struct ScriptedProbe {
        script: Mutex<VecDeque<Result<u16>>>,
        steady: u16,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn healthy() -> Self {
            Self::with_script(vec![], 200)
        }

        fn with_script(script: Vec<Result<u16>>, steady: u16) -> Self {
            Self {
                script: Mutex::new(script.into()),
                steady,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _registration: &ServiceRegistration) -> Result<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            match self.script.lock().await.pop_front() {
                Some(outcome) => outcome,
                None => Ok(self.steady),
            }
        }
    }

    fn refused() -> Error {
        Error::Network {
            kind: NetworkErrorKind::ConnectionRefused,
            endpoint: "http://localhost:8100/health".to_string(),
        }
    }

    fn monitor_with(probe: Arc<ScriptedProbe>, config: HealthMonitorConfig) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::with_probe(config, probe))
    }

    #[tokio::test]
    async fn test_probe_maps_status_codes() {
        let probe = Arc::new(ScriptedProbe::with_script(
            vec![Ok(200), Ok(503)],
            200,
        ));
        let monitor = monitor_with(probe, HealthMonitorConfig::default());
        monitor
            .register(ServiceRegistration::new("ai-backend", "http://localhost:8100"))
            .await;

        let first = monitor.probe("ai-backend").await.unwrap();
        assert_eq!(first.status, ServiceStatus::Healthy);

        let second = monitor.probe("ai-backend").await.unwrap();
        assert_eq!(second.status, ServiceStatus::Degraded);
        assert!(second.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_transport_failure_retries_then_unhealthy() {
        let probe = Arc::new(ScriptedProbe::with_script(
            vec![Err(refused()), Err(refused()), Err(refused())],
            200,
        ));
        let monitor = monitor_with(probe.clone(), HealthMonitorConfig::default());
        monitor
            .register(
                ServiceRegistration::new("ai-backend", "http://localhost:8100").with_retries(2),
            )
            .await;

        let result = monitor.probe("ai-backend").await.unwrap();
        assert_eq!(result.status, ServiceStatus::Unhealthy);
        assert_eq!(probe.calls(), 3);

        let report = monitor.service_report().await;
        let summary = &report["ai-backend"];
        assert_eq!(summary.error_count, 1);
        assert!(summary.last_error.as_ref().unwrap().message.contains("refused"));
    }

    #[tokio::test]
    async fn test_probe_unregistered_service_fails() {
        let monitor = monitor_with(Arc::new(ScriptedProbe::healthy()), HealthMonitorConfig::default());
        assert!(monitor.probe("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_high_response_time_raises_single_alert() {
        let probe = Arc::new(ScriptedProbe::healthy().with_delay(Duration::from_millis(10)));
        let config = HealthMonitorConfig {
            response_time_threshold: Duration::from_millis(1),
            ..Default::default()
        };
        let monitor = monitor_with(probe, config);
        let mut alert_rx = monitor.subscribe_alerts();
        monitor
            .register(ServiceRegistration::new("ai-backend", "http://localhost:8100"))
            .await;

        for _ in 0..10 {
            monitor.probe("ai-backend").await.unwrap();
        }

        let alert = alert_rx.try_recv().unwrap();
        assert_eq!(alert.alert_type, AlertType::HighResponseTime);
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert!(alert_rx.try_recv().is_err());
        assert_eq!(monitor.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_rearms_alerting() {
        let probe = Arc::new(ScriptedProbe::healthy().with_delay(Duration::from_millis(10)));
        let config = HealthMonitorConfig {
            response_time_threshold: Duration::from_millis(1),
            ..Default::default()
        };
        let monitor = monitor_with(probe, config);
        monitor
            .register(ServiceRegistration::new("ai-backend", "http://localhost:8100"))
            .await;

        monitor.probe("ai-backend").await.unwrap();
        let alerts = monitor.alerts().await;
        assert_eq!(alerts.len(), 1);

        assert!(monitor.acknowledge(alerts[0].id).await);
        assert!(!monitor.acknowledge(Uuid::new_v4()).await);

        monitor.probe("ai-backend").await.unwrap();
        let alerts = monitor.alerts().await;
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].acknowledged);
        assert!(!alerts[1].acknowledged);
    }

    #[tokio::test]
    async fn test_error_rate_alert_escalates_for_critical() {
        let probe = Arc::new(ScriptedProbe::with_script(vec![], 500));
        let config = HealthMonitorConfig {
            error_rate_threshold: 0.5,
            ..Default::default()
        };
        let monitor = monitor_with(probe, config);
        monitor
            .register(
                ServiceRegistration::new("ai-backend", "http://localhost:8100").critical(),
            )
            .await;

        monitor.probe("ai-backend").await.unwrap();

        let alerts = monitor.alerts().await;
        let error_rate_alert = alerts
            .iter()
            .find(|a| a.alert_type == AlertType::HighErrorRate)
            .unwrap();
        assert_eq!(error_rate_alert.severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_unreachable_critical_service_raises_service_down() {
        let probe = Arc::new(ScriptedProbe::with_script(vec![Err(refused())], 200));
        let monitor = monitor_with(probe, HealthMonitorConfig::default());
        monitor
            .register(
                ServiceRegistration::new("ai-backend", "http://localhost:8100").critical(),
            )
            .await;

        monitor.probe("ai-backend").await.unwrap();

        let alerts = monitor.alerts().await;
        let down = alerts
            .iter()
            .find(|a| a.alert_type == AlertType::ServiceDown)
            .unwrap();
        assert_eq!(down.severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_response_time_window_is_bounded() {
        let probe = Arc::new(ScriptedProbe::healthy());
        let monitor = monitor_with(probe, HealthMonitorConfig::default());
        monitor
            .register(ServiceRegistration::new("ai-backend", "http://localhost:8100"))
            .await;

        for _ in 0..(RESPONSE_TIME_WINDOW + 20) {
            monitor.probe("ai-backend").await.unwrap();
        }

        let metrics = monitor.metrics.read().await;
        assert_eq!(
            metrics["ai-backend"].response_times.len(),
            RESPONSE_TIME_WINDOW
        );
    }

    #[tokio::test]
    async fn test_system_status_aggregates() {
        let probe = Arc::new(ScriptedProbe::with_script(
            vec![Ok(200), Err(refused())],
            200,
        ));
        let monitor = monitor_with(probe, HealthMonitorConfig::default());
        monitor
            .register(ServiceRegistration::new("ai-backend", "http://localhost:8100"))
            .await;
        monitor
            .register(ServiceRegistration::new("semantic-engine", "http://localhost:8200"))
            .await;

        monitor.probe("ai-backend").await.unwrap();
        monitor.probe("semantic-engine").await.unwrap();

        let status = monitor.system_status().await;
        assert_eq!(status.services.total, 2);
        assert_eq!(status.services.healthy, 1);
        assert_eq!(status.services.unhealthy, 1);
        assert_eq!(status.status, ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_monitor_loop_lifecycle() {
        let probe = Arc::new(ScriptedProbe::healthy());
        let monitor = monitor_with(probe.clone(), HealthMonitorConfig::default());
        monitor
            .register(ServiceRegistration::new("ai-backend", "http://localhost:8100"))
            .await;

        monitor.clone().start(Some(Duration::from_millis(20))).await;
        // Idempotent: the second start is a no-op
        monitor.clone().start(Some(Duration::from_millis(20))).await;

        sleep(Duration::from_millis(70)).await;
        monitor.stop().await;
        let calls_at_stop = probe.calls();
        assert!(calls_at_stop >= 2, "expected immediate round plus ticks");

        // Loop is really gone after stop
        sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.calls(), calls_at_stop);

        // And can be restarted
        monitor.clone().start(Some(Duration::from_millis(20))).await;
        sleep(Duration::from_millis(30)).await;
        monitor.stop().await;
        assert!(probe.calls() > calls_at_stop);
    }

    #[tokio::test]
    async fn test_reregistration_overwrites_but_keeps_metrics() {
        let probe = Arc::new(ScriptedProbe::healthy());
        let monitor = monitor_with(probe, HealthMonitorConfig::default());

        monitor
            .register(ServiceRegistration::new("ai-backend", "http://localhost:8100"))
            .await;
        monitor.probe("ai-backend").await.unwrap();

        monitor
            .register(
                ServiceRegistration::new("ai-backend", "http://localhost:9100").critical(),
            )
            .await;

        let registrations = monitor.registrations.read().await;
        assert_eq!(registrations["ai-backend"].base_url, "http://localhost:9100");
        assert!(registrations["ai-backend"].critical);
        drop(registrations);

        let report = monitor.service_report().await;
        assert_eq!(report["ai-backend"].success_count, 1);
    }
}
