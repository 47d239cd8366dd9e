//! Background health monitoring, rolling metrics and alerting

use crate::backend::{HealthProbe, HealthStatus};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Rolling service metrics. One instance per process, accumulating until an
/// explicit [`ServiceMonitor::reset_metrics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Incremental mean, O(1) memory regardless of request volume
    pub average_response_time_ms: f64,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Mirrored from the circuit breaker, not owned here
    pub circuit_breaker_state: CircuitState,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_response_time_ms: 0.0,
            last_health_check: None,
            circuit_breaker_state: CircuitState::Closed,
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Health check interval
    pub check_interval: Duration,
    /// Timeout for a single health probe
    pub check_timeout: Duration,
    /// Failure-rate percentage that triggers the high-failure-rate alert
    pub failure_rate_threshold: f64,
    /// Minimum request count before the failure rate is considered meaningful
    pub min_samples: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
            failure_rate_threshold: 50.0,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    BackendUnhealthy,
    HighFailureRate,
}

/// Structured payload handed to the alert sink. Delivery (log, page, chat)
/// is the sink's concern.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub id: Uuid,
    pub kind: AlertKind,
    pub details: String,
    pub metrics: ServiceMetrics,
    pub timestamp: DateTime<Utc>,
}

impl AlertPayload {
    fn new(kind: AlertKind, details: String, metrics: ServiceMetrics) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            details,
            metrics,
            timestamp: Utc::now(),
        }
    }
}

/// Alert output boundary.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: AlertPayload);
}

/// Default sink that emits alerts into the tracing log stream.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: AlertPayload) {
        match serde_json::to_string(&alert) {
            Ok(json) => warn!("ALERT {json}"),
            Err(err) => warn!("ALERT {:?}: {} (serialization failed: {err})", alert.kind, alert.details),
        }
    }
}

/// Periodic health monitor. Runs off the request path: it probes the backend
/// on a fixed interval and feeds the same metrics callers record into.
pub struct ServiceMonitor {
    metrics: Arc<RwLock<ServiceMetrics>>,
    probe: Arc<dyn HealthProbe>,
    alerts: Arc<dyn AlertSink>,
    breaker: Arc<CircuitBreaker>,
    config: MonitorConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceMonitor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        alerts: Arc<dyn AlertSink>,
        breaker: Arc<CircuitBreaker>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(ServiceMetrics::default())),
            probe,
            alerts,
            breaker,
            config,
            task: Mutex::new(None),
        }
    }

    /// Start the background probe loop. A second call while running is a
    /// no-op.
    pub fn start(&self) {
        let mut task = self.lock_task();
        if task.as_ref().map(|handle| !handle.is_finished()).unwrap_or(false) {
            return;
        }
        debug!("starting service monitor (interval {:?})", self.config.check_interval);
        let metrics = Arc::clone(&self.metrics);
        let probe = Arc::clone(&self.probe);
        let alerts = Arc::clone(&self.alerts);
        let breaker = Arc::clone(&self.breaker);
        let config = self.config.clone();
        *task = Some(tokio::spawn(async move {
            Self::monitor_loop(metrics, probe, alerts, breaker, config).await;
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.lock_task().take() {
            handle.abort();
            debug!("service monitor stopped");
        }
    }

    /// Record one request outcome. Shared entry point for the health loop and
    /// for ordinary request paths.
    pub async fn record_request(&self, started_at: Instant, success: bool) {
        Self::record(&self.metrics, &self.breaker, started_at, success).await;
    }

    pub async fn metrics(&self) -> ServiceMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn success_rate(&self) -> f64 {
        let metrics = self.metrics.read().await;
        if metrics.total_requests == 0 {
            100.0
        } else {
            metrics.successful_requests as f64 / metrics.total_requests as f64 * 100.0
        }
    }

    pub async fn failure_rate(&self) -> f64 {
        let metrics = self.metrics.read().await;
        Self::failure_rate_of(&metrics)
    }

    /// Administrative reset, used by tests and operational recovery flows.
    pub async fn reset_metrics(&self) {
        let mut metrics = self.metrics.write().await;
        *metrics = ServiceMetrics {
            circuit_breaker_state: self.breaker.state(),
            ..ServiceMetrics::default()
        };
    }

    pub async fn export_metrics(&self) -> Result<String> {
        let snapshot = self.metrics().await;
        serde_json::to_string_pretty(&snapshot)
            .map_err(|err| anyhow::anyhow!("failed to serialize metrics: {err}"))
    }

    async fn record(
        metrics: &RwLock<ServiceMetrics>,
        breaker: &CircuitBreaker,
        started_at: Instant,
        success: bool,
    ) {
        let sample_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        let mut metrics = metrics.write().await;
        metrics.total_requests += 1;
        if success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }
        let n = metrics.total_requests as f64;
        metrics.average_response_time_ms =
            (metrics.average_response_time_ms * (n - 1.0) + sample_ms) / n;
        metrics.circuit_breaker_state = breaker.state();
    }

    fn failure_rate_of(metrics: &ServiceMetrics) -> f64 {
        if metrics.total_requests == 0 {
            0.0
        } else {
            metrics.failed_requests as f64 / metrics.total_requests as f64 * 100.0
        }
    }

    async fn monitor_loop(
        metrics: Arc<RwLock<ServiceMetrics>>,
        probe: Arc<dyn HealthProbe>,
        alerts: Arc<dyn AlertSink>,
        breaker: Arc<CircuitBreaker>,
        config: MonitorConfig,
    ) {
        let mut interval = tokio::time::interval(config.check_interval);
        loop {
            interval.tick().await;

            let started = Instant::now();
            let outcome = tokio::time::timeout(config.check_timeout, probe.check()).await;
            let (healthy, problem) = match outcome {
                Ok(Ok(HealthStatus::Healthy)) => (true, None),
                Ok(Ok(HealthStatus::Degraded)) => {
                    warn!("health probe reports degraded backend");
                    (true, None)
                }
                Ok(Ok(HealthStatus::Unhealthy)) => {
                    (false, Some("health probe reports unhealthy backend".to_string()))
                }
                Ok(Err(err)) => (false, Some(format!("health probe failed: {err}"))),
                Err(_) => (
                    false,
                    Some(format!("health probe timed out after {:?}", config.check_timeout)),
                ),
            };

            Self::record(&metrics, &breaker, started, healthy).await;
            {
                let mut snapshot = metrics.write().await;
                snapshot.last_health_check = Some(Utc::now());
            }

            let snapshot = metrics.read().await.clone();
            if let Some(details) = problem {
                warn!("backend unhealthy: {details}");
                alerts
                    .send(AlertPayload::new(
                        AlertKind::BackendUnhealthy,
                        details,
                        snapshot.clone(),
                    ))
                    .await;
            }

            let failure_rate = Self::failure_rate_of(&snapshot);
            if snapshot.total_requests >= config.min_samples
                && failure_rate > config.failure_rate_threshold
            {
                alerts
                    .send(AlertPayload::new(
                        AlertKind::HighFailureRate,
                        format!(
                            "failure rate {failure_rate:.1}% over {} requests",
                            snapshot.total_requests
                        ),
                        snapshot,
                    ))
                    .await;
            }
        }
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::errors::BackendError;

    struct FixedProbe {
        status: HealthStatus,
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn check(&self) -> Result<HealthStatus, BackendError> {
            Ok(self.status.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<AlertPayload>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, alert: AlertPayload) {
            self.alerts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(alert);
        }
    }

    fn test_breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()))
    }

    fn monitor_with(
        status: HealthStatus,
        sink: Arc<RecordingSink>,
        config: MonitorConfig,
    ) -> ServiceMonitor {
        ServiceMonitor::new(Arc::new(FixedProbe { status }), sink, test_breaker(), config)
    }

    #[tokio::test]
    async fn test_rates_with_zero_requests() {
        let monitor = monitor_with(
            HealthStatus::Healthy,
            Arc::new(RecordingSink::default()),
            MonitorConfig::default(),
        );
        assert_eq!(monitor.success_rate().await, 100.0);
        assert_eq!(monitor.failure_rate().await, 0.0);
    }

    #[tokio::test]
    async fn test_rates_after_recorded_requests() {
        let monitor = monitor_with(
            HealthStatus::Healthy,
            Arc::new(RecordingSink::default()),
            MonitorConfig::default(),
        );

        for success in [true, true, true, false] {
            monitor.record_request(Instant::now(), success).await;
        }

        assert_eq!(monitor.success_rate().await, 75.0);
        assert_eq!(monitor.failure_rate().await, 25.0);
        assert_eq!(monitor.metrics().await.total_requests, 4);
    }

    #[tokio::test]
    async fn test_incremental_average_response_time() {
        let monitor = monitor_with(
            HealthStatus::Healthy,
            Arc::new(RecordingSink::default()),
            MonitorConfig::default(),
        );

        monitor
            .record_request(Instant::now() - Duration::from_millis(20), true)
            .await;
        monitor
            .record_request(Instant::now() - Duration::from_millis(40), true)
            .await;

        let average = monitor.metrics().await.average_response_time_ms;
        assert!((average - 30.0).abs() < 5.0, "average was {average}");
    }

    #[tokio::test]
    async fn test_unhealthy_probe_raises_alert() {
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with(
            HealthStatus::Unhealthy,
            Arc::clone(&sink),
            MonitorConfig {
                check_interval: Duration::from_millis(20),
                check_timeout: Duration::from_millis(100),
                // Keep the failure-rate alert out of this test.
                min_samples: 1_000,
                ..MonitorConfig::default()
            },
        );

        monitor.start();
        tokio::time::sleep(Duration::from_millis(90)).await;
        monitor.stop();

        let alerts = sink.alerts.lock().expect("sink lock");
        assert!(alerts.iter().any(|a| a.kind == AlertKind::BackendUnhealthy));

        let metrics = monitor.metrics().await;
        assert!(metrics.total_requests >= 1);
        assert!(metrics.last_health_check.is_some());
        assert_eq!(metrics.circuit_breaker_state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_high_failure_rate_alert_requires_min_samples() {
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with(
            HealthStatus::Unhealthy,
            Arc::clone(&sink),
            MonitorConfig {
                check_interval: Duration::from_millis(15),
                check_timeout: Duration::from_millis(100),
                failure_rate_threshold: 50.0,
                min_samples: 3,
            },
        );

        monitor.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        monitor.stop();

        let alerts = sink.alerts.lock().expect("sink lock");
        let rate_alerts: Vec<_> = alerts
            .iter()
            .filter(|a| a.kind == AlertKind::HighFailureRate)
            .collect();
        assert!(!rate_alerts.is_empty());
        for alert in rate_alerts {
            assert!(alert.metrics.total_requests >= 3);
        }
    }

    #[tokio::test]
    async fn test_reset_metrics() {
        let monitor = monitor_with(
            HealthStatus::Healthy,
            Arc::new(RecordingSink::default()),
            MonitorConfig::default(),
        );

        monitor.record_request(Instant::now(), false).await;
        assert_eq!(monitor.metrics().await.total_requests, 1);

        monitor.reset_metrics().await;
        let metrics = monitor.metrics().await;
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.failed_requests, 0);
        assert_eq!(monitor.success_rate().await, 100.0);
    }
}
