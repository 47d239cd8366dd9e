//! Circuit breaker protecting calls into the completion backend

use crate::errors::BackendError;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failing, rejecting requests
    HalfOpen, // Testing if service recovered
}

/// Immutable circuit breaker configuration, set once at construction.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Hard timeout raced against every wrapped operation
    pub operation_timeout: Duration,
    /// How long the circuit stays open before admitting a recovery probe
    pub recovery_timeout: Duration,
    /// Name used in logs and metrics correlation
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            operation_timeout: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(60),
            name: "bedrock".to_string(),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    probe_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
}

/// Read-only snapshot of breaker state.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
    /// Remaining open time before a recovery probe is admitted
    pub time_until_half_open: Option<Duration>,
}

/// Per-backend circuit breaker. One instance per process, shared via `Arc`,
/// mutated only through [`execute`](CircuitBreaker::execute) and
/// [`reset`](CircuitBreaker::reset).
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

enum Admission {
    Normal,
    Probe,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_success: None,
                probe_in_flight: false,
                total_successes: 0,
                total_failures: 0,
                times_opened: 0,
            }),
        }
    }

    /// Run `operation` under the breaker, racing it against the configured
    /// timeout. Rejected calls never poll the operation.
    ///
    /// While the circuit is half-open, exactly one probe is admitted;
    /// concurrent callers fail fast until the probe settles.
    pub async fn execute<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let admission = self.admit()?;
        let mut probe_guard = ProbeGuard {
            breaker: self,
            armed: matches!(admission, Admission::Probe),
        };

        let outcome = tokio::time::timeout(self.config.operation_timeout, operation).await;
        probe_guard.armed = false;

        match outcome {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(&err.to_string());
                Err(err)
            }
            Err(_) => {
                let message = format!(
                    "operation exceeded {}ms budget on '{}'",
                    self.config.operation_timeout.as_millis(),
                    self.config.name
                );
                self.record_failure(&message);
                Err(anyhow::Error::new(BackendError::Timeout(message)))
            }
        }
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(anyhow!(
                        "circuit breaker '{}' is open: recovery probe already in flight",
                        self.config.name
                    ))
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(false);
                if recovered {
                    info!(
                        "🔄 Circuit breaker '{}' moving to HALF_OPEN, admitting probe",
                        self.config.name
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                } else {
                    debug!("⭕ Circuit breaker '{}' OPEN - rejecting call", self.config.name);
                    Err(anyhow!("circuit breaker '{}' is open", self.config.name))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(
                "✅ Circuit breaker '{}' recovery successful, moving to CLOSED",
                self.config.name
            );
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_success = Some(Instant::now());
        inner.probe_in_flight = false;
        inner.total_successes += 1;
    }

    fn record_failure(&self, message: &str) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.probe_in_flight = false;
        inner.total_failures += 1;

        if inner.failure_count >= self.config.failure_threshold {
            if inner.state != CircuitState::Open {
                warn!(
                    "🚨 Circuit breaker '{}' OPENING after {} consecutive failures: {}",
                    self.config.name, inner.failure_count, message
                );
                inner.times_opened += 1;
            }
            inner.state = CircuitState::Open;
        } else {
            debug!(
                "❌ Circuit breaker '{}' failure {}/{}: {}",
                self.config.name, inner.failure_count, self.config.failure_threshold, message
            );
        }
    }

    /// Administrative override: force the circuit closed and clear history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        info!("Circuit breaker '{}' manually reset", self.config.name);
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.last_success = None;
        inner.probe_in_flight = false;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.lock();
        let time_until_half_open = match inner.state {
            CircuitState::Open => inner
                .last_failure
                .map(|at| self.config.recovery_timeout.saturating_sub(at.elapsed())),
            _ => None,
        };
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            times_opened: inner.times_opened,
            time_until_half_open,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn operation_timeout(&self) -> Duration {
        self.config.operation_timeout
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears the probe flag if an admitted probe is cancelled before settling,
/// so the half-open circuit is not wedged forever.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            operation_timeout: Duration::from_millis(200),
            recovery_timeout: recovery,
            name: "test".to_string(),
        })
    }

    #[tokio::test]
    async fn test_opens_exactly_on_nth_failure() {
        let cb = breaker(3, Duration::from_secs(60));

        for expected_state in [CircuitState::Closed, CircuitState::Closed, CircuitState::Open] {
            let result: Result<()> = cb.execute(async { Err(anyhow!("backend down")) }).await;
            assert!(result.is_err());
            assert_eq!(cb.state(), expected_state);
        }
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_invoking_operation() {
        let cb = breaker(3, Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let _ = cb.execute(async { Err::<(), _>(anyhow!("down")) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let counter = Arc::clone(&calls);
        let result: Result<()> = cb
            .execute(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().to_string().contains("circuit breaker 'test' is open"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recovery_probe_after_window_closes_circuit() {
        let cb = breaker(3, Duration::from_millis(50));

        for _ in 0..3 {
            let _ = cb.execute(async { Err::<(), _>(anyhow!("down")) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let value = tokio_test::assert_ok!(cb.execute(async { Ok("recovered") }).await);
        assert_eq!(value, "recovered");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failure_count, 0);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_circuit() {
        let cb = breaker(2, Duration::from_millis(50));

        for _ in 0..2 {
            let _ = cb.execute(async { Err::<(), _>(anyhow!("down")) }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = cb.execute(async { Err::<(), _>(anyhow!("still down")) }).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, Duration::from_secs(60));

        let _ = cb.execute(async { Err::<(), _>(anyhow!("down")) }).await;
        let _ = cb.execute(async { Err::<(), _>(anyhow!("down")) }).await;
        assert_eq!(cb.metrics().failure_count, 2);

        let _ = cb.execute(async { Ok(()) }).await;
        assert_eq!(cb.metrics().failure_count, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure_with_timeout_kind() {
        let cb = breaker(1, Duration::from_secs(60));

        let result: Result<()> = cb
            .execute(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(
            crate::errors::classify_error(&err),
            crate::errors::ErrorKind::Timeout
        );
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_single_probe_in_flight() {
        let cb = Arc::new(breaker(1, Duration::from_millis(20)));

        let _ = cb.execute(async { Err::<(), _>(anyhow!("down")) }).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        // First caller becomes the probe and holds the slot.
        let slow_cb = Arc::clone(&cb);
        let probe = tokio::spawn(async move {
            slow_cb
                .execute(async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok("slow probe")
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Concurrent caller is rejected without touching the backend.
        let result: Result<()> = cb.execute(async { Ok(()) }).await;
        assert!(result.unwrap_err().to_string().contains("probe already in flight"));

        let probe_result = probe.await.expect("probe task");
        assert!(probe_result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_restores_closed_state() {
        let cb = breaker(1, Duration::from_secs(60));
        let _ = cb.execute(async { Err::<(), _>(anyhow!("down")) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failure_count, 0);

        let value = tokio_test::assert_ok!(cb.execute(async { Ok(1) }).await);
        assert_eq!(value, 1);
    }
}
