//! # Circuit Breaker Implementation
//!
//! Fails fast while the database is known to be unhealthy and prevents retry
//! storms against it. Three states:
//!
//! ```text
//! Closed ── failure_count >= threshold ──▶ Open
//! Open ──── cooldown elapsed ────────────▶ HalfOpen (exactly one probe)
//! HalfOpen ─ probe succeeds ─────────────▶ Closed
//! HalfOpen ─ probe fails ────────────────▶ Open (fresh cooldown)
//! ```
//!
//! State lives behind a single mutex so the counter, timestamp and state always
//! change together. The lock is never held across I/O.
//!
//! A caller granted the half-open probe holds a [`ProbeGuard`]. If the guard is
//! dropped before the outcome is reported (the caller's future was cancelled,
//! or it bailed out early), the probe counts as failed and the breaker reopens
//! with a fresh cooldown instead of staying half-open.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// A single probe has been let through and has not reported back yet
    HalfOpen,
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen {
        component: String,
        retry_after: Duration,
    },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Outcome of asking the breaker for permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, proceed normally
    Allowed,
    /// Caller holds the single half-open probe and must report its outcome
    Probe,
    /// Circuit open, fail fast
    Rejected,
}

/// Pending outcome of a half-open probe.
///
/// Armed only for [`Admission::Probe`]. Call [`resolve`](Self::resolve) once
/// the outcome has been reported; dropping an armed guard records a failure.
#[must_use = "dropping the guard immediately fails the probe"]
#[derive(Debug)]
pub struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    pub fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            armed: admission == Admission::Probe,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// The outcome has been reported through the breaker
    pub fn resolve(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                component = %self.breaker.name,
                "Half-open probe abandoned without an outcome"
            );
            self.breaker.record_failure();
        }
    }
}

/// Read-only view of the breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub failure_count: u32,
    pub is_open: bool,
    pub state: CircuitState,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    metrics: CircuitBreakerMetrics,
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    /// Configuration parameters
    config: CircuitBreakerConfig,

    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            cooldown_seconds = config.cooldown_seconds,
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                metrics: CircuitBreakerMetrics::new(),
            }),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// `{failure_count, is_open}` snapshot; a half-open breaker still reports open
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            failure_count: inner.failure_count,
            is_open: inner.state != CircuitState::Closed,
            state: inner.state,
        }
    }

    /// Decide whether an attempt may proceed.
    ///
    /// Once the cooldown has strictly elapsed since the last failure, exactly
    /// one caller is granted a half-open probe; everyone else is rejected until
    /// that probe reports through [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow_attempt(&self) -> bool {
        self.admit() != Admission::Rejected
    }

    /// Like [`allow_attempt`](Self::allow_attempt) but tells the caller whether
    /// it holds the half-open probe.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.config.cooldown() {
                    inner.state = CircuitState::HalfOpen;
                    info!(
                        component = %self.name,
                        failure_count = inner.failure_count,
                        "Circuit breaker half-open (probing recovery)"
                    );
                    Admission::Probe
                } else {
                    inner.metrics.rejected_count += 1;
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                inner.metrics.rejected_count += 1;
                Admission::Rejected
            }
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner);
                } else {
                    debug!(
                        component = %self.name,
                        failure_count = inner.failure_count,
                        failure_threshold = self.config.failure_threshold,
                        "Failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(component = %self.name, "Half-open probe failed");
                self.open(&mut inner);
            }
            CircuitState::Open => {
                // Already open; the cooldown clock restarts from this failure
            }
        }
    }

    /// Record a successful attempt
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;

        match inner.state {
            CircuitState::HalfOpen => self.close(&mut inner),
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {
                warn!(component = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    /// Remaining cooldown before a probe would be allowed
    pub fn retry_after(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at)) => self.config.cooldown().saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit();
        if admission == Admission::Rejected {
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
                retry_after: self.retry_after(),
            });
        }

        let probe = ProbeGuard::new(self, admission);
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        probe.resolve();

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.metrics.times_opened += 1;
        error!(
            component = %self.name,
            failure_count = inner.failure_count,
            failure_threshold = self.config.failure_threshold,
            cooldown_seconds = self.config.cooldown_seconds,
            "Circuit breaker opened (failing fast)"
        );
    }

    fn close(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        info!(
            component = %self.name,
            total_calls = inner.metrics.total_calls,
            "Circuit breaker closed (recovered)"
        );
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        self.open(&mut inner);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        self.close(&mut inner);
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let mut snapshot = inner.metrics.clone();
        snapshot.current_state = inner.state;
        snapshot.consecutive_failures = inner.failure_count;
        if snapshot.total_calls > 0 {
            snapshot.failure_rate = snapshot.failure_count as f64 / snapshot.total_calls as f64;
            snapshot.success_rate = snapshot.success_count as f64 / snapshot.total_calls as f64;
        }
        snapshot
    }

    /// Get component name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if circuit is healthy (closed state with low failure rate)
    pub fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::time::advance;

    fn breaker(threshold: u32, cooldown_seconds: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown_seconds,
            },
        )
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let circuit = breaker(5, 60);

        for expected in 1..5 {
            circuit.record_failure();
            let snapshot = circuit.snapshot();
            assert_eq!(snapshot.failure_count, expected);
            assert!(!snapshot.is_open);
        }

        circuit.record_failure();
        assert!(circuit.snapshot().is_open);
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.allow_attempt());
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let circuit = breaker(3, 60);
        circuit.record_failure();
        circuit.record_failure();
        circuit.record_success();
        circuit.record_failure();
        circuit.record_failure();
        assert!(!circuit.snapshot().is_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_per_cooldown_window() {
        let circuit = breaker(1, 60);
        circuit.record_failure();

        advance(Duration::from_secs(59)).await;
        assert!(!circuit.allow_attempt());

        advance(Duration::from_secs(2)).await;
        assert_eq!(circuit.admit(), Admission::Probe);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        // Only one probe per window
        assert!(!circuit.allow_attempt());
        assert!(!circuit.allow_attempt());

        circuit.record_success();
        let snapshot = circuit.snapshot();
        assert!(!snapshot.is_open);
        assert_eq!(snapshot.failure_count, 0);
        assert!(circuit.allow_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_fresh_cooldown() {
        let circuit = breaker(2, 60);
        circuit.record_failure();
        circuit.record_failure();

        advance(Duration::from_secs(61)).await;
        assert!(circuit.allow_attempt());
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);

        advance(Duration::from_secs(30)).await;
        assert!(!circuit.allow_attempt());
        assert!(circuit.retry_after() <= Duration::from_secs(30));

        advance(Duration::from_secs(31)).await;
        assert!(circuit.allow_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_strict() {
        let circuit = breaker(1, 10);
        circuit.record_failure();
        advance(Duration::from_secs(10)).await;
        assert!(!circuit.allow_attempt());
        advance(Duration::from_millis(1)).await;
        assert!(circuit.allow_attempt());
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_open() {
        let circuit = breaker(2, 60);

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let result = circuit
            .call(|| async { Ok::<_, String>("should not execute") })
            .await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::CircuitOpen { .. })
        ));

        let metrics = circuit.metrics();
        assert_eq!(metrics.failure_count, 2);
        assert_eq!(metrics.rejected_count, 1);
        assert_eq!(metrics.times_opened, 1);
    }

    #[test]
    fn test_force_operations() {
        let circuit = breaker(5, 60);

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.allow_attempt());

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(circuit.allow_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_reopens_breaker() {
        let circuit = breaker(1, 1);
        circuit.record_failure();
        advance(Duration::from_secs(2)).await;

        let guard = ProbeGuard::new(&circuit, circuit.admit());
        assert!(guard.is_armed());
        drop(guard);

        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.allow_attempt());
        advance(Duration::from_secs(2)).await;
        assert_eq!(circuit.admit(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_probe_leaves_state_alone() {
        let circuit = breaker(1, 1);
        circuit.record_failure();
        advance(Duration::from_secs(2)).await;

        let guard = ProbeGuard::new(&circuit, circuit.admit());
        circuit.record_success();
        guard.resolve();

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(!ProbeGuard::new(&circuit, circuit.admit()).is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_does_not_wedge_half_open() {
        let circuit = breaker(1, 1);
        circuit.record_failure();
        advance(Duration::from_secs(2)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            circuit.call(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, String>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(circuit.state(), CircuitState::Open);
        advance(Duration::from_secs(2)).await;
        let result = circuit.call(|| async { Ok::<_, String>("recovered") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    proptest! {
        #[test]
        fn prop_stays_closed_below_threshold(threshold in 1u32..50, failures in 0u32..50) {
            let circuit = breaker(threshold, 60);
            for _ in 0..failures {
                circuit.record_failure();
            }
            prop_assert_eq!(circuit.snapshot().is_open, failures >= threshold);
        }
    }
}
