//! # Connection Pool
//!
//! Bounded pool of database connections tuned for a single tenant with low
//! concurrency and high per-call latency. Every acquisition is gated by the
//! circuit breaker; every connection-level failure is reported back to it.
//!
//! ## Guarantees
//!
//! - At most `pool_size` connections exist at once (idle + leased). A semaphore
//!   permit travels with each [`Lease`], and an idle connection is pushed back
//!   before its permit is released.
//! - A lease is exclusively owned. Returning it is idempotent: the explicit
//!   [`Lease::release`] and the `Drop` fallback together return the connection
//!   exactly once.
//! - The internal lock only guards the idle list; it is never held across a
//!   database round trip.

use crate::config::PoolConfig;
use crate::database::connection::{ConnectionError, ConnectionFactory, DatabaseConnection};
use crate::database::pool_stats::{AtomicPoolStats, PoolMetrics};
use crate::error::{ResilienceError, ResilienceResult};
use crate::resilience::{Admission, CircuitBreaker, ProbeGuard};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEALTH_CHECK_SQL: &str = "SELECT 1";

struct IdleConnection {
    conn: Box<dyn DatabaseConnection>,
    /// Returned without an explicit release; session state must be cleared
    /// before the next checkout.
    needs_reset: bool,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    breaker: Arc<CircuitBreaker>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    stats: AtomicPoolStats,
    closed: AtomicBool,
}

/// Shared handle to the connection pool
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.factory.describe())
            .field("pool_size", &self.inner.config.pool_size)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl ConnectionPool {
    /// One-time setup: probes a first connection and keeps it idle.
    ///
    /// A failed probe is recorded on the breaker and surfaces as
    /// [`ResilienceError::PoolInit`].
    pub async fn initialize(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        breaker: Arc<CircuitBreaker>,
    ) -> ResilienceResult<Self> {
        config.validate().map_err(ResilienceError::Configuration)?;

        let target = factory.describe();
        info!(
            database = %target,
            pool_size = config.pool_size,
            acquire_timeout_ms = config.acquire_timeout_ms,
            "Initializing connection pool"
        );

        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.pool_size as usize)),
            stats: AtomicPoolStats::new(config.pool_size),
            idle: Mutex::new(Vec::with_capacity(config.pool_size as usize)),
            closed: AtomicBool::new(false),
            factory,
            breaker,
            config,
        });

        match inner.open_connection().await {
            Ok(conn) => {
                inner.breaker.record_success();
                inner.idle.lock().push(IdleConnection {
                    conn,
                    needs_reset: false,
                });
                info!(database = %target, "Connection pool ready");
                Ok(Self { inner })
            }
            Err(err) => {
                inner.breaker.record_failure();
                error!(database = %target, error = %err, "Initial connection probe failed");
                Err(ResilienceError::PoolInit(err.to_string()))
            }
        }
    }

    /// Borrow a connection, waiting up to the configured acquire timeout
    pub async fn acquire(&self) -> ResilienceResult<Lease> {
        self.acquire_timeout(self.inner.config.acquire_timeout()).await
    }

    /// Borrow a connection with a caller-chosen timeout.
    ///
    /// Fails with `CircuitOpen` without touching the database while the breaker
    /// is open, `PoolExhausted` when no connection frees up in time, and
    /// `ConnectionFailed` when reconnecting a dead connection keeps failing.
    pub async fn acquire_timeout(&self, wait: Duration) -> ResilienceResult<Lease> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ResilienceError::PoolClosed);
        }

        let admission = inner.breaker.admit();
        if admission == Admission::Rejected {
            inner.stats.record_rejected();
            let retry_after = inner.breaker.retry_after();
            debug!(retry_after_ms = retry_after.as_millis(), "Acquire rejected by open circuit");
            return Err(ResilienceError::CircuitOpen {
                component: inner.breaker.name().to_string(),
                retry_after,
            });
        }

        // Timing out, seeing the pool close, or being cancelled while holding
        // the probe all reopen the breaker when this guard drops.
        let probe = ProbeGuard::new(&inner.breaker, admission);

        let started = Instant::now();
        let permit = match timeout(wait, inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ResilienceError::PoolClosed),
            Err(_) => {
                let waited = started.elapsed();
                inner.stats.record_exhausted(waited);
                warn!(
                    waited_ms = waited.as_millis(),
                    active = inner.stats.active(),
                    probing = probe.is_armed(),
                    "Connection pool exhausted"
                );
                return Err(ResilienceError::PoolExhausted { waited });
            }
        };
        let waited = started.elapsed();

        let candidate = inner.idle.lock().pop();
        let checked_out = inner.checkout(candidate).await;
        // A failed checkout has already recorded its failures on the breaker
        probe.resolve();
        let (conn, reused) = checked_out?;

        inner.breaker.record_success();
        inner
            .stats
            .record_acquire(waited, reused, Duration::from_millis(inner.config.slow_acquire_threshold_ms));

        let lease = Lease {
            id: Uuid::new_v4(),
            conn: Some(conn),
            permit: Some(permit),
            acquired_at: Utc::now(),
            alive: true,
            pool: Arc::clone(inner),
        };
        debug!(lease_id = %lease.id, reused, waited_ms = waited.as_millis(), "Connection leased");
        Ok(lease)
    }

    /// Non-blocking metrics snapshot
    pub fn metrics(&self) -> PoolMetrics {
        let idle = self.inner.idle.lock().len();
        self.inner.stats.snapshot(idle)
    }

    /// Trivial round trip through the pool for liveness probes
    pub async fn health_check(&self) -> bool {
        let mut lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(error = %err, "Health check could not acquire a connection");
                return false;
            }
        };
        let healthy = match lease.fetch(HEALTH_CHECK_SQL).await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "Health check query failed");
                false
            }
        };
        lease.release().await;
        healthy
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close every idle connection and refuse further acquisitions.
    ///
    /// Leased connections are closed as their leases come back.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();

        let idle: Vec<IdleConnection> = std::mem::take(&mut *self.inner.idle.lock());
        let count = idle.len();
        for mut entry in idle {
            entry.conn.close().await;
        }
        info!(
            closed_idle = count,
            still_leased = self.inner.stats.active(),
            "Connection pool shut down"
        );
    }
}

impl PoolInner {
    async fn open_connection(&self) -> Result<Box<dyn DatabaseConnection>, ConnectionError> {
        match timeout(self.config.connection_timeout(), self.factory.connect()).await {
            Ok(Ok(conn)) => {
                self.stats.record_created();
                Ok(conn)
            }
            Ok(Err(err)) => {
                self.stats.record_connect_failure();
                Err(err)
            }
            Err(_) => {
                self.stats.record_connect_failure();
                Err(ConnectionError::Connect(format!(
                    "connection timed out after {}ms",
                    self.config.connection_timeout_ms
                )))
            }
        }
    }

    /// Turn an idle candidate (or nothing) into a live connection, reconnecting
    /// with bounded retries when the candidate is dead.
    async fn checkout(
        &self,
        candidate: Option<IdleConnection>,
    ) -> ResilienceResult<(Box<dyn DatabaseConnection>, bool)> {
        if let Some(IdleConnection {
            mut conn,
            needs_reset,
        }) = candidate
        {
            let reset_ok = !needs_reset || conn.reset().await.is_ok();
            if reset_ok && conn.ping().await.is_ok() {
                return Ok((conn, true));
            }
            debug!("Idle connection failed liveness check, reconnecting");
            conn.close().await;
        }

        let attempts = self.config.reconnect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.open_connection().await {
                Ok(conn) => return Ok((conn, false)),
                Err(err) => {
                    self.breaker.record_failure();
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Connection attempt failed"
                    );
                    last_error = Some(err);
                    if attempt == attempts || !self.breaker.allow_attempt() {
                        return Err(ResilienceError::ConnectionFailed {
                            attempts: attempt,
                            message: last_error
                                .as_ref()
                                .map(ToString::to_string)
                                .unwrap_or_default(),
                        });
                    }
                    sleep(Duration::from_millis(
                        self.config.reconnect_backoff_ms * u64::from(attempt),
                    ))
                    .await;
                }
            }
        }

        Err(ResilienceError::ConnectionFailed {
            attempts,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Put a connection back (or discard it) and free its slot.
    fn give_back(
        &self,
        conn: Box<dyn DatabaseConnection>,
        reusable: bool,
        needs_reset: bool,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if reusable && !self.closed.load(Ordering::Acquire) {
            self.idle.lock().push(IdleConnection { conn, needs_reset });
        } else {
            close_in_background(conn);
        }
        self.stats.record_return();
        drop(permit);
    }
}

fn close_in_background(conn: Box<dyn DatabaseConnection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let mut conn = conn;
                conn.close().await;
            });
        }
        Err(_) => drop(conn),
    }
}

/// An exclusively borrowed connection.
///
/// Call [`release`](Lease::release) when done; dropping the lease without it
/// still returns the connection, which is then reset on its next checkout.
pub struct Lease {
    id: Uuid,
    conn: Option<Box<dyn DatabaseConnection>>,
    permit: Option<OwnedSemaphorePermit>,
    acquired_at: DateTime<Utc>,
    alive: bool,
    pool: Arc<PoolInner>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("acquired_at", &self.acquired_at)
            .field("alive", &self.alive)
            .field("released", &self.conn.is_none())
            .finish()
    }
}

impl Lease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// False once a connection-level failure has been seen on this lease
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Run a statement; `Ok` means it is committed
    pub async fn execute(&mut self, sql: &str) -> ResilienceResult<u64> {
        let conn = self.conn.as_mut().ok_or(ConnectionError::Closed);
        let result = match conn {
            Ok(conn) => conn.execute(sql).await,
            Err(err) => Err(err),
        };
        self.observe(result)
    }

    /// Run a query returning rows as JSON objects
    pub async fn fetch(&mut self, sql: &str) -> ResilienceResult<Vec<Value>> {
        let conn = self.conn.as_mut().ok_or(ConnectionError::Closed);
        let result = match conn {
            Ok(conn) => conn.fetch(sql).await,
            Err(err) => Err(err),
        };
        self.observe(result)
    }

    fn observe<T>(&mut self, result: Result<T, ConnectionError>) -> ResilienceResult<T> {
        self.pool.stats.record_query();
        result.map_err(|err| {
            if err.is_connection_level() {
                self.alive = false;
                self.pool.breaker.record_failure();
                ResilienceError::ConnectionFailed {
                    attempts: 1,
                    message: err.to_string(),
                }
            } else {
                ResilienceError::Query(err.to_string())
            }
        })
    }

    /// Return the connection to the pool, clearing session state first.
    ///
    /// Idempotent: calling it again, or dropping the lease afterwards, does
    /// nothing.
    pub async fn release(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let reusable = self.alive && conn.reset().await.is_ok();
        self.pool.give_back(conn, reusable, false, self.permit.take());
        debug!(lease_id = %self.id, reusable, "Connection released");
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(lease_id = %self.id, "Lease dropped without release, returning connection");
            self.pool
                .give_back(conn, self.alive, true, self.permit.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use crate::test_helpers::MockConnector;

    fn pool_config(pool_size: u32) -> PoolConfig {
        PoolConfig {
            pool_size,
            acquire_timeout_ms: 200,
            reconnect_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("database", CircuitBreakerConfig::default()))
    }

    async fn pool_with(connector: &MockConnector, pool_size: u32) -> ConnectionPool {
        ConnectionPool::initialize(pool_config(pool_size), Arc::new(connector.clone()), breaker())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_keeps_probe_connection_idle() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 3).await;

        let metrics = pool.metrics();
        assert_eq!(metrics.connections_created, 1);
        assert_eq!(metrics.idle_connections, 1);
        assert_eq!(metrics.active_connections, 0);
    }

    #[tokio::test]
    async fn test_initialize_failure_records_breaker_failure() {
        let connector = MockConnector::new();
        connector.fail_next_connects(1);
        let breaker = breaker();

        let err = ConnectionPool::initialize(pool_config(2), Arc::new(connector), breaker.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::PoolInit(_)));
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_reuse_counts_and_session_reset() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 2).await;

        let mut lease = pool.acquire().await.unwrap();
        lease.execute("UPDATE orders SET status = 'paid'").await.unwrap();
        lease.release().await;

        let mut again = pool.acquire().await.unwrap();
        again.release().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.connections_created, 1);
        assert_eq!(metrics.connections_reused, 2);
        assert_eq!(metrics.queries_executed, 1);
        assert_eq!(connector.resets(), 2);
    }

    #[tokio::test]
    async fn test_double_release_is_idempotent() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 2).await;

        let mut lease = pool.acquire().await.unwrap();
        assert_eq!(pool.metrics().active_connections, 1);

        lease.release().await;
        lease.release().await;
        drop(lease);

        let metrics = pool.metrics();
        assert_eq!(metrics.active_connections, 0);
        assert_eq!(metrics.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_returned_and_reset_later() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 1).await;

        {
            let _lease = pool.acquire().await.unwrap();
        }
        assert_eq!(pool.metrics().active_connections, 0);
        assert_eq!(connector.resets(), 0);

        let mut lease = pool.acquire().await.unwrap();
        assert_eq!(connector.resets(), 1);
        lease.release().await;
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 1).await;

        let _held = pool.acquire().await.unwrap();
        let err = pool
            .acquire_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::PoolExhausted { .. }));
        assert_eq!(pool.metrics().exhausted, 1);
        // Exhaustion alone is not a database failure
        assert_eq!(pool.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_replaced() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 1).await;
        connector.fail_next_pings(1);

        let mut lease = pool.acquire().await.unwrap();
        lease.release().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.connections_created, 2);
        assert_eq!(metrics.connections_reused, 0);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_bounded_attempts() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 1).await;
        connector.fail_next_pings(1);
        connector.fail_next_connects(10);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ResilienceError::ConnectionFailed { attempts: 3, .. }));
        assert_eq!(pool.breaker().snapshot().failure_count, 3);
        assert_eq!(pool.metrics().active_connections, 0);
    }

    #[tokio::test]
    async fn test_lost_connection_marks_lease_dead() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 1).await;
        connector.fail_next_executes_with(crate::database::ConnectionError::Lost(
            "Lost connection to MySQL server during query".to_string(),
        ));

        let mut lease = pool.acquire().await.unwrap();
        let err = lease.execute("INSERT INTO orders VALUES (1)").await.unwrap_err();
        assert!(matches!(err, ResilienceError::ConnectionFailed { .. }));
        assert!(!lease.is_alive());
        lease.release().await;

        assert_eq!(pool.metrics().idle_connections, 0);
        assert_eq!(pool.breaker().snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_statement_error_does_not_trip_breaker() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 1).await;
        connector.fail_next_executes_with(crate::database::ConnectionError::Execute(
            "You have an error in your SQL syntax".to_string(),
        ));

        let mut lease = pool.acquire().await.unwrap();
        let err = lease.execute("SELEC 1").await.unwrap_err();
        assert!(matches!(err, ResilienceError::Query(_)));
        assert!(lease.is_alive());
        lease.release().await;

        assert_eq!(pool.breaker().state(), CircuitState::Closed);
        assert_eq!(pool.metrics().idle_connections, 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 1).await;
        assert!(pool.health_check().await);

        connector.fail_next_fetches_with(crate::database::ConnectionError::Lost(
            "server has gone away".to_string(),
        ));
        assert!(!pool.health_check().await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_and_rejects_acquire() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, 2).await;

        let mut leased = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        drop(second);

        pool.shutdown().await;
        assert!(matches!(pool.acquire().await, Err(ResilienceError::PoolClosed)));
        assert_eq!(connector.closes(), 1);

        // In-flight lease closes its connection when it comes back
        leased.release().await;
        tokio::task::yield_now().await;
        assert_eq!(pool.metrics().idle_connections, 0);
        assert_eq!(pool.metrics().active_connections, 0);
    }
}
