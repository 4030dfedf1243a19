//! # Connection Pool Statistics
//!
//! Atomic counters recorded by the pool on its hot paths, with a plain
//! [`PoolMetrics`] snapshot for monitoring and health-check readers. Counters
//! use relaxed ordering; a snapshot may be a moment stale but every counter is
//! monotonic except `active_connections`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic connection pool statistics.
#[derive(Debug)]
pub struct AtomicPoolStats {
    /// Maximum connections configured for this pool
    max_connections: u32,

    connections_created: AtomicU64,
    connections_reused: AtomicU64,
    connections_failed: AtomicU64,
    active_connections: AtomicU64,

    /// Cumulative time spent waiting for a permit, in microseconds
    total_wait_time_us: AtomicU64,

    /// Maximum acquire time observed (in microseconds)
    max_acquire_time_us: AtomicU64,

    /// Number of acquires exceeding slow threshold
    slow_acquires: AtomicU64,

    /// Acquires that timed out waiting for a free connection
    exhausted: AtomicU64,

    /// Acquires rejected by an open circuit
    rejected_by_circuit: AtomicU64,

    queries_executed: AtomicU64,
}

impl AtomicPoolStats {
    pub fn new(max_connections: u32) -> Self {
        Self {
            max_connections,
            connections_created: AtomicU64::new(0),
            connections_reused: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_wait_time_us: AtomicU64::new(0),
            max_acquire_time_us: AtomicU64::new(0),
            slow_acquires: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            rejected_by_circuit: AtomicU64::new(0),
            queries_executed: AtomicU64::new(0),
        }
    }

    /// Record a successful checkout.
    #[inline]
    pub fn record_acquire(&self, waited: Duration, reused: bool, slow_threshold: Duration) {
        let waited_us = waited.as_micros() as u64;
        self.total_wait_time_us
            .fetch_add(waited_us, Ordering::Relaxed);
        self.max_acquire_time_us
            .fetch_max(waited_us, Ordering::Relaxed);
        if waited >= slow_threshold {
            self.slow_acquires.fetch_add(1, Ordering::Relaxed);
        }
        if reused {
            self.connections_reused.fetch_add(1, Ordering::Relaxed);
        }
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_failure(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exhausted(&self, waited: Duration) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.rejected_by_circuit.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_query(&self) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the active count, never going below zero.
    #[inline]
    pub fn record_return(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |active| {
                active.checked_sub(1)
            });
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Take a snapshot of current statistics.
    pub fn snapshot(&self, idle_connections: usize) -> PoolMetrics {
        let active_connections = self.active_connections.load(Ordering::Relaxed);
        let utilization_percentage = if self.max_connections > 0 {
            (active_connections as f64 / f64::from(self.max_connections)) * 100.0
        } else {
            0.0
        };

        PoolMetrics {
            pool_size: self.max_connections,
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_reused: self.connections_reused.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            active_connections,
            idle_connections,
            total_wait_time_ms: self.total_wait_time_us.load(Ordering::Relaxed) / 1000,
            max_acquire_time_ms: self.max_acquire_time_us.load(Ordering::Relaxed) / 1000,
            slow_acquires: self.slow_acquires.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            rejected_by_circuit: self.rejected_by_circuit.load(Ordering::Relaxed),
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            utilization_percentage,
        }
    }
}

/// Point-in-time snapshot of pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pool_size: u32,
    pub connections_created: u64,
    pub connections_reused: u64,
    pub connections_failed: u64,
    pub active_connections: u64,
    pub idle_connections: usize,
    pub total_wait_time_ms: u64,
    pub max_acquire_time_ms: u64,
    pub slow_acquires: u64,
    pub exhausted: u64,
    pub rejected_by_circuit: u64,
    pub queries_executed: u64,
    pub utilization_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOW: Duration = Duration::from_millis(10);

    #[test]
    fn test_record_acquire_increments_counters() {
        let stats = AtomicPoolStats::new(10);

        stats.record_acquire(Duration::from_micros(500), false, SLOW);
        stats.record_acquire(Duration::from_micros(800), true, SLOW);

        let snap = stats.snapshot(0);
        assert_eq!(snap.active_connections, 2);
        assert_eq!(snap.connections_reused, 1);
        assert_eq!(snap.slow_acquires, 0);
    }

    #[test]
    fn test_slow_threshold_tracking() {
        let stats = AtomicPoolStats::new(10);

        stats.record_acquire(Duration::from_millis(5), false, SLOW); // not slow
        stats.record_acquire(Duration::from_millis(15), false, SLOW); // slow
        stats.record_acquire(Duration::from_millis(10), false, SLOW); // exactly at threshold = slow

        let snap = stats.snapshot(0);
        assert_eq!(snap.slow_acquires, 2);
        assert_eq!(snap.max_acquire_time_ms, 15);
        assert_eq!(snap.total_wait_time_ms, 30);
    }

    #[test]
    fn test_return_never_underflows() {
        let stats = AtomicPoolStats::new(2);

        stats.record_acquire(Duration::ZERO, false, SLOW);
        stats.record_return();
        stats.record_return();

        assert_eq!(stats.active(), 0);
    }

    #[test]
    fn test_utilization() {
        let stats = AtomicPoolStats::new(4);
        stats.record_acquire(Duration::ZERO, false, SLOW);
        let snap = stats.snapshot(3);
        assert!((snap.utilization_percentage - 25.0).abs() < f64::EPSILON);
        assert_eq!(snap.idle_connections, 3);
        assert_eq!(snap.pool_size, 4);
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AtomicPoolStats>();
    }
}
