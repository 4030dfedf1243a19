//! # Database Gateway
//!
//! The single handle request handlers hold. It wires the connection pool,
//! circuit breaker, query cache and crash diagnostics together:
//!
//! ```text
//! handler ──▶ query() ──▶ cache hit? ──yes──▶ value
//!                              │no
//!                              ▼
//!                   pool.acquire() (breaker-gated) ──▶ fetch ──▶ cache fill
//!
//! handler ──▶ execute_write() ──▶ pool.acquire() ──▶ execute (committed)
//!                                                      └──▶ invalidate_table(..)
//!
//! any failure ──▶ diagnostics.record_failure() ──▶ GatewayFailure { error, directive }
//! ```
//!
//! Constructed once at startup and shared by reference; there is no global
//! instance.

use crate::cache::{CacheStats, DependencyCache};
use crate::config::ResilienceConfig;
use crate::database::{ConnectionFactory, ConnectionPool, MySqlConnector, PoolMetrics};
use crate::diagnostics::{CrashDiagnostics, RecoveryDirective, StatusReport};
use crate::error::ResilienceError;
use crate::logging::log_pool_operation;
use crate::resilience::{BreakerSnapshot, CircuitBreaker, CircuitBreakerMetrics};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// A classified failure handed back to the request handler
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub struct GatewayFailure {
    pub error: ResilienceError,
    pub directive: RecoveryDirective,
}

impl GatewayFailure {
    /// Present as "service temporarily degraded" rather than a hard failure
    pub fn is_degraded(&self) -> bool {
        self.error.is_degraded()
    }

    /// Retry-after hint; `None` when the failure needs escalation
    pub fn retry_after(&self) -> Option<Duration> {
        self.directive.retry_after()
    }
}

pub type GatewayResult<T> = Result<T, GatewayFailure>;

/// Aggregate health for monitoring endpoints
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub database_reachable: bool,
    pub breaker: BreakerSnapshot,
    pub breaker_metrics: CircuitBreakerMetrics,
    pub pool: PoolMetrics,
    pub cache: CacheStats,
    pub diagnostics: StatusReport,
}

/// Request-handler facade over pool, cache and diagnostics
#[derive(Debug, Clone)]
pub struct DatabaseGateway {
    pool: ConnectionPool,
    cache: Arc<DependencyCache>,
    diagnostics: Arc<CrashDiagnostics>,
}

impl DatabaseGateway {
    /// Build every component from configuration and connect to MySQL
    pub async fn connect(config: &ResilienceConfig) -> GatewayResult<Self> {
        let factory = Arc::new(MySqlConnector::new(&config.database));
        Self::with_factory(config, factory).await
    }

    /// Build every component from configuration over an arbitrary driver
    pub async fn with_factory(
        config: &ResilienceConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> GatewayResult<Self> {
        let diagnostics = Arc::new(CrashDiagnostics::new(config.diagnostics.clone()));
        let fail = |error: ResilienceError| GatewayFailure {
            directive: diagnostics.record_failure(&error),
            error,
        };

        config.validate().map_err(fail)?;
        config.cache.log_configuration();

        let breaker = Arc::new(CircuitBreaker::new(
            "database",
            config.circuit_breaker.clone(),
        ));
        let pool = ConnectionPool::initialize(config.pool.clone(), factory, breaker)
            .await
            .map_err(fail)?;
        let cache = Arc::new(DependencyCache::new(config.cache.clone()));

        info!(database = %config.database.display_url(), "Database gateway ready");
        Ok(Self::new(pool, cache, diagnostics))
    }

    pub fn new(
        pool: ConnectionPool,
        cache: Arc<DependencyCache>,
        diagnostics: Arc<CrashDiagnostics>,
    ) -> Self {
        Self {
            pool,
            cache,
            diagnostics,
        }
    }

    /// Cached read. `depends_on` must name every table `sql` reads from.
    pub async fn query(
        &self,
        key: &str,
        category: &str,
        depends_on: &[&str],
        sql: &str,
    ) -> GatewayResult<Value> {
        self.cache
            .get_or_load(key, category, depends_on, || async {
                self.fetch(sql).await.map(Value::Array)
            })
            .await
    }

    /// Uncached read
    pub async fn fetch(&self, sql: &str) -> GatewayResult<Vec<Value>> {
        let mut lease = self.pool.acquire().await.map_err(|e| self.fail(e))?;
        let result = lease.fetch(sql).await;
        lease.release().await;
        result.map_err(|e| self.fail(e))
    }

    /// Run a write, then invalidate every table it touched once it has
    /// committed. Nothing is invalidated when the write fails.
    pub async fn execute_write(&self, sql: &str, tables: &[&str]) -> GatewayResult<u64> {
        let mut lease = self.pool.acquire().await.map_err(|e| self.fail(e))?;
        let result = lease.execute(sql).await;
        lease.release().await;
        let affected = result.map_err(|e| self.fail(e))?;

        for table in tables {
            self.cache.invalidate_table(table);
        }
        debug!(affected, tables = ?tables, "Write committed");
        Ok(affected)
    }

    pub async fn health(&self) -> GatewayHealth {
        let database_reachable = self.pool.health_check().await;
        let pool = self.pool.metrics();
        log_pool_operation(
            "health_check",
            if database_reachable { "ok" } else { "unreachable" },
            pool.active_connections,
            pool.idle_connections,
            None,
        );
        let breaker_metrics = self.pool.breaker().metrics();
        debug!(breaker = %breaker_metrics.format_summary(), "Circuit breaker status");
        GatewayHealth {
            database_reachable,
            breaker: self.pool.breaker().snapshot(),
            breaker_metrics,
            pool,
            cache: self.cache.stats(),
            diagnostics: self.diagnostics.generate_status_report(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<DependencyCache> {
        &self.cache
    }

    pub fn diagnostics(&self) -> &Arc<CrashDiagnostics> {
        &self.diagnostics
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn fail(&self, error: ResilienceError) -> GatewayFailure {
        let directive = self.diagnostics.record_failure(&error);
        GatewayFailure { error, directive }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::database::ConnectionError;
    use crate::diagnostics::ErrorCategory;
    use crate::test_helpers::MockConnector;
    use serde_json::json;

    fn config() -> ResilienceConfig {
        let mut config = ResilienceConfig::new(DatabaseConfig {
            host: "db.local".to_string(),
            port: 3306,
            username: "pos".to_string(),
            password: None,
            database_name: "restaurant".to_string(),
        });
        config.pool.pool_size = 2;
        config.pool.acquire_timeout_ms = 200;
        config.pool.reconnect_backoff_ms = 1;
        config
    }

    async fn gateway(connector: &MockConnector) -> DatabaseGateway {
        DatabaseGateway::with_factory(&config(), Arc::new(connector.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_query_reads_through_cache() {
        let connector = MockConnector::new();
        connector.set_rows(vec![json!({"id": 1, "name": "Drinks"})]);
        let gateway = gateway(&connector).await;

        let first = gateway
            .query("categories_all", "categories", &["categories"], "SELECT * FROM categories")
            .await
            .unwrap();
        let second = gateway
            .query("categories_all", "categories", &["categories"], "SELECT * FROM categories")
            .await
            .unwrap();

        assert_eq!(first, json!([{"id": 1, "name": "Drinks"}]));
        assert_eq!(first, second);
        assert_eq!(connector.statements().len(), 1);
        assert_eq!(gateway.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_write_invalidates_after_commit() {
        let connector = MockConnector::new();
        let gateway = gateway(&connector).await;
        gateway
            .query("products_1", "products", &["products"], "SELECT * FROM products WHERE id = 1")
            .await
            .unwrap();

        gateway
            .execute_write("UPDATE products SET price = 9 WHERE id = 1", &["products"])
            .await
            .unwrap();

        assert!(gateway.cache().get("products_1").is_none());
        assert!(gateway.cache().dependents_of("products").is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cache_and_is_classified() {
        let connector = MockConnector::new();
        let gateway = gateway(&connector).await;
        gateway
            .query("orders_open", "orders", &["orders"], "SELECT * FROM orders")
            .await
            .unwrap();
        connector.fail_next_executes_with(ConnectionError::Lost(
            "Lost connection to MySQL server during query".to_string(),
        ));

        let failure = gateway
            .execute_write("INSERT INTO orders VALUES (5)", &["orders"])
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ResilienceError::ConnectionFailed { .. }));
        assert_eq!(failure.directive, RecoveryDirective::Retry);
        assert!(gateway.cache().get("orders_open").is_some());
        assert_eq!(
            gateway
                .diagnostics()
                .occurrence_count(ErrorCategory::DatabaseUnreachable),
            1
        );
    }

    #[tokio::test]
    async fn test_open_circuit_is_degraded_with_retry_hint() {
        let connector = MockConnector::new();
        let gateway = gateway(&connector).await;
        gateway.pool().breaker().force_open();

        let failure = gateway.fetch("SELECT 1").await.unwrap_err();

        assert!(failure.is_degraded());
        assert!(failure.retry_after().is_some());
        assert!(matches!(failure.directive, RecoveryDirective::BackOff { .. }));
    }

    #[tokio::test]
    async fn test_init_failure_is_recorded() {
        let connector = MockConnector::new();
        connector.fail_next_connects(1);

        let failure = DatabaseGateway::with_factory(&config(), Arc::new(connector))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ResilienceError::PoolInit(_)));
    }

    #[tokio::test]
    async fn test_health_composes_components() {
        let connector = MockConnector::new();
        let gateway = gateway(&connector).await;

        let health = gateway.health().await;

        assert!(health.database_reachable);
        assert!(!health.breaker.is_open);
        assert_eq!(health.pool.pool_size, 2);
        assert_eq!(health.diagnostics.system_health.uptime_status, "healthy");
        assert!(serde_json::to_value(&health).is_ok());
    }
}
