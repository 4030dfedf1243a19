//! # Database Access
//!
//! Connection pooling for the remote restaurant database.
//!
//! ## Key Components
//!
//! - [`connection`] - driver contract (`DatabaseConnection`, `ConnectionFactory`)
//! - [`pool`] - bounded, breaker-gated connection pool and its [`Lease`] handle
//! - [`pool_stats`] - lock-free pool counters and the [`PoolMetrics`] snapshot
//! - [`mysql`] - sqlx-backed MySQL driver
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use pos_resilience::config::DatabaseConfig;
//! use pos_resilience::database::{ConnectionPool, MySqlConnector};
//! use pos_resilience::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::sync::Arc;
//!
//! # async fn example(db: DatabaseConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = Arc::new(CircuitBreaker::new("database", CircuitBreakerConfig::default()));
//! let pool = ConnectionPool::initialize(
//!     Default::default(),
//!     Arc::new(MySqlConnector::new(&db)),
//!     breaker,
//! )
//! .await?;
//!
//! let mut lease = pool.acquire().await?;
//! let rows = lease.fetch("SELECT id, name FROM menu_items").await?;
//! lease.release().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod mysql;
pub mod pool;
pub mod pool_stats;

pub use connection::{ConnectionError, ConnectionFactory, ConnectionResult, DatabaseConnection};
pub use mysql::MySqlConnector;
pub use pool::{ConnectionPool, Lease};
pub use pool_stats::{AtomicPoolStats, PoolMetrics};
