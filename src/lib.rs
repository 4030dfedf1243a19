#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # POS Resilience Core
//!
//! The layer between a restaurant point-of-sale backend's request handlers
//! and its remote MySQL database, reached over a slow and sometimes flaky
//! network link.
//!
//! ## Overview
//!
//! - **Connection pool** with a **circuit breaker**: bounded connections,
//!   exclusive leases, fail-fast while the database is down.
//! - **Dependency-aware cache**: query results with category TTLs, dropped
//!   by table when a write commits.
//! - **Crash diagnostics**: failure classification, rolling history, and a
//!   retry / back-off / escalate decision for every failure.
//!
//! ## Module Organization
//!
//! - [`config`] - Layered configuration (defaults, file, `POS_*` environment)
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup and operation log helpers
//! - [`resilience`] - Circuit breaker
//! - [`database`] - Driver contract, connection pool, MySQL driver
//! - [`cache`] - Dependency-aware query cache
//! - [`diagnostics`] - Failure classification and recovery playbook
//! - [`gateway`] - Facade wiring the above together for request handlers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pos_resilience::config::ConfigLoader;
//! use pos_resilience::gateway::DatabaseGateway;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! pos_resilience::logging::init_structured_logging();
//! let config = ConfigLoader::load()?;
//! let gateway = DatabaseGateway::connect(&config).await?;
//!
//! let menu = gateway
//!     .query("menu_all", "menu", &["products", "categories"], "SELECT * FROM products")
//!     .await?;
//!
//! gateway
//!     .execute_write("UPDATE products SET price = 12.5 WHERE id = 3", &["products"])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod database;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod resilience;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

pub use cache::{CacheStats, DependencyCache};
pub use config::{DatabaseConfig, PoolConfig, ResilienceConfig};
pub use database::{ConnectionPool, Lease, PoolMetrics};
pub use diagnostics::{CrashDiagnostics, ErrorCategory, RecoveryDirective};
pub use error::{ResilienceError, ResilienceResult};
pub use gateway::{DatabaseGateway, GatewayFailure};
pub use resilience::{CircuitBreaker, CircuitState};
