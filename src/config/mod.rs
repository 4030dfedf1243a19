//! # Resilience Core Configuration
//!
//! Layered configuration for the connection pool, circuit breaker, query cache
//! and crash diagnostics. Values come from built-in defaults, an optional
//! TOML/YAML file and `POS_`-prefixed environment variables, in that order.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pos_resilience::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load()?;
//!
//! let pool_size = config.pool.pool_size;
//! let cooldown = config.circuit_breaker.cooldown();
//! # Ok(())
//! # }
//! ```
//!
//! The `database` section has no defaults for `host`, `username` and
//! `database_name`; loading fails when any of them is absent. Unknown keys
//! are ignored.

pub mod loader;
pub mod query_cache_config;

use crate::diagnostics::classifier::ClassifierRule;
use crate::error::{ResilienceError, ResilienceResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use crate::resilience::CircuitBreakerConfig;
pub use loader::ConfigLoader;
pub use query_cache_config::QueryCacheConfig;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResilienceConfig {
    /// Connection parameters for the remote database
    pub database: DatabaseConfig,

    /// Connection pool sizing and timeouts
    #[serde(default)]
    pub pool: PoolConfig,

    /// Circuit breaker thresholds guarding the pool
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Query cache TTL policy
    #[serde(default)]
    pub cache: QueryCacheConfig,

    /// Crash diagnostics settings
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// Database connection parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    pub database_name: String,
}

fn default_port() -> u16 {
    3306
}

impl DatabaseConfig {
    /// Connection URL with the password masked, safe for logs
    pub fn display_url(&self) -> String {
        let password = if self.password.is_some() { ":***" } else { "" };
        format!(
            "mysql://{}{}@{}:{}/{}",
            self.username, password, self.host, self.port, self.database_name
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("database.host must not be empty".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("database.username must not be empty".to_string());
        }
        if self.database_name.trim().is_empty() {
            return Err("database.database_name must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("database.port must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live connections
    pub pool_size: u32,

    /// Timeout for establishing a single connection
    pub connection_timeout_ms: u64,

    /// How long `acquire()` waits for a free connection
    pub acquire_timeout_ms: u64,

    /// Bounded reconnect attempts when a checked-out connection is dead
    pub reconnect_attempts: u32,

    /// Linear backoff step between reconnect attempts
    pub reconnect_backoff_ms: u64,

    /// Acquires slower than this are counted as slow
    pub slow_acquire_threshold_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            connection_timeout_ms: 10_000,
            acquire_timeout_ms: 30_000,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 100,
            slow_acquire_threshold_ms: 1_000,
        }
    }
}

impl PoolConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool.pool_size must be greater than 0".to_string());
        }
        if self.pool_size > 1000 {
            return Err("pool.pool_size should not exceed 1000".to_string());
        }
        if self.connection_timeout_ms == 0 {
            return Err("pool.connection_timeout_ms must be greater than 0".to_string());
        }
        if self.acquire_timeout_ms == 0 {
            return Err("pool.acquire_timeout_ms must be greater than 0".to_string());
        }
        if self.reconnect_attempts == 0 {
            return Err("pool.reconnect_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Crash diagnostics configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Rolling history capacity; oldest records are evicted first
    pub history_capacity: usize,

    /// Where the JSON diagnostic snapshot is written, if anywhere
    pub snapshot_path: Option<PathBuf>,

    /// Window used for burst detection
    pub burst_window_seconds: u64,

    /// Errors inside the burst window that count as a burst
    pub burst_threshold: usize,

    /// Occurrences after which a category stops auto-recovering
    pub auto_recovery_limit: u64,

    /// First back-off step handed to callers
    pub base_backoff_ms: u64,

    /// Upper bound for back-off delays
    pub max_backoff_ms: u64,

    /// Ordered keyword rules; the first matching rule wins
    pub classifier_rules: Vec<ClassifierRule>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            snapshot_path: None,
            burst_window_seconds: 300,
            burst_threshold: 3,
            auto_recovery_limit: 10,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            classifier_rules: ClassifierRule::defaults(),
        }
    }
}

impl DiagnosticsConfig {
    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_seconds)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.history_capacity == 0 {
            return Err("diagnostics.history_capacity must be greater than 0".to_string());
        }
        if self.burst_window_seconds == 0 {
            return Err("diagnostics.burst_window_seconds must be greater than 0".to_string());
        }
        if self.burst_threshold == 0 {
            return Err("diagnostics.burst_threshold must be greater than 0".to_string());
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err("diagnostics.base_backoff_ms must not exceed max_backoff_ms".to_string());
        }
        if let Some(rule) = self.classifier_rules.iter().find(|r| r.keywords.is_empty()) {
            return Err(format!(
                "diagnostics.classifier_rules entry for {} has no keywords",
                rule.category
            ));
        }
        Ok(())
    }
}

impl ResilienceConfig {
    /// Build a configuration with defaults for every optional section
    pub fn new(database: DatabaseConfig) -> Self {
        Self {
            database,
            pool: PoolConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: QueryCacheConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }

    /// Validate every section, reporting the first problem found
    pub fn validate(&self) -> ResilienceResult<()> {
        self.database
            .validate()
            .and_then(|_| self.pool.validate())
            .and_then(|_| self.circuit_breaker.validate())
            .and_then(|_| self.cache.validate())
            .and_then(|_| self.diagnostics.validate())
            .map_err(ResilienceError::Configuration)
    }

    /// JSON view of the configuration with credentials masked
    pub fn sanitized(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(password) = value.pointer_mut("/database/password") {
            if !password.is_null() {
                *password = serde_json::Value::String("***REDACTED***".to_string());
            }
        }
        value
    }
}
