//! Error types for the resilience core.
//!

use std::time::Duration;
use thiserror::Error;

/// Typed failures surfaced to request handlers.
///
/// Handlers are expected to map `CircuitOpen` and `PoolExhausted` onto a
/// "service temporarily degraded" response rather than a generic failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResilienceError {
    #[error("Circuit breaker is open for {component}, retry after {retry_after:?}")]
    CircuitOpen {
        component: String,
        retry_after: Duration,
    },
    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },
    #[error("Connection failed after {attempts} attempt(s): {message}")]
    ConnectionFailed { attempts: u32, message: String },
    #[error("Pool initialization failed: {0}")]
    PoolInit(String),
    #[error("Connection pool is shut down")]
    PoolClosed,
    #[error("Query error: {0}")]
    Query(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ResilienceError {
    /// Whether a caller should present this as a temporary degradation.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. } | ResilienceError::PoolExhausted { .. }
        )
    }

    /// Raw text fed to the diagnostics classifier.
    pub fn error_type(&self) -> &'static str {
        match self {
            ResilienceError::CircuitOpen { .. } => "CircuitOpenError",
            ResilienceError::PoolExhausted { .. } => "PoolExhaustedError",
            ResilienceError::ConnectionFailed { .. } => "ConnectionFailedError",
            ResilienceError::PoolInit(_) => "PoolInitError",
            ResilienceError::PoolClosed => "PoolClosedError",
            ResilienceError::Query(_) => "QueryError",
            ResilienceError::Configuration(_) => "ConfigurationError",
            ResilienceError::Serialization(_) => "SerializationError",
        }
    }
}

impl From<serde_json::Error> for ResilienceError {
    fn from(error: serde_json::Error) -> Self {
        ResilienceError::Serialization(error.to_string())
    }
}

impl From<crate::cache::CacheError> for ResilienceError {
    fn from(err: crate::cache::CacheError) -> Self {
        ResilienceError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for ResilienceError {
    fn from(err: sqlx::Error) -> Self {
        ResilienceError::Query(err.to_string())
    }
}

impl From<config::ConfigError> for ResilienceError {
    fn from(err: config::ConfigError) -> Self {
        ResilienceError::Configuration(err.to_string())
    }
}

pub type ResilienceResult<T> = std::result::Result<T, ResilienceError>;
