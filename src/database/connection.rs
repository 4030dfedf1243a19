//! Driver contract consumed by the pool.
//!
//! The pool treats a connection as an opaque resource with four capabilities:
//! connect (through a [`ConnectionFactory`]), liveness check, execute and
//! close. `reset` clears session-local state before a connection goes back to
//! the idle set.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors reported by a database driver
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    /// Could not establish a connection
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The connection dropped underneath a statement
    #[error("Connection lost: {0}")]
    Lost(String),

    /// The statement itself failed; the connection is still usable
    #[error("Statement failed: {0}")]
    Execute(String),

    /// Operation attempted on a closed connection
    #[error("Connection closed")]
    Closed,
}

impl ConnectionError {
    /// Whether the failure says something about database reachability
    /// (as opposed to a bad statement) and should count against the breaker.
    pub fn is_connection_level(&self) -> bool {
        !matches!(self, ConnectionError::Execute(_))
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// One live database connection
#[async_trait]
pub trait DatabaseConnection: Send + fmt::Debug {
    /// Cheap round trip used as the liveness check
    async fn ping(&mut self) -> ConnectionResult<()>;

    /// Run a statement, returning the number of affected rows.
    ///
    /// Connections run in autocommit mode; `Ok` means the write is committed.
    async fn execute(&mut self, sql: &str) -> ConnectionResult<u64>;

    /// Run a query, returning each row as a JSON object
    async fn fetch(&mut self, sql: &str) -> ConnectionResult<Vec<Value>>;

    /// Discard session-local state such as an uncommitted transaction
    async fn reset(&mut self) -> ConnectionResult<()>;

    /// Close the connection, best effort
    async fn close(&mut self);
}

/// Opens new connections for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> ConnectionResult<Box<dyn DatabaseConnection>>;

    /// Human-readable target, safe for logs
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_classification() {
        assert!(ConnectionError::Connect("refused".to_string()).is_connection_level());
        assert!(ConnectionError::Lost("gone away".to_string()).is_connection_level());
        assert!(ConnectionError::Closed.is_connection_level());
        assert!(!ConnectionError::Execute("syntax error".to_string()).is_connection_level());
    }
}
