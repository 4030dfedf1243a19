//! # Failure Classification
//!
//! Maps raw failure text onto a fixed set of operational categories using an
//! ordered keyword table. The table is data: the defaults below can be
//! replaced through `diagnostics.classifier_rules`.
//!
//! Matching is case-insensitive substring search over the message followed by
//! the error type name. Rules are evaluated in order and the first rule with a
//! matching keyword wins, so more specific conditions should come first.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operational failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// No free connection in the pool, or the server refused more
    PoolExhausted,

    /// Connecting or querying took longer than allowed
    ConnectionTimeout,

    /// The database server cannot be reached or dropped the connection
    DatabaseUnreachable,

    /// The process ran out of memory
    MemoryExhausted,

    /// The listening port is taken by another process
    PortInUse,

    /// No space left for logs, snapshots or temp files
    DiskFull,

    /// Nothing in the keyword table matched
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::PoolExhausted,
        ErrorCategory::ConnectionTimeout,
        ErrorCategory::DatabaseUnreachable,
        ErrorCategory::MemoryExhausted,
        ErrorCategory::PortInUse,
        ErrorCategory::DiskFull,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::PoolExhausted => "pool_exhausted",
            ErrorCategory::ConnectionTimeout => "connection_timeout",
            ErrorCategory::DatabaseUnreachable => "database_unreachable",
            ErrorCategory::MemoryExhausted => "memory_exhausted",
            ErrorCategory::PortInUse => "port_in_use",
            ErrorCategory::DiskFull => "disk_full",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the keyword table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub category: ErrorCategory,
    pub keywords: Vec<String>,
}

impl ClassifierRule {
    pub fn new(category: ErrorCategory, keywords: &[&str]) -> Self {
        Self {
            category,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    fn matches(&self, haystack: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| haystack.contains(&keyword.to_lowercase()))
    }

    /// Built-in keyword table for MySQL-backed deployments
    pub fn defaults() -> Vec<ClassifierRule> {
        vec![
            ClassifierRule::new(
                ErrorCategory::PoolExhausted,
                &[
                    "too many connections",
                    "pool exhausted",
                    "poolexhausted",
                    "no connections available",
                ],
            ),
            ClassifierRule::new(
                ErrorCategory::ConnectionTimeout,
                &["timed out", "timeout", "lock wait timeout exceeded"],
            ),
            ClassifierRule::new(
                ErrorCategory::DatabaseUnreachable,
                &[
                    "lost connection to mysql server",
                    "can't connect",
                    "mysql server has gone away",
                    "server has gone away",
                    "connection refused",
                    "unknown mysql server host",
                    "circuit breaker is open",
                    "connectionfailed",
                ],
            ),
            ClassifierRule::new(
                ErrorCategory::MemoryExhausted,
                &[
                    "out of memory",
                    "memoryerror",
                    "cannot allocate memory",
                    "memory allocation failed",
                ],
            ),
            ClassifierRule::new(
                ErrorCategory::PortInUse,
                &["address already in use", "port is already allocated", "eaddrinuse"],
            ),
            ClassifierRule::new(
                ErrorCategory::DiskFull,
                &["no space left on device", "disk full", "disk quota exceeded"],
            ),
        ]
    }
}

/// Strategy for turning failure text into a category
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, message: &str, error_type: &str) -> ErrorCategory;

    /// Get the classifier name for identification
    fn classifier_name(&self) -> &'static str;
}

/// Ordered keyword-table classifier
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<ClassifierRule>,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(ClassifierRule::defaults())
    }
}

impl ErrorClassifier for KeywordClassifier {
    fn classify(&self, message: &str, error_type: &str) -> ErrorCategory {
        let haystack = format!("{} {}", message.to_lowercase(), error_type.to_lowercase());
        self.rules
            .iter()
            .find(|rule| rule.matches(&haystack))
            .map(|rule| rule.category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    fn classifier_name(&self) -> &'static str {
        "keyword"
    }
}
