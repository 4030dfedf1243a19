//! Static recovery playbook per failure category, plus the directive handed
//! back to callers after a failure.

use crate::diagnostics::classifier::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How bad a category of failure is for the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Medium,
    High,
    Critical,
    Unknown,
}

/// Recommended handling for one category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStrategy {
    pub category: ErrorCategory,
    pub description: String,
    pub severity: Severity,
    pub solutions: Vec<String>,
    /// Static eligibility for automatic recovery, before loop breaking
    pub auto_recovery: bool,
    /// Occurrences of this category in the current process
    pub occurrence_count: u64,
}

struct Playbook {
    description: &'static str,
    severity: Severity,
    solutions: &'static [&'static str],
    auto_recovery: bool,
}

fn playbook(category: ErrorCategory) -> Playbook {
    match category {
        ErrorCategory::PoolExhausted => Playbook {
            description: "Database connection pool exhausted",
            severity: Severity::High,
            solutions: &["increase_pool_size", "recover_pool", "fallback_connection"],
            auto_recovery: true,
        },
        ErrorCategory::ConnectionTimeout => Playbook {
            description: "Database connection timed out",
            severity: Severity::Medium,
            solutions: &["retry_with_backoff", "increase_timeout", "check_network_latency"],
            auto_recovery: true,
        },
        ErrorCategory::DatabaseUnreachable => Playbook {
            description: "Database server unreachable",
            severity: Severity::High,
            solutions: &["check_database_server", "verify_credentials", "fallback_connection"],
            auto_recovery: true,
        },
        ErrorCategory::MemoryExhausted => Playbook {
            description: "Process memory exhausted",
            severity: Severity::Critical,
            solutions: &["restart_server", "reduce_cache_size", "check_memory_leaks"],
            auto_recovery: false,
        },
        ErrorCategory::PortInUse => Playbook {
            description: "Server port already in use",
            severity: Severity::Medium,
            solutions: &["kill_existing_process", "use_alternate_port"],
            auto_recovery: true,
        },
        ErrorCategory::DiskFull => Playbook {
            description: "Disk full",
            severity: Severity::Critical,
            solutions: &["cleanup_logs", "free_disk_space", "rotate_snapshots"],
            auto_recovery: false,
        },
        ErrorCategory::Unknown => Playbook {
            description: "Unclassified error",
            severity: Severity::Unknown,
            solutions: &["manual_investigation"],
            auto_recovery: false,
        },
    }
}

impl RecoveryStrategy {
    pub fn for_category(category: ErrorCategory, occurrence_count: u64) -> Self {
        let playbook = playbook(category);
        Self {
            category,
            description: playbook.description.to_string(),
            severity: playbook.severity,
            solutions: playbook.solutions.iter().map(|s| s.to_string()).collect(),
            auto_recovery: playbook.auto_recovery,
            occurrence_count,
        }
    }
}

/// What the caller should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryDirective {
    /// Safe to retry right away
    Retry,

    /// Retry, but not before `delay` has passed
    BackOff {
        #[serde(with = "duration_millis")]
        delay: Duration,
    },

    /// Do not retry; needs operator attention
    Escalate,
}

impl RecoveryDirective {
    /// Retry-after hint for degraded responses
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RecoveryDirective::Retry => Some(Duration::ZERO),
            RecoveryDirective::BackOff { delay } => Some(*delay),
            RecoveryDirective::Escalate => None,
        }
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhausted_playbook() {
        let strategy = RecoveryStrategy::for_category(ErrorCategory::PoolExhausted, 2);
        assert_eq!(strategy.severity, Severity::High);
        assert_eq!(
            strategy.solutions,
            vec!["increase_pool_size", "recover_pool", "fallback_connection"]
        );
        assert!(strategy.auto_recovery);
        assert_eq!(strategy.occurrence_count, 2);
    }

    #[test]
    fn test_fatal_categories_never_auto_recover() {
        for category in [ErrorCategory::MemoryExhausted, ErrorCategory::DiskFull] {
            let strategy = RecoveryStrategy::for_category(category, 0);
            assert_eq!(strategy.severity, Severity::Critical);
            assert!(!strategy.auto_recovery);
        }
        assert!(!RecoveryStrategy::for_category(ErrorCategory::Unknown, 0).auto_recovery);
    }

    #[test]
    fn test_directive_serialization() {
        let json = serde_json::to_value(RecoveryDirective::BackOff {
            delay: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json["action"], "back_off");
        assert_eq!(json["delay"], 1500);
        assert_eq!(serde_json::to_value(Severity::Critical).unwrap(), "CRITICAL");
    }
}
