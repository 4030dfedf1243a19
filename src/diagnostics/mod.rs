//! # Crash Diagnostics
//!
//! Classifies failures from the pool and the rest of the service, keeps a
//! rolling error history, and tells callers whether to retry, back off or
//! escalate.
//!
//! ## Usage
//!
//! ```rust
//! use pos_resilience::config::DiagnosticsConfig;
//! use pos_resilience::diagnostics::{CrashDiagnostics, ErrorCategory};
//!
//! let diagnostics = CrashDiagnostics::new(DiagnosticsConfig::default());
//! let record = diagnostics.analyze_error("Too many connections", "OperationalError", None);
//!
//! assert_eq!(record.category, ErrorCategory::PoolExhausted);
//! assert!(diagnostics.should_auto_recover(record.category));
//! ```

pub mod classifier;
pub mod crash_diagnostics;
pub mod recovery;

pub use classifier::{ClassifierRule, ErrorCategory, ErrorClassifier, KeywordClassifier};
pub use crash_diagnostics::{
    CrashDiagnostics, DiagnosticSnapshot, ErrorRecord, ErrorSummary, StatusReport, SystemHealth,
};
pub use recovery::{RecoveryDirective, RecoveryStrategy, Severity};
