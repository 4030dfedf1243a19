//! # Crash Diagnostics
//!
//! Turns raw failures into categorized [`ErrorRecord`]s, keeps a bounded
//! rolling history and per-category occurrence counts, and recommends
//! whether a failure should be retried automatically.
//!
//! The history lock guards the rolling history and the per-category counts
//! together, so a count never exists without its record. The JSON snapshot
//! is serialized after the lock is released. Inside a tokio runtime the file
//! write runs on the blocking pool; snapshots are sequence-numbered so a slow
//! writer never overwrites a newer file.

use crate::config::DiagnosticsConfig;
use crate::diagnostics::classifier::{ErrorCategory, ErrorClassifier, KeywordClassifier};
use crate::diagnostics::recovery::{RecoveryDirective, RecoveryStrategy, Severity};
use crate::error::ResilienceError;
use crate::logging::log_error;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Records included in snapshots and status reports
const RECENT_RECORDS: usize = 10;

const BURST_SOLUTIONS: [&str; 3] = [
    "restart_server",
    "check_system_resources",
    "enable_maintenance_mode",
];

/// One classified failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub error_type: String,
    pub trace: Option<String>,
    /// Occurrences of `category` including this one
    pub occurrence_count: u64,
    /// Playbook solutions for `category` at the time of the failure
    pub recommended_actions: Vec<String>,
}

/// Aggregate health figures for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Errors currently held in the rolling history
    pub total_errors: usize,
    /// `"healthy"` or `"degraded"`
    pub uptime_status: String,
    pub most_common_error: Option<ErrorCategory>,
    pub errors_last_hour: usize,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub system_health: SystemHealth,
    pub error_breakdown: BTreeMap<String, u64>,
    pub recommendations: Vec<String>,
    pub recent_activity: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub counts: BTreeMap<String, u64>,
    pub most_frequent: Option<ErrorCategory>,
}

/// Persisted after every analyzed error
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticSnapshot {
    pub sequence: u64,
    pub generated_at: DateTime<Utc>,
    pub latest_error: Option<ErrorRecord>,
    pub error_summary: ErrorSummary,
    pub recent_errors: Vec<ErrorRecord>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Default)]
struct History {
    records: VecDeque<ErrorRecord>,
    sequence: u64,
}

/// Process-wide failure analyzer
pub struct CrashDiagnostics {
    config: DiagnosticsConfig,
    classifier: Box<dyn ErrorClassifier>,
    history: Mutex<History>,
    counts: DashMap<ErrorCategory, u64>,
    /// Sequence of the last snapshot written to disk
    last_written: Arc<Mutex<u64>>,
    started_at: DateTime<Utc>,
}

impl fmt::Debug for CrashDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashDiagnostics")
            .field("classifier", &self.classifier.classifier_name())
            .field("history_capacity", &self.config.history_capacity)
            .field("recorded", &self.history.lock().records.len())
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl CrashDiagnostics {
    /// Diagnostics using the configured keyword table
    pub fn new(config: DiagnosticsConfig) -> Self {
        let classifier = KeywordClassifier::new(config.classifier_rules.clone());
        Self::with_classifier(config, Box::new(classifier))
    }

    pub fn with_classifier(config: DiagnosticsConfig, classifier: Box<dyn ErrorClassifier>) -> Self {
        info!(
            classifier = classifier.classifier_name(),
            history_capacity = config.history_capacity,
            snapshot_path = ?config.snapshot_path,
            "Crash diagnostics initialized"
        );
        Self {
            history: Mutex::new(History {
                records: VecDeque::with_capacity(config.history_capacity),
                sequence: 0,
            }),
            counts: DashMap::new(),
            last_written: Arc::new(Mutex::new(0)),
            started_at: Utc::now(),
            classifier,
            config,
        }
    }

    /// Classify a failure, record it, and refresh the persisted snapshot
    pub fn analyze_error(&self, message: &str, error_type: &str, trace: Option<&str>) -> ErrorRecord {
        let category = self.classifier.classify(message, error_type);

        let (record, snapshot_parts) = {
            let mut history = self.history.lock();
            let occurrences = {
                let mut count = self.counts.entry(category).or_insert(0);
                *count += 1;
                *count
            };
            let strategy = RecoveryStrategy::for_category(category, occurrences);
            let record = ErrorRecord {
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                category,
                severity: strategy.severity,
                message: message.to_string(),
                error_type: error_type.to_string(),
                trace: trace.map(str::to_string),
                occurrence_count: occurrences,
                recommended_actions: strategy.solutions,
            };

            history.records.push_back(record.clone());
            while history.records.len() > self.config.history_capacity {
                history.records.pop_front();
            }
            history.sequence += 1;
            let parts = (history.sequence, recent(&history.records));
            (record, parts)
        };
        let occurrences = record.occurrence_count;

        match record.severity {
            Severity::Critical => error!(
                category = %category,
                error_type = error_type,
                occurrences,
                message = message,
                "Critical failure recorded"
            ),
            _ => warn!(
                category = %category,
                error_type = error_type,
                occurrences,
                message = message,
                "Failure recorded"
            ),
        }

        if let Some(path) = &self.config.snapshot_path {
            let (sequence, recent_errors) = snapshot_parts;
            let snapshot = DiagnosticSnapshot {
                sequence,
                generated_at: Utc::now(),
                latest_error: Some(record.clone()),
                error_summary: ErrorSummary {
                    counts: self.error_breakdown(),
                    most_frequent: self.most_frequent(),
                },
                recent_errors,
                recommendations: self.recommendations(),
            };
            self.persist_snapshot(path, &snapshot);
        }

        record
    }

    /// Record a failure surfaced by the pool and decide what the caller
    /// should do next
    pub fn record_failure(&self, err: &ResilienceError) -> RecoveryDirective {
        let record = self.analyze_error(&err.to_string(), err.error_type(), None);
        let directive = match (self.directive_for(record.category), err) {
            (RecoveryDirective::Escalate, _) => RecoveryDirective::Escalate,
            (_, ResilienceError::CircuitOpen { retry_after, .. }) => RecoveryDirective::BackOff {
                delay: *retry_after,
            },
            (directive, _) => directive,
        };
        if directive == RecoveryDirective::Escalate {
            log_error(
                "diagnostics",
                record.category.as_str(),
                &record.message,
                Some("automatic recovery not permitted"),
            );
        }
        directive
    }

    /// Static auto-recovery flag, overridden to `false` once the category has
    /// occurred more than the configured limit (10 by default)
    pub fn should_auto_recover(&self, category: ErrorCategory) -> bool {
        RecoveryStrategy::for_category(category, 0).auto_recovery
            && self.occurrence_count(category) <= self.config.auto_recovery_limit
    }

    pub fn get_recovery_strategy(&self, category: ErrorCategory) -> RecoveryStrategy {
        RecoveryStrategy::for_category(category, self.occurrence_count(category))
    }

    /// Escalate when auto-recovery is off; otherwise retry once, then back
    /// off exponentially, jumping to the maximum delay during a burst
    pub fn directive_for(&self, category: ErrorCategory) -> RecoveryDirective {
        if !self.should_auto_recover(category) {
            return RecoveryDirective::Escalate;
        }
        if self.burst_detected() {
            return RecoveryDirective::BackOff {
                delay: self.config.max_backoff(),
            };
        }
        match self.occurrence_count(category) {
            0 | 1 => RecoveryDirective::Retry,
            count => {
                let exponent = (count - 2).min(16) as u32;
                let delay = self
                    .config
                    .base_backoff()
                    .saturating_mul(2u32.saturating_pow(exponent))
                    .min(self.config.max_backoff());
                RecoveryDirective::BackOff { delay }
            }
        }
    }

    pub fn occurrence_count(&self, category: ErrorCategory) -> u64 {
        self.counts.get(&category).map(|count| *count).unwrap_or(0)
    }

    /// Whether the burst threshold was reached inside the burst window
    pub fn burst_detected(&self) -> bool {
        self.errors_since(self.config.burst_window()) >= self.config.burst_threshold
    }

    /// Solutions of every category seen more than five times, then the burst
    /// playbook when a burst is in progress. No duplicates.
    pub fn recommendations(&self) -> Vec<String> {
        let mut frequent: Vec<(ErrorCategory, u64)> = self
            .counts
            .iter()
            .filter(|entry| *entry.value() > 5)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        frequent.sort();

        let mut recommendations: Vec<String> = Vec::new();
        let mut push = |solution: &str| {
            if !recommendations.iter().any(|r| r == solution) {
                recommendations.push(solution.to_string());
            }
        };
        for (category, _) in frequent {
            for solution in RecoveryStrategy::for_category(category, 0).solutions {
                push(solution.as_str());
            }
        }
        if self.burst_detected() {
            for solution in BURST_SOLUTIONS {
                push(solution);
            }
        }
        recommendations
    }

    pub fn generate_status_report(&self) -> StatusReport {
        let (total_errors, errors_last_hour, recent_activity) = {
            let history = self.history.lock();
            let hour_ago = Utc::now() - chrono::Duration::hours(1);
            (
                history.records.len(),
                history
                    .records
                    .iter()
                    .filter(|r| r.timestamp >= hour_ago)
                    .count(),
                recent(&history.records),
            )
        };

        let most_common_error = self.most_frequent();

        let uptime_status = if total_errors > 10 { "degraded" } else { "healthy" };

        StatusReport {
            generated_at: Utc::now(),
            system_health: SystemHealth {
                total_errors,
                uptime_status: uptime_status.to_string(),
                most_common_error,
                errors_last_hour,
                uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            },
            error_breakdown: self.error_breakdown(),
            recommendations: self.recommendations(),
            recent_activity,
        }
    }

    /// Operator reset of history and counters
    pub fn clear_history(&self) {
        {
            let mut history = self.history.lock();
            history.records.clear();
            self.counts.clear();
        }
        info!("Crash diagnostics history cleared");
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().records.len()
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    fn error_breakdown(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().to_string(), *entry.value()))
            .collect()
    }

    /// Highest count wins; ties go to the category declared first
    fn most_frequent(&self) -> Option<ErrorCategory> {
        self.counts
            .iter()
            .map(|entry| (*entry.value(), *entry.key()))
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, category)| category)
    }

    fn errors_since(&self, window: Duration) -> usize {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - window;
        self.history
            .lock()
            .records
            .iter()
            .rev()
            .take_while(|r| r.timestamp >= cutoff)
            .count()
    }

    /// Best effort; failures are logged and never surfaced.
    ///
    /// Called from async request handlers, so the filesystem work moves to
    /// the blocking pool whenever a tokio runtime is available.
    fn persist_snapshot(&self, path: &Path, snapshot: &DiagnosticSnapshot) {
        let body = match serde_json::to_string_pretty(snapshot) {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "Failed to serialize diagnostic snapshot");
                return;
            }
        };

        let writer = SnapshotWriter {
            path: path.to_path_buf(),
            last_written: Arc::clone(&self.last_written),
        };
        let sequence = snapshot.sequence;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || writer.write(sequence, &body));
            }
            Err(_) => writer.write(sequence, &body),
        }
    }
}

struct SnapshotWriter {
    path: PathBuf,
    last_written: Arc<Mutex<u64>>,
}

impl SnapshotWriter {
    fn write(&self, sequence: u64, body: &str) {
        let mut last_written = self.last_written.lock();
        if *last_written >= sequence {
            debug!(sequence, newer = *last_written, "Skipping stale diagnostic snapshot");
            return;
        }
        match write_atomically(&self.path, body) {
            Ok(()) => {
                *last_written = sequence;
                debug!(path = %self.path.display(), sequence, "Diagnostic snapshot written");
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Failed to write diagnostic snapshot");
            }
        }
    }
}

fn recent(records: &VecDeque<ErrorRecord>) -> Vec<ErrorRecord> {
    let skip = records.len().saturating_sub(RECENT_RECORDS);
    records.iter().skip(skip).cloned().collect()
}

fn write_atomically(path: &Path, body: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}
