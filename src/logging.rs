//! # Structured Logging Module
//!
//! Environment-aware structured logging for the resilience core. Console
//! output is human-readable in development and JSON in production (or when
//! `POS_LOG_FORMAT=json`), so pool, cache and diagnostics events can be
//! shipped to a log collector without reformatting.

use chrono::Utc;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs a subscriber,
/// and an already-installed global subscriber is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
        let json = use_json_format(&environment);

        let console = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(console.with_filter(filter));

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            json,
            "Structured logging initialized"
        );
    });
}

/// Current deployment environment
fn get_environment() -> String {
    std::env::var("POS_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Default filter directive for an environment when `RUST_LOG` is unset
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        _ => "debug".to_string(),
    }
}

fn use_json_format(environment: &str) -> bool {
    match std::env::var("POS_LOG_FORMAT") {
        Ok(format) => format.eq_ignore_ascii_case("json"),
        Err(_) => environment == "production",
    }
}

/// Log structured data for connection pool operations
pub fn log_pool_operation(
    operation: &str,
    status: &str,
    active: u64,
    idle: usize,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        status = %status,
        active,
        idle,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "POOL_OPERATION"
    );
}

/// Log structured data for cache operations
pub fn log_cache_operation(operation: &str, target: &str, affected: usize, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        cache_target = %target,
        affected,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "CACHE_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
