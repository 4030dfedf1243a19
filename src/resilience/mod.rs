//! # Resilience Module
//!
//! Circuit breaking for database connection attempts. The connection pool
//! consults the breaker before every acquisition and reports each outcome back,
//! so an unreachable database turns into immediate `CircuitOpen` errors instead
//! of a pile-up of slow connection timeouts.
//!
//! ## Usage
//!
//! ```rust
//! use pos_resilience::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("database", CircuitBreakerConfig::default());
//!
//! if breaker.allow_attempt() {
//!     // ... talk to the database ...
//!     breaker.record_success();
//! }
//! assert!(!breaker.snapshot().is_open);
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;

pub use circuit_breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerError, CircuitState,
    ProbeGuard,
};
pub use config::CircuitBreakerConfig;
pub use metrics::CircuitBreakerMetrics;
