//! # Circuit Breaker Configuration
//!
//! Thresholds for the breaker guarding database connection attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the pool's circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Seconds to wait in open state before allowing a probe
    pub cooldown_seconds: u64,
}

impl CircuitBreakerConfig {
    /// Time the breaker stays open before a half-open probe is allowed
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.cooldown_seconds == 0 {
            return Err("cooldown_seconds must be greater than 0".to_string());
        }

        if self.cooldown_seconds > 3600 {
            return Err("cooldown_seconds should not exceed 3600".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_config_validation() {
        // Valid config should pass
        let valid_config = CircuitBreakerConfig::default();
        assert!(valid_config.validate().is_ok());

        // Invalid failure threshold
        let mut invalid_config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(invalid_config.validate().is_err());

        // Invalid cooldown
        invalid_config = CircuitBreakerConfig {
            cooldown_seconds: 0,
            ..Default::default()
        };
        assert!(invalid_config.validate().is_err());

        invalid_config = CircuitBreakerConfig {
            cooldown_seconds: 7200,
            ..Default::default()
        };
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown(), Duration::from_secs(60));
    }
}
