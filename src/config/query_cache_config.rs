//! Query Cache Configuration Management
//!
//! TTL policy for the dependency-aware query cache. Every cached entry carries
//! a category; the category decides how long the entry may live before a read
//! treats it as expired. Dependency invalidation remains the primary
//! freshness mechanism, the TTL is only the safety net.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for query cache behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    pub enabled: bool,

    /// TTL applied to categories without an explicit entry
    pub default_ttl_seconds: u64,

    /// Per-category TTL overrides
    pub category_ttls: HashMap<String, u64>,

    /// Upper bound on stored entries before the least useful are evicted
    pub max_entries: u64,
}

impl Default for QueryCacheConfig {
    /// Default configuration suitable for production
    fn default() -> Self {
        let category_ttls = [
            ("categories", 600),
            ("menu", 300),
            ("products", 300),
            ("tables", 30),
            ("orders", 10),
        ]
        .into_iter()
        .map(|(category, ttl)| (category.to_string(), ttl))
        .collect();

        Self {
            enabled: true,
            default_ttl_seconds: 60,
            category_ttls,
            max_entries: 10_000,
        }
    }
}

impl QueryCacheConfig {
    /// Create test-optimized configuration with rapid expiry
    pub fn for_test() -> Self {
        let mut config = Self::default();
        for ttl in config.category_ttls.values_mut() {
            *ttl = (*ttl).min(5);
        }
        config.default_ttl_seconds = 2;
        config
    }

    /// TTL for a category, falling back to the default
    pub fn ttl_for(&self, category: &str) -> Duration {
        let seconds = self
            .category_ttls
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl_seconds);
        Duration::from_secs(seconds)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    /// Check if query caching is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Log current configuration for debugging
    pub fn log_configuration(&self) {
        info!(
            enabled = self.enabled,
            max_entries = self.max_entries,
            default_ttl_seconds = self.default_ttl_seconds,
            categories = self.category_ttls.len(),
            "Query cache configuration"
        );
        for (category, ttl) in &self.category_ttls {
            info!(category = %category, ttl_seconds = ttl, "Query cache category TTL");
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl_seconds == 0 {
            return Err("cache.default_ttl_seconds must be greater than 0".to_string());
        }

        if self.max_entries == 0 {
            return Err("cache.max_entries must be greater than 0".to_string());
        }

        if let Some((category, _)) = self.category_ttls.iter().find(|(c, _)| c.trim().is_empty()) {
            return Err(format!("cache.category_ttls has an empty category name: {category:?}"));
        }

        // Warn about potentially problematic configurations
        for (category, ttl) in &self.category_ttls {
            if *ttl == 0 {
                warn!(category = %category, "Cache TTL is 0 - caching effectively disabled for category");
            }
        }

        Ok(())
    }
}
