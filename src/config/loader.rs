//! Configuration Loader
//!
//! Builds a [`ResilienceConfig`] from defaults, an optional file and the
//! environment using the `config` crate.

use super::ResilienceConfig;
use crate::error::ResilienceResult;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "POS_CONFIG_FILE";

/// Prefix for environment overrides, e.g. `POS_POOL__POOL_SIZE=8`
pub const ENV_PREFIX: &str = "POS";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration, reading the file named by `POS_CONFIG_FILE` when set
    pub fn load() -> ResilienceResult<ResilienceConfig> {
        let path = env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load configuration from an explicit file (TOML or YAML by extension)
    pub fn load_from(path: Option<&Path>) -> ResilienceResult<ResilienceConfig> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).required(true));
        }
        let built = builder.add_source(Self::environment()).build()?;
        Self::finish(built)
    }

    /// Load configuration from an in-memory TOML document plus the environment
    pub fn from_toml_str(toml: &str) -> ResilienceResult<ResilienceConfig> {
        let built = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .add_source(Self::environment())
            .build()?;
        Self::finish(built)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn finish(built: Config) -> ResilienceResult<ResilienceConfig> {
        let config: ResilienceConfig = built.try_deserialize()?;
        config.validate()?;

        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&config.sanitized())
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );
        info!(
            database = %config.database.display_url(),
            pool_size = config.pool.pool_size,
            failure_threshold = config.circuit_breaker.failure_threshold,
            cooldown_seconds = config.circuit_breaker.cooldown_seconds,
            "Configuration loaded"
        );

        Ok(config)
    }
}
