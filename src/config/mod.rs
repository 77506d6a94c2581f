//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{BrokerConfig, BrokerType, ConsumerConfig};
pub use storage::{CacheConfig, CacheType, StorageConfig, StorageType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CLASSBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CLASSBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CLASSBUS_LOG";

use serde::Deserialize;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection and topology.
    pub broker: BrokerConfig,
    /// Consumer worker pool.
    pub consumer: ConsumerConfig,
    /// Cache backend.
    pub cache: CacheConfig,
    /// Persistence backend.
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let consumer = &self.consumer;
        if consumer.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "consumer.concurrency must be at least 1".to_string(),
            ));
        }
        if consumer.concurrency > consumer.max_concurrency {
            return Err(ConfigError::Invalid(format!(
                "consumer.concurrency ({}) exceeds consumer.max_concurrency ({})",
                consumer.concurrency, consumer.max_concurrency
            )));
        }

        let broker = &self.broker;
        for (field, value) in [
            ("broker.exchange", &broker.exchange),
            ("broker.queue", &broker.queue),
            ("broker.routing_key", &broker.routing_key),
            ("broker.dead_letter_exchange", &broker.dead_letter_exchange),
            ("broker.dead_letter_queue", &broker.dead_letter_queue),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
            }
        }
        if broker.queue == broker.dead_letter_queue {
            return Err(ConfigError::Invalid(
                "broker.queue and broker.dead_letter_queue must differ".to_string(),
            ));
        }

        if self.cache.namespace == self.cache.simple_namespace {
            return Err(ConfigError::Invalid(
                "cache.namespace and cache.simple_namespace must differ".to_string(),
            ));
        }

        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
