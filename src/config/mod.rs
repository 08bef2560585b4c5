//! Application configuration.
//!
//! Aggregates the broker, sweeper, consumer and outbox settings into a single
//! `Config` that can be loaded from YAML files or environment variables.

mod rabbitmq;

pub use rabbitmq::{RabbitMqSettings, DEFAULT_EXCHANGE_NAME, DEFAULT_QUEUE_NAME, ERROR_QUEUE_SUFFIX};

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "HERALD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HERALD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "HERALD_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Dead-letter sweeper settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Run the sweeper. Default: true.
    pub enabled: bool,
    /// Seconds between sweep cycles. Default: 10.
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Consumer loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// How long `stop` waits for an in-flight handler. Default: 30.
    pub shutdown_grace_secs: u64,
    /// Per-delivery handler timeout; absent means no limit.
    pub handler_timeout_secs: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 30,
            handler_timeout_secs: None,
        }
    }
}

impl ConsumerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }
}

/// Outbox relay settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Run the relay task. Default: false.
    pub enabled: bool,
    /// Database holding the outbox table. Default: `sqlite://herald-outbox.db`.
    pub database_url: String,
    /// Seconds between relay passes. Default: 5.
    pub relay_interval_secs: u64,
    /// Records fetched per pass. Default: 100.
    pub batch_size: u32,
    /// Failed publish attempts before a record is flagged. Default: 10.
    pub max_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database_url: "sqlite://herald-outbox.db".to_string(),
            relay_interval_secs: 5,
            batch_size: 100,
            max_attempts: 10,
        }
    }
}

impl OutboxConfig {
    pub fn relay_interval(&self) -> Duration {
        Duration::from_secs(self.relay_interval_secs)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rabbitmq: RabbitMqSettings,
    pub sweeper: SweeperConfig,
    pub consumer: ConsumerConfig,
    pub outbox: OutboxConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix and `__` separator
    ///
    /// The result is validated before it is returned.
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

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rabbitmq = &self.rabbitmq;
        if rabbitmq.exchange.trim().is_empty() {
            return Err(ConfigError::Invalid("rabbitmq.exchange must not be empty".into()));
        }
        if rabbitmq.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "rabbitmq.queue_name must not be empty".into(),
            ));
        }
        if rabbitmq.prefetch == 0 {
            return Err(ConfigError::Invalid("rabbitmq.prefetch must be positive".into()));
        }
        if rabbitmq.connection_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "rabbitmq.connection_timeout_secs must be positive".into(),
            ));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweeper.interval_secs must be positive".into(),
            ));
        }
        if self.consumer.handler_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "consumer.handler_timeout_secs must be positive when set".into(),
            ));
        }
        if self.outbox.relay_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "outbox.relay_interval_secs must be positive".into(),
            ));
        }
        if self.outbox.batch_size == 0 || self.outbox.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "outbox.batch_size and outbox.max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}
