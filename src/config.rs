//! Bus configuration.
//!
//! Loaded from an optional YAML file with `RELAYBUS__*` environment
//! overrides (`__` separates nesting levels), for example
//! `RELAYBUS__TRANSACTIONAL__PROVIDER=pg`.
//!
//! ```yaml
//! service_name: orders
//! worker_count: 4
//! transactional:
//!   provider: pg
//!   connection_string: postgres://localhost/orders
//! dead_letter: orders.dlq
//! max_retries: 5
//! ```

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

use crate::error::BusError;
use crate::serialization::{serializer_for, DEFAULT_SERIALIZER};

/// Environment variable prefix for overrides.
pub const CONFIG_ENV_PREFIX: &str = "RELAYBUS";
/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "RELAYBUS_CONFIG";
/// Default events exchange.
pub const DEFAULT_EVENTS_EXCHANGE: &str = "relaybus.events";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for BusError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Transactional mode. An empty provider means non-transactional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransactionalConfig {
    /// Registered provider name (`memory`, `pg`, ...).
    pub provider: String,
    pub connection_string: String,
}

impl TransactionalConfig {
    pub fn is_enabled(&self) -> bool {
        !self.provider.is_empty()
    }
}

/// Bounds of the in-process retry after a saga version conflict.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConflictRetryConfig {
    /// Retries after the first attempt. Default: 3.
    pub max_attempts: usize,
    /// Default: 5ms.
    pub min_delay_ms: u64,
    /// Default: 200ms.
    pub max_delay_ms: u64,
}

impl Default for ConflictRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 5,
            max_delay_ms: 200,
        }
    }
}

impl ConflictRetryConfig {
    pub fn backoff(&self) -> ExponentialBuilder {
        crate::utils::retry::conflict_backoff(
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

/// Bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Service name; also the inbound queue name.
    pub service_name: String,
    /// Broker connection string, handed to the broker implementation.
    pub broker_url: String,
    /// Concurrent workers. 0 means 1.
    pub worker_count: usize,
    /// Capacity of the inbound channel between consumer and workers.
    pub inbound_capacity: usize,
    pub transactional: TransactionalConfig,
    /// Saga store connection string. Empty means the store of the
    /// transactional backend (or in-memory when non-transactional).
    pub saga_store: String,
    /// Dead-letter queue. Empty disables dead-lettering; failing envelopes
    /// are then redelivered indefinitely.
    pub dead_letter: String,
    /// Body serializer name.
    pub serializer: String,
    /// Discard envelopes queued before `start`.
    pub purge_on_startup: bool,
    /// Failed deliveries before an envelope is dead-lettered.
    pub max_retries: u32,
    pub events_exchange: String,
    pub conflict_retry: ConflictRetryConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            broker_url: String::new(),
            worker_count: 1,
            inbound_capacity: 64,
            transactional: TransactionalConfig::default(),
            saga_store: String::new(),
            dead_letter: String::new(),
            serializer: DEFAULT_SERIALIZER.to_string(),
            purge_on_startup: false,
            max_retries: 3,
            events_exchange: DEFAULT_EVENTS_EXCHANGE.to_string(),
            conflict_retry: ConflictRetryConfig::default(),
        }
    }
}

impl BusConfig {
    /// Default configuration for a service.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Load from an optional YAML file, the file named by
    /// `RELAYBUS_CONFIG`, then `RELAYBUS__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder();

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BusConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no bus can be built from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid("service_name must be set".to_string()));
        }
        if let Err(e) = serializer_for(&self.serializer) {
            return Err(ConfigError::Invalid(e.to_string()));
        }
        if !self.saga_store.is_empty() && !self.transactional.is_enabled() {
            return Err(ConfigError::Invalid(
                "saga_store requires transactional mode; a durable saga store must share the \
                 unit of work"
                    .to_string(),
            ));
        }
        if self.inbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "inbound_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker count with the minimum of one applied.
    pub fn effective_workers(&self) -> usize {
        self.worker_count.max(1)
    }

    pub fn dead_letter_queue(&self) -> Option<&str> {
        (!self.dead_letter.is_empty()).then_some(self.dead_letter.as_str())
    }

    /// Connection string of the transactional backend; a separate saga store
    /// connection string takes precedence.
    pub fn backend_connection_string(&self) -> &str {
        if self.saga_store.is_empty() {
            &self.transactional.connection_string
        } else {
            &self.saga_store
        }
    }
}
