//! Application configuration.
//!
//! Read from a yaml, json or toml file, then overridden by `PIPEBUS__*`
//! environment variables, e.g. `PIPEBUS__ENGINE__TYPE=nats`.

use config::{Config, Environment, File};
use pipebus_core::bus::memory::{DEFAULT_BUFFER_SIZE, DEFAULT_DRAIN_INTERVAL};
use pipebus_core::retry::RetryConfig;
use pipebus_core::task::processor::DEFAULT_QUEUE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "PIPEBUS";

fn default_nats_url() -> String {
    pipebus_nats::client::DEFAULT_NATS_URL.to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_drain_interval() -> Duration {
    DEFAULT_DRAIN_INTERVAL
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

/// Main application configuration.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineOptions,
    #[serde(default)]
    pub workflows: WorkflowOptions,
    /// Queue size of processors whose definition sets none.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            engine: EngineOptions::default(),
            workflows: WorkflowOptions::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Engine backing the bus.
#[derive(PartialEq, Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// In-process topics with buffering.
    #[default]
    Memory,
    /// NATS core pub/sub.
    Nats,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct EngineOptions {
    #[serde(rename = "type", default)]
    pub engine_type: EngineType,
    /// Capacity of each memory topic buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Period of the memory engine drain cycle, e.g. "100ms".
    #[serde(default = "default_drain_interval", with = "humantime_serde")]
    pub drain_interval: Duration,
    #[serde(default)]
    pub nats: NatsOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            engine_type: EngineType::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            nats: NatsOptions::default(),
        }
    }
}

/// NATS connection options.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct NatsOptions {
    /// NATS server URL (e.g., "nats://localhost:4222"). Defaults to "localhost:4222".
    #[serde(default = "default_nats_url")]
    pub url: String,
    /// Path to an NKey credentials file. Anonymous when unset.
    pub credentials_path: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for NatsOptions {
    fn default() -> Self {
        NatsOptions {
            url: default_nats_url(),
            credentials_path: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Workflow definition discovery.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct WorkflowOptions {
    /// Glob pattern of definition files, e.g. "/etc/pipebus/workflows/*.yaml".
    pub path: Option<PathBuf>,
}

impl AppConfig {
    /// Loads the configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        Self::load_with(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with(path: Option<&Path>, environment: Environment) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(
                environment
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<AppConfig>()?
            .validated()
    }

    fn validated(self) -> Result<Self, config::ConfigError> {
        if self.engine.drain_interval.is_zero() {
            return Err(config::ConfigError::Message(
                "engine.drain_interval must be greater than zero".to_string(),
            ));
        }
        if self.queue_size == 0 {
            return Err(config::ConfigError::Message(
                "queue_size must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }
}
