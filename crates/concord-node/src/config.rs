//! Node configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `CONCORD_`-prefixed environment variables. Nested keys use a double
//! underscore, e.g. `CONCORD_ENGINE__STAGE_TIMEOUT_MS=2000`.

use concord_consensus::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CONCORD";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The configuration is well-formed but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The configuration could not be rendered.
    #[error("failed to render configuration: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// Configuration for a Concord node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address of the status and metrics HTTP server.
    pub api_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Emit JSON logs instead of pretty ones.
    pub log_json: bool,
    /// Local committee settings.
    pub devnet: DevnetConfig,
    /// Consensus engine settings shared by every member.
    pub engine: EngineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            log_json: false,
            devnet: DevnetConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Settings of the in-process committee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevnetConfig {
    /// Committee members.
    pub committee_size: u16,
    /// Timer tick period for every engine.
    pub tick_ms: u64,
    /// Interval between generated requests; zero disables the generator.
    pub request_interval_ms: u64,
    /// Inclusion polls before the in-memory ledger confirms.
    pub confirm_after: u32,
    /// Members that never start.
    pub offline: Vec<u16>,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            committee_size: 4,
            tick_ms: 100,
            request_interval_ms: 500,
            confirm_after: 2,
            offline: Vec::new(),
        }
    }
}

impl DevnetConfig {
    /// Tick period as a duration.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Request generator period, if enabled.
    pub fn request_interval(&self) -> Option<Duration> {
        (self.request_interval_ms > 0).then(|| Duration::from_millis(self.request_interval_ms))
    }
}

impl NodeConfig {
    /// Loads the configuration from `path` (if it exists) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            );
        }
        let config: NodeConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("devnet.offline")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.devnet.committee_size;
        if size == 0 {
            return Err(ConfigError::Invalid("committee_size must be positive".into()));
        }
        if self.devnet.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be positive".into()));
        }
        if self.engine.stage_timeout_ms == 0 {
            return Err(ConfigError::Invalid("stage_timeout_ms must be positive".into()));
        }
        if let Some(peer) = self.devnet.offline.iter().find(|p| **p >= size) {
            return Err(ConfigError::Invalid(format!(
                "offline member {peer} is outside a committee of {size}"
            )));
        }
        Ok(())
    }

    /// Renders the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
