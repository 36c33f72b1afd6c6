//! Configuration management for Floodgate.
//!
//! Settings come from three layers, lowest priority first: serde defaults, an
//! optional YAML file, and `FLOODGATE__*` environment variables
//! (e.g. `FLOODGATE__STORE__URL`). CLI flags in `main` override the result.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::filter::FailurePolicy;
use crate::ratelimit::LogTrim;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9005))
}

/// Which shared store implementation to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis-compatible server shared by every instance
    #[default]
    Redis,
    /// Process-local store, for single-instance runs
    Memory,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Deadline applied to every store command, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_command_timeout() -> u64 {
    100
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the rule file loaded at startup
    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,

    /// What to do when the rule or the counters cannot be evaluated
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// How the sliding log discards aged entries
    #[serde(default)]
    pub sliding_log_trim: LogTrim,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: default_rules_path(),
            failure_policy: FailurePolicy::default(),
            sliding_log_trim: LogTrim::default(),
        }
    }
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("rules/rules.yaml")
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))
    }

    /// Build the layered configuration: defaults, then the optional file,
    /// then `FLOODGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| FloodgateError::Config(e.to_string()))
    }
}
