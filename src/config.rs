//! Configuration management for ratewarden.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{RatewardenError, Result};
use crate::policy::{Policy, PolicySet};

/// Prefix for environment overrides, e.g. `RATEWARDEN__RATE_LIMIT__ENABLED`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewardenConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Redis connection, used when `rate_limit.repository` is `redis`
    #[serde(default)]
    pub redis: RedisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where rate state is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repository {
    /// Whole rates in process memory
    #[default]
    InMemory,
    /// Fixed-window counters in process memory
    Counter,
    /// Fixed-window counters in Redis
    Redis,
    /// Token buckets in process memory
    Bucket,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Master switch; nothing is limited while false
    #[serde(default)]
    pub enabled: bool,

    /// Trust the forwarded-for header for the client address
    #[serde(default)]
    pub behind_proxy: bool,

    /// First segment of every counting key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub repository: Repository,

    /// Policies for routes without an override
    #[serde(default)]
    pub default_policies: Vec<Policy>,

    /// Route id to policies
    #[serde(default)]
    pub policies: HashMap<String, Vec<Policy>>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            behind_proxy: false,
            key_prefix: default_key_prefix(),
            repository: Repository::default(),
            default_policies: Vec::new(),
            policies: HashMap::new(),
        }
    }
}

fn default_key_prefix() -> String {
    "rate-limit-application".to_string()
}

impl RateLimitSettings {
    /// The configured policies as a [`PolicySet`].
    pub fn policy_set(&self) -> PolicySet {
        PolicySet {
            default_policies: self.default_policies.clone(),
            policies: self.policies.clone(),
        }
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatewardenConfig {
    /// Load configuration from a file, with environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| RatewardenError::Config(e.to_string()))?;

        let config: RatewardenConfig = settings
            .try_deserialize()
            .map_err(|e| RatewardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: RatewardenConfig = serde_yaml::from_str(contents)
            .map_err(|e| RatewardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.key_prefix.is_empty() {
            return Err(RatewardenError::Config(
                "rate_limit.key_prefix must not be empty".to_string(),
            ));
        }
        if self.rate_limit.repository == Repository::Redis && self.redis.url.is_empty() {
            return Err(RatewardenError::Config(
                "redis.url is required for the redis repository".to_string(),
            ));
        }
        self.rate_limit.policy_set().validate()
    }
}
