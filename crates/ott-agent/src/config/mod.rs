// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! Configuration sources are applied in the following order (later sources override earlier):
//!
//! 1. **Defaults** - Hard-coded defaults in [`Config::default`]
//! 2. **YAML file** - `ott-agent.yaml` (if present)
//! 3. **Environment variables** - `OTT_*` variables (highest priority)
//!
//! A source that cannot be parsed is logged and skipped. A source that parses but carries an
//! invalid value (for example an unknown transport mode) is a configuration fault, as is a
//! missing `api_key` or `server_url` after all sources were applied.

pub mod env;
pub mod log_level;
pub mod yaml;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, error};

use crate::config::{env::EnvConfigSource, log_level::LogLevel, yaml::YamlConfigSource};

pub const DEFAULT_CONFIG_FILE: &str = "ott-agent.yaml";
pub const DEFAULT_QUEUE_DIR_NAME: &str = "ott_agent_queue";

/// Merge `Option<T>` fields of a partial config into `T` fields when the value is `Some`.
#[macro_export]
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("{0} is required")]
    MissingField(String),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

/// Delivery strategy, fixed for the lifetime of an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Send immediately, queue on transient failure.
    #[default]
    Sync,
    /// Buffer in memory, send once at the end of the unit of work.
    Async,
    /// Always persist; delivered by an explicit or periodic flush.
    Disk,
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sync" => Ok(TransportMode::Sync),
            "async" => Ok(TransportMode::Async),
            "disk" => Ok(TransportMode::Disk),
            other => Err(ConfigError::InvalidValue {
                field: "transport".to_string(),
                reason: format!("'{other}' is not one of sync, async, disk"),
            }),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportMode::Sync => "sync",
            TransportMode::Async => "async",
            TransportMode::Disk => "disk",
        };
        f.write_str(s)
    }
}

/// How much of an incoming request body is captured into the event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MaxRequestBodySize {
    None,
    /// Up to 1 KiB.
    Small,
    /// Up to 10 KiB.
    #[default]
    Medium,
    Large,
}

impl MaxRequestBodySize {
    /// Largest body captured verbatim; `None` means unbounded.
    #[must_use]
    pub fn limit(self) -> Option<usize> {
        match self {
            MaxRequestBodySize::None => Some(0),
            MaxRequestBodySize::Small => Some(1024),
            MaxRequestBodySize::Medium => Some(10 * 1024),
            MaxRequestBodySize::Large => None,
        }
    }
}

impl FromStr for MaxRequestBodySize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(MaxRequestBodySize::None),
            "small" => Ok(MaxRequestBodySize::Small),
            "medium" => Ok(MaxRequestBodySize::Medium),
            "large" => Ok(MaxRequestBodySize::Large),
            other => Err(ConfigError::InvalidValue {
                field: "max_request_body_size".to_string(),
                reason: format!("'{other}' is not one of none, small, medium, large"),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProfileMode {
    #[default]
    Wall,
    Cpu,
}

impl ProfileMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileMode::Wall => "wall",
            ProfileMode::Cpu => "cpu",
        }
    }
}

impl FromStr for ProfileMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wall" => Ok(ProfileMode::Wall),
            "cpu" => Ok(ProfileMode::Cpu),
            other => Err(ConfigError::InvalidValue {
                field: "profile_mode".to_string(),
                reason: format!("'{other}' is not one of wall, cpu"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_key: String,
    pub server_url: String,
    pub environment: String,
    pub release: String,
    /// Overrides the detected hostname in `server_name`.
    pub server_name: Option<String>,
    /// Network timeout for connect, write and read, in seconds.
    pub timeout: u64,
    /// Gzip level 1-9, 0 disables compression.
    pub compressed: u32,
    pub transport: TransportMode,
    pub disk_queue_dir: PathBuf,
    /// Queued items older than this many seconds are purged unsent.
    pub queue_max_age: u64,
    /// Byte budget for the disk queue (payloads and sidecars).
    pub queue_max_size: u64,
    pub queue_backoff_base_ms: u64,
    pub queue_backoff_max_ms: u64,
    pub sample_rate: f64,
    /// Minimum request duration in milliseconds, 0 admits everything.
    pub slow_request: f64,
    /// Peak memory threshold in bytes.
    pub high_memory_detected: u64,
    pub max_request_body_size: MaxRequestBodySize,
    pub capture_panics: bool,
    pub profile: bool,
    pub profile_mode: ProfileMode,
    /// Sampling period handed to the host profiler, in seconds.
    pub profile_sample_rate: f64,
    pub profile_max_stack_depth: usize,
    /// Samples past this many seconds are not encoded.
    pub profile_max_duration: f64,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::default(),
            server_url: String::default(),
            environment: "production".to_string(),
            release: String::default(),
            server_name: None,
            timeout: 5,
            compressed: 6,
            transport: TransportMode::default(),
            disk_queue_dir: std::env::temp_dir().join(DEFAULT_QUEUE_DIR_NAME),
            queue_max_age: 86_400,
            queue_max_size: 100 * 1024 * 1024,
            queue_backoff_base_ms: 1_000,
            queue_backoff_max_ms: 300_000,
            sample_rate: 0.5,
            slow_request: 0.0,
            high_memory_detected: 128 * 1024 * 1024,
            max_request_body_size: MaxRequestBodySize::default(),
            capture_panics: true,
            profile: false,
            profile_mode: ProfileMode::default(),
            profile_sample_rate: 0.01,
            profile_max_stack_depth: 128,
            profile_max_duration: 20.0,
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Checks the invariants the pipeline relies on. A half-configured agent must not run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingField("api_key".to_string()));
        }
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::MissingField("server_url".to_string()));
        }
        if self.compressed > 9 {
            return Err(ConfigError::InvalidValue {
                field: "compressed".to_string(),
                reason: format!("gzip level must be between 0 and 9, got {}", self.compressed),
            });
        }
        if self.timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeout".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if !self.sample_rate.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "sample_rate".to_string(),
                reason: "must be a finite number".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    #[must_use]
    pub fn queue_max_age_duration(&self) -> Duration {
        Duration::from_secs(self.queue_max_age)
    }
}

/// Fields every source may set. Shared by the YAML and environment sources so both accept the
/// same keys.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub api_key: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub server_url: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub environment: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub release: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub server_name: Option<String>,
    pub timeout: Option<u64>,
    pub compressed: Option<u32>,
    pub transport: Option<String>,
    pub disk_queue_dir: Option<PathBuf>,
    pub queue_max_age: Option<u64>,
    pub queue_max_size: Option<u64>,
    pub queue_backoff_base_ms: Option<u64>,
    pub queue_backoff_max_ms: Option<u64>,
    pub sample_rate: Option<f64>,
    pub slow_request: Option<f64>,
    pub high_memory_detected: Option<u64>,
    pub max_request_body_size: Option<String>,
    pub capture_panics: Option<bool>,
    pub profile: Option<bool>,
    pub profile_mode: Option<String>,
    pub profile_sample_rate: Option<f64>,
    pub profile_max_stack_depth: Option<usize>,
    pub profile_max_duration: Option<f64>,
    pub log_level: Option<LogLevel>,
    /// Shorthand for `log_level: debug`.
    pub debug: Option<bool>,
}

/// Applies a parsed partial config on top of `config`.
pub(crate) fn merge_config(config: &mut Config, partial: &PartialConfig) -> Result<(), ConfigError> {
    merge_option_to_value!(config, partial, api_key);
    merge_option_to_value!(config, partial, server_url);
    merge_option_to_value!(config, partial, environment);
    merge_option_to_value!(config, partial, release);
    if partial.server_name.is_some() {
        config.server_name.clone_from(&partial.server_name);
    }
    merge_option_to_value!(config, partial, timeout);
    merge_option_to_value!(config, partial, compressed);
    merge_option_to_value!(config, partial, disk_queue_dir);
    merge_option_to_value!(config, partial, queue_max_age);
    merge_option_to_value!(config, partial, queue_max_size);
    merge_option_to_value!(config, partial, queue_backoff_base_ms);
    merge_option_to_value!(config, partial, queue_backoff_max_ms);
    merge_option_to_value!(config, partial, sample_rate);
    merge_option_to_value!(config, partial, slow_request);
    merge_option_to_value!(config, partial, high_memory_detected);
    merge_option_to_value!(config, partial, capture_panics);
    merge_option_to_value!(config, partial, profile);
    merge_option_to_value!(config, partial, profile_sample_rate);
    merge_option_to_value!(config, partial, profile_max_stack_depth);
    merge_option_to_value!(config, partial, profile_max_duration);
    merge_option_to_value!(config, partial, log_level);

    // Not using the macro here because these need parsing
    if let Some(transport) = &partial.transport {
        config.transport = transport.parse()?;
    }
    if let Some(size) = &partial.max_request_body_size {
        config.max_request_body_size = size.parse()?;
    }
    if let Some(mode) = &partial.profile_mode {
        config.profile_mode = mode.parse()?;
    }
    if partial.debug == Some(true) && partial.log_level.is_none() {
        config.log_level = LogLevel::Debug;
    }
    Ok(())
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            sources: Vec::new(),
            config,
        }
    }

    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Loads every source in order and validates the result.
    ///
    /// Parse failures are logged and the source is skipped. Invalid values and a missing
    /// credential or endpoint are returned as errors.
    pub fn build(self) -> Result<Config, ConfigError> {
        let ConfigBuilder {
            sources,
            mut config,
        } = self;
        let mut failed_sources = 0;
        for source in &sources {
            match source.load(&mut config) {
                Ok(()) => (),
                Err(ConfigError::ParseError(e)) => {
                    error!("Failed to load config: {e}");
                    failed_sources += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if !sources.is_empty() && failed_sources == sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        config.validate()?;
        Ok(config)
    }
}

/// Loads `ott-agent.yaml` from `config_directory` (when given) and then the environment.
#[allow(clippy::module_name_repetitions)]
pub fn get_config(config_directory: Option<&Path>) -> Result<Config, ConfigError> {
    let mut builder = ConfigBuilder::default();
    if let Some(dir) = config_directory {
        builder = builder.add_source(Box::new(YamlConfigSource {
            path: dir.join(DEFAULT_CONFIG_FILE),
        }));
    }
    builder.add_source(Box::new(EnvConfigSource)).build()
}

pub fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                Ok(Some(s.trim().to_string()))
            }
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => {
            error!("Failed to parse value, expected a string or an integer, ignoring");
            Ok(None)
        }
    }
}
