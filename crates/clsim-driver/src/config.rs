//! Driver configuration file format.
//!
//! Loads [`DriverConfig`] from a TOML file (`clsim.toml`) with environment
//! variable overrides via `CLSIM_*` prefixed variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Number of work-group ids the waiting queue can hold.
pub const DEFAULT_WORK_GROUP_BUFFER_SIZE: usize = 16;

/// Size of the buffer used to read kernel names out of guest memory.
pub const DEFAULT_MAX_STRING_SIZE: usize = 1024;

/// Driver configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Capacity of the waiting work-group queue.
    /// Override: `CLSIM_WORK_GROUP_BUFFER_SIZE`
    pub work_group_buffer_size: usize,

    /// Run the GPU sharing the guest address space. Not supported; taking
    /// any fused code path is fatal.
    /// Override: `CLSIM_FUSED_DEVICE`
    pub fused_device: bool,

    /// Maximum kernel-name length read from guest memory, NUL included.
    /// Override: `CLSIM_MAX_STRING_SIZE`
    pub max_string_size: usize,

    /// Record a trace entry for every ABI call.
    /// Override: `CLSIM_TRACE_CALLS`
    pub trace_calls: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            work_group_buffer_size: DEFAULT_WORK_GROUP_BUFFER_SIZE,
            fused_device: false,
            max_string_size: DEFAULT_MAX_STRING_SIZE,
            trace_calls: false,
        }
    }
}

/// Errors that can occur when loading or validating a [`DriverConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

impl DriverConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: DriverConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_group_buffer_size == 0 {
            return Err(ConfigError::Validation("work_group_buffer_size must be > 0".into()));
        }
        if self.work_group_buffer_size > 1024 {
            return Err(ConfigError::Validation(format!(
                "work_group_buffer_size must be <= 1024, got {}",
                self.work_group_buffer_size
            )));
        }
        if self.max_string_size < 2 {
            return Err(ConfigError::Validation(format!(
                "max_string_size must be >= 2, got {}",
                self.max_string_size
            )));
        }
        Ok(())
    }

    /// Apply `CLSIM_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("CLSIM_WORK_GROUP_BUFFER_SIZE") {
            self.work_group_buffer_size = parse_usize("CLSIM_WORK_GROUP_BUFFER_SIZE", &val)?;
        }

        if let Ok(val) = std::env::var("CLSIM_FUSED_DEVICE") {
            self.fused_device = parse_flag("CLSIM_FUSED_DEVICE", &val)?;
        }

        if let Ok(val) = std::env::var("CLSIM_MAX_STRING_SIZE") {
            self.max_string_size = parse_usize("CLSIM_MAX_STRING_SIZE", &val)?;
        }

        if let Ok(val) = std::env::var("CLSIM_TRACE_CALLS") {
            self.trace_calls = parse_flag("CLSIM_TRACE_CALLS", &val)?;
        }

        Ok(())
    }
}

fn parse_usize(key: &str, val: &str) -> Result<usize, ConfigError> {
    val.parse::<usize>().map_err(|e| ConfigError::EnvOverride {
        key: key.into(),
        value: val.into(),
        reason: e.to_string(),
    })
}

fn parse_flag(key: &str, val: &str) -> Result<bool, ConfigError> {
    match val.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::EnvOverride {
            key: key.into(),
            value: val.into(),
            reason: "expected a boolean".into(),
        }),
    }
}
