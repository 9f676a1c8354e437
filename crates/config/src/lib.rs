#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Configuration management for workhive
//!
//! This crate handles loading and merging configuration from:
//! - Default values (hard-coded)
//! - Configuration file (~/.config/workhive/config.toml)
//! - Environment variables

pub mod constants;
pub mod core;

pub use crate::core::{EnvironmentConfig, HubConfig, PoolConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use workhive_errors::{ConfigError, Error};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,
}

impl Config {
    /// Get the default config file path
    ///
    /// # Errors
    ///
    /// Returns an error if the system config directory cannot be determined.
    pub fn default_path() -> Result<PathBuf, Error> {
        let config_dir = dirs::config_dir().ok_or_else(|| ConfigError::NotFound {
            path: "config directory".to_string(),
        })?;
        Ok(config_dir.join("workhive").join("config.toml"))
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, contains invalid TOML,
    /// or holds values that fail validation.
    pub async fn load_from_file(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|_| ConfigError::NotFound {
                path: path.display().to_string(),
            })?;

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read
    /// or contains invalid TOML syntax.
    pub async fn load() -> Result<Self, Error> {
        let config_path = Self::default_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path).await
        } else {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration from an optional path or use default
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(config_path) => Self::load_from_file(config_path).await,
            None => Self::load().await,
        }
    }

    /// Merge with environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables contain invalid values
    /// that cannot be parsed into the expected types.
    pub fn merge_env(&mut self) -> Result<(), Error> {
        if let Some(max_size) = env_value(constants::ENV_MAX_WORKERS)? {
            self.pool.max_size = max_size;
        }

        if let Some(timeout) = env_value(constants::ENV_START_TIMEOUT_MS)? {
            self.hub.start_timeout_ms = timeout;
        }

        if let Some(timeout) = env_value(constants::ENV_KEY_TIMEOUT_MS)? {
            self.hub.key_timeout_ms = timeout;
        }

        if let Some(length) = env_value(constants::ENV_KEY_LENGTH)? {
            self.hub.key_length = length;
        }

        self.validate()
    }

    /// Check cross-field invariants
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pool.max_size < 0 {
            return Err(ConfigError::InvalidMaxSize {
                value: self.pool.max_size,
            }
            .into());
        }
        if self.hub.key_length == 0 {
            return Err(ConfigError::InvalidValue {
                field: "hub.key_length".to_string(),
                value: "0".to_string(),
            }
            .into());
        }
        if self.environment.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "environment.sweep_interval_ms".to_string(),
                value: "0".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn env_value<T: std::str::FromStr>(var: &str) -> Result<Option<T>, Error> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                ConfigError::InvalidValue {
                    field: var.to_string(),
                    value: raw,
                }
                .into()
            }),
        Err(_) => Ok(None),
    }
}
