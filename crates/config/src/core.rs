//! Per-component configuration sections

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_CANCEL_ACK_TIMEOUT_MS, DEFAULT_EXIT_CHECK_INTERVAL_MS, DEFAULT_KEY_LENGTH,
    DEFAULT_KEY_TIMEOUT_MS, DEFAULT_MAX_FRAME_LENGTH, DEFAULT_MAX_WORKERS,
    DEFAULT_START_TIMEOUT_MS, DEFAULT_SWEEP_INTERVAL_MS,
};

/// Rendezvous hub configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// How long `accept` waits for a spawned worker to connect back
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    /// How long a fresh connection has to present its key
    #[serde(default = "default_key_timeout_ms")]
    pub key_timeout_ms: u64,
    /// Length in bytes of generated rendezvous keys
    #[serde(default = "default_key_length")]
    pub key_length: usize,
    /// Poll period for thread-exit tracking
    #[serde(default = "default_exit_check_interval_ms")]
    pub exit_check_interval_ms: u64,
    /// Largest frame accepted on a channel
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

impl HubConfig {
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    #[must_use]
    pub fn key_timeout(&self) -> Duration {
        Duration::from_millis(self.key_timeout_ms)
    }

    #[must_use]
    pub fn exit_check_interval(&self) -> Duration {
        Duration::from_millis(self.exit_check_interval_ms)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            key_timeout_ms: DEFAULT_KEY_TIMEOUT_MS,
            key_length: DEFAULT_KEY_LENGTH,
            exit_check_interval_ms: DEFAULT_EXIT_CHECK_INTERVAL_MS,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on live workers; signed so a bad value can be reported
    #[serde(default = "default_max_workers")]
    pub max_size: i64,
    /// How long a cancelled task may run remotely before its worker is killed
    #[serde(default = "default_cancel_ack_timeout_ms")]
    pub cancel_ack_timeout_ms: u64,
}

impl PoolConfig {
    #[must_use]
    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_WORKERS,
            cancel_ack_timeout_ms: DEFAULT_CANCEL_ACK_TIMEOUT_MS,
        }
    }
}

/// Worker-local environment configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl EnvironmentConfig {
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

// Default value functions for serde
fn default_start_timeout_ms() -> u64 {
    DEFAULT_START_TIMEOUT_MS
}

fn default_key_timeout_ms() -> u64 {
    DEFAULT_KEY_TIMEOUT_MS
}

fn default_key_length() -> usize {
    DEFAULT_KEY_LENGTH
}

fn default_exit_check_interval_ms() -> u64 {
    DEFAULT_EXIT_CHECK_INTERVAL_MS
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

fn default_max_workers() -> i64 {
    DEFAULT_MAX_WORKERS
}

fn default_cancel_ack_timeout_ms() -> u64 {
    DEFAULT_CANCEL_ACK_TIMEOUT_MS
}

fn default_sweep_interval_ms() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}
