//! Built-in defaults and the environment variables that override them

pub const DEFAULT_START_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_KEY_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_KEY_LENGTH: usize = 32;
pub const DEFAULT_EXIT_CHECK_INTERVAL_MS: u64 = 250;
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub const DEFAULT_MAX_WORKERS: i64 = 32;
pub const DEFAULT_CANCEL_ACK_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

pub const ENV_MAX_WORKERS: &str = "WORKHIVE_MAX_WORKERS";
pub const ENV_START_TIMEOUT_MS: &str = "WORKHIVE_START_TIMEOUT_MS";
pub const ENV_KEY_TIMEOUT_MS: &str = "WORKHIVE_KEY_TIMEOUT_MS";
pub const ENV_KEY_LENGTH: &str = "WORKHIVE_KEY_LENGTH";

/// Handed to spawned workers so they can find the hub
pub const ENV_HUB_URI: &str = "WORKHIVE_HUB_URI";
/// Hex-encoded single-use key presented during the handshake
pub const ENV_HUB_KEY: &str = "WORKHIVE_HUB_KEY";
