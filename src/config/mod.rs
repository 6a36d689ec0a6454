//! Layered configuration for the sync node: compiled defaults, overridden by
//! an optional TOML file, overridden in turn by `SWARMSYNC_*` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Quick compares (size, mtime); deep additionally hashes file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescanMode {
    QuickTimestampOnly,
    DeepWithHash,
}

impl Default for RescanMode {
    fn default() -> Self {
        RescanMode::QuickTimestampOnly
    }
}

impl std::str::FromStr for RescanMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QuickTimestampOnly" | "quick_timestamp_only" | "quick" => {
                Ok(RescanMode::QuickTimestampOnly)
            }
            "DeepWithHash" | "deep_with_hash" | "deep" => Ok(RescanMode::DeepWithHash),
            other => Err(Error::Configuration(format!(
                "invalid rescan mode: {other}"
            ))),
        }
    }
}

/// Fully-parsed configuration for a single sync node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncNodeConfig {
    pub sync_folder_path: PathBuf,
    pub local_id: String,
    pub device_name: String,
    pub trusted_peer_public_keys: HashMap<String, String>,
    pub rescan_interval_minutes: u64,
    pub rescan_mode: RescanMode,

    pub max_parallel_connections: usize,
    pub connection_timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub default_buffer_size: usize,
    pub max_buffer_size: usize,
    pub min_buffer_size: usize,
    pub fast_lan_rtt_ms: i32,
    pub slow_link_rtt_ms: i32,
    pub file_stream_buffer_size: usize,
}

impl Default for SyncNodeConfig {
    fn default() -> Self {
        Self {
            sync_folder_path: PathBuf::from("."),
            local_id: String::new(),
            device_name: "swarmsync-node".to_string(),
            trusted_peer_public_keys: HashMap::new(),
            rescan_interval_minutes: 5,
            rescan_mode: RescanMode::QuickTimestampOnly,

            max_parallel_connections: 4,
            connection_timeout_ms: 10_000,
            max_retry_attempts: 3,
            retry_base_delay_ms: 500,
            default_buffer_size: 64 * 1024,
            max_buffer_size: 1024 * 1024,
            min_buffer_size: 8 * 1024,
            fast_lan_rtt_ms: 2,
            slow_link_rtt_ms: 150,
            file_stream_buffer_size: 80 * 1024,
        }
    }
}

/// On-disk representation of the optional TOML file; every field optional so a
/// partial file only overrides what it mentions.
#[derive(Debug, Default, Deserialize)]
struct FileOverlay {
    sync_folder_path: Option<PathBuf>,
    local_id: Option<String>,
    device_name: Option<String>,
    trusted_peer_public_keys: Option<HashMap<String, String>>,
    rescan_interval_minutes: Option<u64>,
    rescan_mode: Option<String>,
    max_parallel_connections: Option<usize>,
    connection_timeout_ms: Option<u64>,
    max_retry_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
}

const ENV_PREFIX: &str = "SWARMSYNC_";

impl SyncNodeConfig {
    /// Load defaults, then an optional TOML file, then environment overrides.
    ///
    /// A missing file is not an error. A malformed file, or an out-of-range
    /// value at any layer, fails the load instead of being swallowed, since a
    /// misconfigured `trusted_peer_public_keys` would silently weaken security.
    pub fn load(file_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = file_path {
            if path.exists() {
                let contents = fs::read_to_string(path)
                    .map_err(|e| Error::Configuration(format!("reading {path:?}: {e}")))?;
                let overlay: FileOverlay = toml::from_str(&contents)
                    .map_err(|e| Error::Configuration(format!("parsing {path:?}: {e}")))?;
                config.apply_file_overlay(overlay)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file_overlay(&mut self, overlay: FileOverlay) -> Result<()> {
        if let Some(v) = overlay.sync_folder_path {
            self.sync_folder_path = v;
        }
        if let Some(v) = overlay.local_id {
            self.local_id = v;
        }
        if let Some(v) = overlay.device_name {
            self.device_name = v;
        }
        if let Some(v) = overlay.trusted_peer_public_keys {
            self.trusted_peer_public_keys = v;
        }
        if let Some(v) = overlay.rescan_interval_minutes {
            self.rescan_interval_minutes = v;
        }
        if let Some(v) = overlay.rescan_mode {
            self.rescan_mode = v.parse()?;
        }
        if let Some(v) = overlay.max_parallel_connections {
            self.max_parallel_connections = v;
        }
        if let Some(v) = overlay.connection_timeout_ms {
            self.connection_timeout_ms = v;
        }
        if let Some(v) = overlay.max_retry_attempts {
            self.max_retry_attempts = v;
        }
        if let Some(v) = overlay.retry_base_delay_ms {
            self.retry_base_delay_ms = v;
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_var("SYNC_FOLDER_PATH") {
            self.sync_folder_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("LOCAL_ID") {
            self.local_id = v;
        }
        if let Some(v) = env_var("DEVICE_NAME") {
            self.device_name = v;
        }
        if let Some(v) = env_var("RESCAN_INTERVAL_MINUTES") {
            self.rescan_interval_minutes = parse_env("RESCAN_INTERVAL_MINUTES", &v)?;
        }
        if let Some(v) = env_var("RESCAN_MODE") {
            self.rescan_mode = v.parse()?;
        }
        if let Some(v) = env_var("MAX_PARALLEL_CONNECTIONS") {
            self.max_parallel_connections = parse_env("MAX_PARALLEL_CONNECTIONS", &v)?;
        }
        if let Some(v) = env_var("CONNECTION_TIMEOUT_MS") {
            self.connection_timeout_ms = parse_env("CONNECTION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = env_var("MAX_RETRY_ATTEMPTS") {
            self.max_retry_attempts = parse_env("MAX_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = env_var("RETRY_BASE_DELAY_MS") {
            self.retry_base_delay_ms = parse_env("RETRY_BASE_DELAY_MS", &v)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel_connections == 0 {
            return Err(Error::Configuration(
                "max_parallel_connections must be at least 1".into(),
            ));
        }
        if self.min_buffer_size > self.default_buffer_size
            || self.default_buffer_size > self.max_buffer_size
        {
            return Err(Error::Configuration(
                "buffer sizes must satisfy min <= default <= max".into(),
            ));
        }
        if self.fast_lan_rtt_ms < 0 || self.slow_link_rtt_ms < self.fast_lan_rtt_ms {
            return Err(Error::Configuration(
                "rtt thresholds must be non-negative and ordered".into(),
            ));
        }
        if self.file_stream_buffer_size == 0 {
            return Err(Error::Configuration(
                "file_stream_buffer_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_var(suffix: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn parse_env<T: std::str::FromStr>(suffix: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Configuration(format!("{ENV_PREFIX}{suffix} must be numeric: {raw}")))
}
