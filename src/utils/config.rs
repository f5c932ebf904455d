//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `INC_*` environment variables override config file values.
//! Example: `INC_WORKER_THREADS=8` overrides `worker_threads` in config,
//! `INC_SWITCH__ADDRESS=10.0.0.2:30000` sets the aggregation switch address.

use crate::utils::error::{CollectiveError, Result};
use crate::utils::logging::LogFormat;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Which compute path a process group should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Accelerator if this build has one, CPU reference otherwise.
    #[default]
    Auto,
    Cpu,
    Accelerator,
}

impl BackendChoice {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(BackendChoice::Auto),
            "cpu" | "cpu-reference" | "gloo" => Some(BackendChoice::Cpu),
            "accelerator" | "cuda" | "metal" | "webgpu" => Some(BackendChoice::Accelerator),
            _ => None,
        }
    }
}

/// In-network aggregation switch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitchConfig {
    /// UDP address of the aggregation switch
    pub address: String,

    /// How long a rank waits for all aggregated chunks to come back
    #[serde(default = "default_switch_timeout_ms")]
    pub timeout_ms: u64,

    /// Send fixed-point quantized payloads instead of raw f32
    #[serde(default)]
    pub quantize: bool,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveConfig {
    /// Compute path selection
    #[serde(default)]
    pub backend: BackendChoice,

    /// Accelerator ordinal used by the accelerator backend
    #[serde(default)]
    pub device_ordinal: usize,

    /// Worker threads of the runtime a process group owns
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// All-reduce / reduce-scatter messages below this size use recursive doubling
    #[serde(default = "default_small_message_threshold")]
    pub small_message_threshold_bytes: usize,

    /// All-gather messages at or above this size use the ring
    #[serde(default = "default_all_gather_ring_threshold")]
    pub all_gather_ring_threshold_bytes: usize,

    /// Upper bound on resident scratch memory per process group
    #[serde(default = "default_scratch_pool_max_bytes")]
    pub scratch_pool_max_bytes: usize,

    /// Timeout used by the blocking tensor API
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Connection attempts beyond the first when peers are not listening yet
    #[serde(default = "default_connect_max_retries")]
    pub connect_max_retries: u32,

    /// First backoff delay between connection attempts
    #[serde(default = "default_connect_initial_delay_ms")]
    pub connect_initial_delay_ms: u64,

    /// Optional in-network aggregation switch
    #[serde(default)]
    pub switch: Option<SwitchConfig>,

    #[serde(default)]
    pub log_format: LogFormat,
}

// Default value functions
fn default_worker_threads() -> usize { 2 }
fn default_small_message_threshold() -> usize { 32 * 1024 }
fn default_all_gather_ring_threshold() -> usize { 256 * 1024 }
fn default_scratch_pool_max_bytes() -> usize { 256 * 1024 * 1024 }
fn default_timeout_ms() -> u64 { 300_000 }
fn default_connect_max_retries() -> u32 { 10 }
fn default_connect_initial_delay_ms() -> u64 { 50 }
fn default_switch_timeout_ms() -> u64 { 5_000 }

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::default(),
            device_ordinal: 0,
            worker_threads: default_worker_threads(),
            small_message_threshold_bytes: default_small_message_threshold(),
            all_gather_ring_threshold_bytes: default_all_gather_ring_threshold(),
            scratch_pool_max_bytes: default_scratch_pool_max_bytes(),
            default_timeout_ms: default_timeout_ms(),
            connect_max_retries: default_connect_max_retries(),
            connect_initial_delay_ms: default_connect_initial_delay_ms(),
            switch: None,
            log_format: LogFormat::default(),
        }
    }
}

impl CollectiveConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CollectiveError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Environment variables are prefixed with `INC_` and use uppercase.
    /// Nested keys use double underscore: `INC_SWITCH__TIMEOUT_MS`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            let Some(config_key) = key.strip_prefix("INC_") else {
                continue;
            };
            let config_key = config_key.to_lowercase();
            let parts: Vec<&str> = config_key.split("__").collect();

            match parts.as_slice() {
                ["switch", field] => self.apply_switch_override(field, &value),
                [field] => self.apply_override(field, &value),
                _ => {
                    debug!(key = %key, "Unknown config key pattern");
                }
            }
        }
    }

    fn apply_override(&mut self, field: &str, value: &str) {
        match field {
            "backend" => if let Some(v) = BackendChoice::parse(value) { self.backend = v; }
            "device_ordinal" => if let Ok(v) = value.parse() { self.device_ordinal = v; }
            "worker_threads" => if let Ok(v) = value.parse() { self.worker_threads = v; }
            "small_message_threshold_bytes" => {
                if let Ok(v) = value.parse() { self.small_message_threshold_bytes = v; }
            }
            "all_gather_ring_threshold_bytes" => {
                if let Ok(v) = value.parse() { self.all_gather_ring_threshold_bytes = v; }
            }
            "scratch_pool_max_bytes" => if let Ok(v) = value.parse() { self.scratch_pool_max_bytes = v; }
            "default_timeout_ms" => if let Ok(v) = value.parse() { self.default_timeout_ms = v; }
            "connect_max_retries" => if let Ok(v) = value.parse() { self.connect_max_retries = v; }
            "connect_initial_delay_ms" => if let Ok(v) = value.parse() { self.connect_initial_delay_ms = v; }
            "log_format" => self.log_format = LogFormat::parse(value),
            _ => {}
        }
    }

    fn apply_switch_override(&mut self, field: &str, value: &str) {
        let switch = self.switch.get_or_insert_with(|| SwitchConfig {
            address: String::new(),
            timeout_ms: default_switch_timeout_ms(),
            quantize: false,
        });
        match field {
            "address" => switch.address = value.to_string(),
            "timeout_ms" => if let Ok(v) = value.parse() { switch.timeout_ms = v; }
            "quantize" => switch.quantize = value.to_lowercase() == "true" || value == "1",
            _ => {}
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(CollectiveError::Config("worker_threads must be >= 1".to_string()));
        }
        if self.scratch_pool_max_bytes == 0 {
            return Err(CollectiveError::Config(
                "scratch_pool_max_bytes must be > 0".to_string(),
            ));
        }
        if let Some(switch) = &self.switch {
            if switch.address.parse::<std::net::SocketAddr>().is_err() {
                return Err(CollectiveError::Config(format!(
                    "switch address '{}' is not a socket address",
                    switch.address
                )));
            }
            if switch.timeout_ms == 0 {
                return Err(CollectiveError::Config("switch timeout_ms must be > 0".to_string()));
            }
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CollectiveError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}
