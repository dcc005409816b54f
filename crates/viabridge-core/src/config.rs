//! Centralized Configuration Management
//!
//! All tunables of the platform live in [`BridgeConfig`]. Hosts usually load
//! it from a TOML file; tests use [`BridgeConfig::testing`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::types::ProtocolVersion;

/// Sentinel for `client_side_version`: pass the client's own version through
pub const NATIVE_VERSION: i32 = -1;
/// Sentinel for `client_side_version`: detect the server version with a probe
pub const AUTO_DETECT_VERSION: i32 = -2;

// ----------------------------------------------------------------------------
// Scheduler Configuration
// ----------------------------------------------------------------------------

/// Configuration for the worker pool and the main-context queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads in the async pool
    pub worker_threads: usize,
    /// Upper bound on blocking threads used to run synchronous work on the pool
    pub max_blocking_threads: usize,
    /// Thread name prefix for pool workers
    pub thread_name: String,
    /// Thread name for a spawned main context
    pub main_thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_blocking_threads: 64,
            thread_name: "viabridge-async".to_string(),
            main_thread_name: "viabridge-main".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Probe Configuration
// ----------------------------------------------------------------------------

/// How the server protocol version is chosen for client connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMode {
    /// Use the connecting client's own version
    Native,
    /// Always translate to this version
    Fixed(ProtocolVersion),
    /// Probe the server and use what it advertises
    AutoDetect,
}

/// Configuration for remote protocol-version detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Hard deadline for connect + handshake, in milliseconds
    pub timeout_ms: u64,
    /// How long a detected version stays fresh, in seconds
    pub cache_ttl_secs: u64,
    /// `-1` native, `-2` auto-detect, any other non-negative value is fixed
    pub client_side_version: i32,
    /// Hosts for which translation is disabled and the native version is used
    pub disabled_hosts: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            cache_ttl_secs: 30,
            client_side_version: NATIVE_VERSION,
            disabled_hosts: Vec::new(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Interpret `client_side_version`
    pub fn version_mode(&self) -> VersionMode {
        match self.client_side_version {
            AUTO_DETECT_VERSION => VersionMode::AutoDetect,
            v if v >= 0 => VersionMode::Fixed(ProtocolVersion::new(v)),
            _ => VersionMode::Native,
        }
    }

    /// Whether translation is disabled for this host (case-insensitive)
    pub fn is_host_disabled(&self, host: &str) -> bool {
        self.disabled_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }
}

// ----------------------------------------------------------------------------
// Bridge Configuration
// ----------------------------------------------------------------------------

/// Complete platform configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub scheduler: SchedulerConfig,
    pub probe: ProbeConfig,
}

impl BridgeConfig {
    /// Small pool and short probe deadline for tests
    pub fn testing() -> Self {
        Self {
            scheduler: SchedulerConfig {
                worker_threads: 2,
                max_blocking_threads: 8,
                ..SchedulerConfig::default()
            },
            probe: ProbeConfig {
                timeout_ms: 500,
                cache_ttl_secs: 30,
                ..ProbeConfig::default()
            },
        }
    }

    /// Load configuration from a TOML file; missing keys take defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to a TOML file, creating parent directories
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), toml_string)?;
        Ok(())
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.worker_threads == 0 {
            return Err(ConfigError::Validation(
                "scheduler.worker_threads must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.max_blocking_threads == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_blocking_threads must be greater than 0".to_string(),
            ));
        }
        if self.probe.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "probe.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.probe.client_side_version < AUTO_DETECT_VERSION {
            return Err(ConfigError::Validation(format!(
                "probe.client_side_version {} is not a protocol number, -1 or -2",
                self.probe.client_side_version
            )));
        }
        Ok(())
    }

    /// Look up a value by dotted key, e.g. `probe.timeout_ms`
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let value = serde_json::to_value(self).ok()?;
        let pointer = format!("/{}", key.replace('.', "/"));
        value.pointer(&pointer).cloned()
    }
}
