//! Controller Configuration
//!
//! Manages all tunables of the permission core:
//! - Cache eviction thresholds and the low-memory device class
//! - Background pool sizing
//! - Polling interval for signals without change notifications
//! - Auto-revoke policy

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use directories::ProjectDirs;
use tracing::{info, debug};

use crate::error::{PermctlError, Result};

/// Cache eviction configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Inactivity needed before eviction under lax pressure, in seconds
    pub lax_threshold_secs: u64,
    /// Inactivity needed before eviction under tight pressure, in seconds
    pub tight_threshold_secs: u64,
    /// Low-memory devices evict every inactive entry on any pressure signal
    pub low_memory_device: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lax_threshold_secs: 5 * 60,
            tight_threshold_secs: 60,
            low_memory_device: false,
        }
    }
}

impl CacheConfig {
    pub fn lax_threshold(&self) -> Duration {
        Duration::from_secs(self.lax_threshold_secs)
    }

    pub fn tight_threshold(&self) -> Duration {
        Duration::from_secs(self.tight_threshold_secs)
    }
}

/// Background pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Number of worker threads
    pub worker_threads: usize,
    /// Maximum number of blocking threads used for OS queries
    pub max_blocking_threads: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().clamp(1, 4),
            max_blocking_threads: 16,
        }
    }
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    /// Refresh interval in milliseconds while a polled node is observed
    pub interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Auto-revoke configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutoRevokeConfig {
    /// Global auto-revoke switch
    pub enabled: bool,
    /// Days without use before an app's permissions are revoked
    pub unused_threshold_days: u32,
    /// Apps targeting at least this SDK are auto-revoked by default
    pub min_target_sdk: u32,
}

impl Default for AutoRevokeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unused_threshold_days: 90,
            min_target_sdk: 30,
        }
    }
}

/// Main controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Cache settings
    pub cache: CacheConfig,
    /// Background pool settings
    pub background: BackgroundConfig,
    /// Polling settings
    pub poll: PollConfig,
    /// Auto-revoke settings
    pub auto_revoke: AutoRevokeConfig,
}

impl ControllerConfig {
    /// Get the configuration directory path
    pub fn config_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "permctl", "permctl")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the configuration file path
    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load configuration from the default location, writing defaults if absent
    pub async fn load() -> Result<Self> {
        let config_file = Self::config_file()
            .ok_or_else(|| PermctlError::Config("Cannot determine config path".into()))?;

        if config_file.exists() {
            Self::load_from(&config_file).await
        } else {
            info!("Config file not found, using defaults");
            let config = ControllerConfig::default();
            config.save_to(&config_file).await?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub async fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let contents = tokio::fs::read_to_string(path).await?;
        let config: ControllerConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub async fn save(&self) -> Result<()> {
        let config_file = Self::config_file()
            .ok_or_else(|| PermctlError::Config("Cannot determine config path".into()))?;
        self.save_to(&config_file).await
    }

    /// Save configuration to a specific file
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;

        debug!("Config saved to {:?}", path);
        Ok(())
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.tight_threshold_secs > self.cache.lax_threshold_secs {
            return Err(PermctlError::Config(format!(
                "tight threshold ({}s) exceeds lax threshold ({}s)",
                self.cache.tight_threshold_secs, self.cache.lax_threshold_secs
            )));
        }
        if self.background.worker_threads == 0 {
            return Err(PermctlError::Config("worker_threads must be at least 1".into()));
        }
        Ok(())
    }
}
