//! Configuration for the caching filesystem
//!
//! TOML files with sensible defaults; every section and field may be
//! omitted. Loaded from the per-user config directory unless a path is
//! given explicitly.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::FsError;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache behavior settings.
    pub cache: CacheConfig,
    /// Write-back and reconnection settings.
    pub sync: SyncConfig,
}

/// Cache behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enforce permission checks on walks and reads.
    pub perms: bool,
    /// Allow automatic reconnection when the remote supports it.
    pub redial: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            perms: true,
            redial: true,
        }
    }
}

/// Write-back and reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Push every mutation to the remote before returning.
    pub write_through: bool,
    /// Minimum seconds between background syncs.
    pub sync_interval_secs: u64,
    /// Seconds between reconnection attempts while the remote is down.
    pub redial_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_through: false,
            sync_interval_secs: 60,
            redial_interval_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from the default path, falling back to
    /// defaults when missing or unreadable.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("no config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, FsError> {
        if !path.exists() {
            debug!("config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| FsError::Io(path.display().to_string(), e.to_string()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| FsError::BadCtl(format!("{}: {}", path.display(), e)))?;
        info!("loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), FsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FsError::Io(path.display().to_string(), e.to_string()))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FsError::BadCtl(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| FsError::Io(path.display().to_string(), e.to_string()))?;
        info!("saved config to {:?}", path);
        Ok(())
    }

    /// Default config file path for this user.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "zxc", "zxc").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// A sample configuration file.
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}
