//! Configuration management for pixpipe.
//!
//! Configuration is loaded from a TOML file with sensible defaults; every
//! section implements `Default` so a partial file is valid.

mod types;
mod validate;

pub use types::*;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure for pixpipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Named executor sizes
    pub executors: ExecutorsConfig,

    /// Memory cache budgets
    pub memory_cache: MemoryCacheConfig,

    /// Disk cache partitions
    pub disk_cache: DiskCacheConfig,

    /// Decode settings
    pub decode: DecodeConfig,

    /// Network settings
    pub network: NetworkConfig,

    /// Throttling settings
    pub throttling: ThrottlingConfig,

    /// Transform settings
    pub transform: TransformConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// Uses platform-appropriate directories:
    /// - macOS: ~/Library/Application Support/com.pixpipe.pixpipe/config.toml
    /// - Linux: ~/.config/pixpipe/config.toml
    /// - Windows: C:\Users\<User>\AppData\Roaming\pixpipe\config\config.toml
    ///
    /// Falls back to ~/.pixpipe/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "pixpipe", "pixpipe")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".pixpipe").join("config.toml")
            })
    }

    /// Get the resolved cache root (with ~ expansion).
    pub fn cache_dir(&self) -> PathBuf {
        expand(&self.general.cache_dir)
    }

    /// Resolved `asset://` root.
    pub fn assets_dir(&self) -> PathBuf {
        expand(&self.general.assets_dir)
    }

    /// Resolved `content://` root.
    pub fn content_dir(&self) -> PathBuf {
        expand(&self.general.content_dir)
    }

    /// Directory of the main disk cache partition.
    pub fn main_disk_cache_dir(&self) -> PathBuf {
        self.cache_dir().join(&self.disk_cache.main_dir)
    }

    /// Directory of the small-image disk cache partition.
    pub fn small_disk_cache_dir(&self) -> PathBuf {
        self.cache_dir().join(&self.disk_cache.small_dir)
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

fn expand(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&path_str).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.throttling.max_simultaneous_local, 5);
        assert_eq!(config.disk_cache.small_image_threshold_px, 256);
        assert!(config.decode.progressive_enabled);
    }

    #[test]
    fn test_config_to_toml() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[disk_cache]"));
        assert!(toml.contains("[throttling]"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[throttling]\nmax_simultaneous_local = 2\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.throttling.max_simultaneous_local, 2);
        assert_eq!(config.transform.jpeg_quality, 85);
    }

    #[test]
    fn test_disk_cache_dirs_share_root() {
        let mut config = Config::default();
        config.general.cache_dir = PathBuf::from("/tmp/pixpipe");
        assert_eq!(
            config.main_disk_cache_dir(),
            PathBuf::from("/tmp/pixpipe/images")
        );
        assert_eq!(
            config.small_disk_cache_dir(),
            PathBuf::from("/tmp/pixpipe/thumbnails")
        );
    }
}
