//! Sub-configuration structs with their defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Root directory for on-disk caches
    pub cache_dir: PathBuf,
    /// Directory served as the `asset://` tree
    pub assets_dir: PathBuf,
    /// Directory whose subdirectories are `content://` authorities
    pub content_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("~/.pixpipe/cache"),
            assets_dir: PathBuf::from("~/.pixpipe/assets"),
            content_dir: PathBuf::from("~/.pixpipe/content"),
        }
    }
}

/// Thread budget of each named executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorsConfig {
    /// Concurrent decode jobs (CPU bound)
    pub decode_threads: usize,

    /// Concurrent local storage reads
    pub local_read_threads: usize,

    /// Concurrent background jobs (hand-off, postprocessing)
    pub background_threads: usize,

    /// Concurrent resize/rotate/transcode jobs
    pub transform_threads: usize,
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            decode_threads: cpus,
            local_read_threads: 2,
            background_threads: cpus,
            transform_threads: cpus,
        }
    }
}

/// Memory cache budgets for the decoded and encoded tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Maximum decoded images kept in memory
    pub bitmap_max_entries: usize,

    /// Maximum decoded image bytes kept in memory
    pub bitmap_max_bytes: usize,

    /// Maximum encoded images kept in memory
    pub encoded_max_entries: usize,

    /// Maximum encoded bytes kept in memory
    pub encoded_max_bytes: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            bitmap_max_entries: 256,
            bitmap_max_bytes: 128 * 1024 * 1024,
            encoded_max_entries: 256,
            encoded_max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Disk cache settings, including the small-image partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Directory name (under `general.cache_dir`) of the main partition
    pub main_dir: String,

    /// Byte budget of the main partition
    pub main_max_bytes: u64,

    /// Directory name (under `general.cache_dir`) of the small-image partition
    pub small_dir: String,

    /// Byte budget of the small-image partition
    pub small_max_bytes: u64,

    /// Requests whose larger resize side is below this go to the
    /// small-image partition. 0 disables size-based routing.
    pub small_image_threshold_px: u32,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            main_dir: "images".to_string(),
            main_max_bytes: 40 * 1024 * 1024,
            small_dir: "thumbnails".to_string(),
            small_max_bytes: 10 * 1024 * 1024,
            small_image_threshold_px: 256,
        }
    }
}

/// Decode and progressive-decode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Whether intermediate byte results may produce partial decodes
    pub progressive_enabled: bool,

    /// Progressive JPEG scan numbers worth decoding
    pub scans_to_decode: Vec<u32>,

    /// Scan number from which a partial image counts as good enough
    pub good_enough_scan: u32,

    /// Maximum decoded dimension (width or height)
    pub max_image_dimension: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            progressive_enabled: true,
            scans_to_decode: vec![1, 3, 5, 10],
            good_enough_scan: 5,
            max_image_dimension: 10000,
        }
    }
}

/// Network fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Request timeout in milliseconds
    pub timeout_ms: u64,

    /// Minimum time between two intermediate byte results
    pub intermediate_interval_ms: u64,

    /// User-Agent header sent by the default HTTP fetcher
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            intermediate_interval_ms: 100,
            user_agent: format!("pixpipe/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Throttling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingConfig {
    /// Maximum local fetch + resize productions running at once
    pub max_simultaneous_local: usize,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_local: 5,
        }
    }
}

/// Encoded-image transform settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// JPEG quality used when re-encoding after resize/rotate
    pub jpeg_quality: u8,

    /// Transcode WebP sources to PNG before decoding
    pub webp_transcode: bool,

    /// Also resize intermediate (partial) results
    pub resize_intermediate_results: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            webp_transcode: false,
            resize_intermediate_results: false,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log format: pretty or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
