//! Configuration validation with range checks.

use crate::error::ConfigError;

use super::Config;

impl Config {
    /// Validate configuration values are within acceptable ranges.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let executors = [
            ("executors.decode_threads", self.executors.decode_threads),
            ("executors.local_read_threads", self.executors.local_read_threads),
            ("executors.background_threads", self.executors.background_threads),
            ("executors.transform_threads", self.executors.transform_threads),
        ];
        for (name, value) in executors {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
            }
        }
        if self.memory_cache.bitmap_max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "memory_cache.bitmap_max_entries must be > 0".into(),
            ));
        }
        if self.memory_cache.encoded_max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "memory_cache.encoded_max_entries must be > 0".into(),
            ));
        }
        if self.throttling.max_simultaneous_local == 0 {
            return Err(ConfigError::ValidationError(
                "throttling.max_simultaneous_local must be > 0".into(),
            ));
        }
        if self.decode.max_image_dimension == 0 {
            return Err(ConfigError::ValidationError(
                "decode.max_image_dimension must be > 0".into(),
            ));
        }
        if self.transform.jpeg_quality == 0 || self.transform.jpeg_quality > 100 {
            return Err(ConfigError::ValidationError(
                "transform.jpeg_quality must be between 1 and 100".into(),
            ));
        }
        if self.network.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "network.timeout_ms must be > 0".into(),
            ));
        }
        if self.disk_cache.main_dir == self.disk_cache.small_dir {
            return Err(ConfigError::ValidationError(
                "disk_cache.small_dir must differ from disk_cache.main_dir".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_passes_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_decode_threads() {
        let mut config = Config::default();
        config.executors.decode_threads = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("decode_threads"));
    }

    #[test]
    fn test_validate_rejects_zero_throttle() {
        let mut config = Config::default();
        config.throttling.max_simultaneous_local = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_simultaneous_local"));
    }

    #[test]
    fn test_validate_rejects_invalid_jpeg_quality() {
        let mut config = Config::default();
        config.transform.jpeg_quality = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jpeg_quality"));

        config.transform.jpeg_quality = 101;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jpeg_quality"));
    }

    #[test]
    fn test_validate_rejects_shared_partition_dir() {
        let mut config = Config::default();
        config.disk_cache.small_dir = config.disk_cache.main_dir.clone();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("small_dir"));
    }
}
