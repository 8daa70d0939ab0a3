//! Error types for the pixpipe image loading pipeline.
//!
//! Pipeline errors are delivered to consumers as failure terminals and are
//! `Clone` so one failure can be broadcast to every consumer attached to a
//! shared production. Cache errors never reach a consumer: cache stages log
//! them and degrade to a miss.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Top-level error type for pixpipe operations.
#[derive(Error, Debug)]
pub enum PixpipeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pipeline processing errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Failures delivered through a consumer's failure terminal.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Reading the source bytes failed (file, content URI, asset, resource, network body)
    #[error("Failed to read {uri}: {source}")]
    Source {
        uri: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// The network collaborator rejected the request
    #[error("Network error for {uri} (status {status_code:?}): {message}")]
    Network {
        uri: String,
        status_code: Option<u16>,
        message: String,
    },

    /// Image decoding failed
    #[error("Decode error for {uri}: {message}")]
    Decode { uri: String, message: String },

    /// Decoded dimensions exceed the configured limit
    #[error("Image too large: {uri} ({width}x{height} > {max_dim})")]
    ImageTooLarge {
        uri: String,
        width: u32,
        height: u32,
        max_dim: u32,
    },

    /// Resize, rotate or transcode failed
    #[error("Transform error for {uri}: {message}")]
    Transform { uri: String, message: String },

    /// A caller-supplied postprocessor failed
    #[error("Postprocessor {postprocessor} failed for {uri}: {message}")]
    Postprocess {
        uri: String,
        postprocessor: String,
        message: String,
    },

    /// The URI scheme is not understood
    #[error("Unsupported image source: {0}")]
    UnsupportedSource(String),

    /// The operation is not available for this kind of source
    #[error("{operation} is not supported for {uri}")]
    UnsupportedOperation { uri: String, operation: String },

    /// A pipeline stage panicked while working on the request
    #[error("{stage} panicked while processing {uri}: {message}")]
    Panicked {
        uri: String,
        stage: String,
        message: String,
    },

    /// An executor dropped the request before it reached a terminal state
    #[error("Executor dropped request {0} without a result")]
    Executor(String),
}

impl PipelineError {
    /// Wrap an I/O error raised while reading `uri`.
    pub fn read_failed(uri: impl Into<String>, error: io::Error) -> Self {
        Self::Source {
            uri: uri.into(),
            source: Arc::new(error),
        }
    }
}

/// Non-fatal cache failures. Logged by the cache stages, never delivered.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Disk I/O failed for the named cache tier
    #[error("{tier} cache I/O error: {source}")]
    Io {
        tier: &'static str,
        #[source]
        source: io::Error,
    },

    /// A cache write was refused (e.g. entry larger than the budget)
    #[error("{tier} cache rejected entry: {message}")]
    Rejected { tier: &'static str, message: String },
}

/// Convenience type alias for pixpipe results.
pub type Result<T> = std::result::Result<T, PixpipeError>;

/// Convenience type alias for pipeline-specific results.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_read_failed_keeps_original_error() {
        let err = PipelineError::read_failed(
            "file:///missing.jpg",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        assert!(err.to_string().contains("file:///missing.jpg"));
        let source = err.source().unwrap();
        assert!(source.to_string().contains("no such file"));
    }

    #[test]
    fn test_pipeline_error_clone_is_identical() {
        let err = PipelineError::Decode {
            uri: "https://example.com/a.jpg".into(),
            message: "truncated".into(),
        };
        assert_eq!(err.to_string(), err.clone().to_string());
    }
}
