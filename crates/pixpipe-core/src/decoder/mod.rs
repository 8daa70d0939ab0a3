//! Decoding encoded bytes into pixels.

pub mod metadata;
pub mod progressive;

use std::io::Cursor;

use image::{DynamicImage, GenericImageView};

use crate::config::DecodeConfig;
use crate::error::PipelineError;
use crate::image::QualityInfo;

pub use metadata::{orientation_to_rotation, read_metadata};
pub use progressive::{ProgressiveDecodePolicy, ProgressiveJpegConfig, ProgressiveJpegParser};

/// JPEG end-of-image marker appended to truncated progressive data.
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Turns encoded bytes into a decoded image.
pub trait ImageDecoder: Send + Sync {
    /// Decode `bytes`. When `quality` is not full quality, `bytes` is a
    /// prefix of a progressive JPEG ending at a scan boundary.
    fn decode(
        &self,
        uri: &str,
        bytes: &[u8],
        quality: QualityInfo,
    ) -> Result<DynamicImage, PipelineError>;
}

/// `image`-crate decoder with a dimension limit.
#[derive(Debug, Clone)]
pub struct DefaultImageDecoder {
    max_image_dimension: u32,
}

impl DefaultImageDecoder {
    pub fn new(config: &DecodeConfig) -> Self {
        Self {
            max_image_dimension: config.max_image_dimension,
        }
    }

    fn decode_sync(&self, uri: &str, bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
        let reader = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PipelineError::Decode {
                uri: uri.to_string(),
                message: format!("Cannot detect image format: {}", e),
            })?;
        if reader.format().is_none() {
            return Err(PipelineError::Decode {
                uri: uri.to_string(),
                message: "Unrecognized image format".to_string(),
            });
        }
        let image = reader.decode().map_err(|e| PipelineError::Decode {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;

        let (width, height) = image.dimensions();
        if width > self.max_image_dimension || height > self.max_image_dimension {
            return Err(PipelineError::ImageTooLarge {
                uri: uri.to_string(),
                width,
                height,
                max_dim: self.max_image_dimension,
            });
        }
        Ok(image)
    }
}

impl Default for DefaultImageDecoder {
    fn default() -> Self {
        Self::new(&DecodeConfig::default())
    }
}

impl ImageDecoder for DefaultImageDecoder {
    fn decode(
        &self,
        uri: &str,
        bytes: &[u8],
        quality: QualityInfo,
    ) -> Result<DynamicImage, PipelineError> {
        if quality.is_full_quality || bytes.ends_with(&JPEG_EOI) {
            return self.decode_sync(uri, bytes);
        }
        let mut terminated = Vec::with_capacity(bytes.len() + JPEG_EOI.len());
        terminated.extend_from_slice(bytes);
        terminated.extend_from_slice(&JPEG_EOI);
        self.decode_sync(uri, &terminated)
    }
}
