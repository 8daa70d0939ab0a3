//! Decoded and encoded image values that travel through the pipeline.

use std::fmt;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::memory::BufferRef;

/// Shared handle to a decoded image. Clone to add a reference, drop to close it.
pub type ImageRef = Arc<CloseableImage>;

/// How complete a decoded image is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityInfo {
    /// Progressive scan the image was decoded from (0 for non-progressive)
    pub scan_number: u32,
    /// Good enough to stop showing a placeholder
    pub is_good_enough: bool,
    /// Decoded from the complete byte stream
    pub is_full_quality: bool,
}

impl QualityInfo {
    pub const FULL: QualityInfo = QualityInfo {
        scan_number: u32::MAX,
        is_good_enough: true,
        is_full_quality: true,
    };
}

/// Decoded pixels plus the metadata needed to render them.
pub struct CloseableImage {
    image: DynamicImage,
    rotation: u32,
    quality: QualityInfo,
}

impl CloseableImage {
    pub fn new(image: DynamicImage, rotation: u32, quality: QualityInfo) -> Self {
        Self {
            image,
            rotation,
            quality,
        }
    }

    pub fn full(image: DynamicImage) -> ImageRef {
        Arc::new(Self::new(image, 0, QualityInfo::FULL))
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Clockwise rotation still to apply when rendering.
    pub fn rotation(&self) -> u32 {
        self.rotation
    }

    pub fn quality(&self) -> QualityInfo {
        self.quality
    }

    /// Copy of the pixels with the pending rotation applied.
    pub fn rendered(&self) -> DynamicImage {
        match self.rotation {
            90 => self.image.rotate90(),
            180 => self.image.rotate180(),
            270 => self.image.rotate270(),
            _ => self.image.clone(),
        }
    }

    /// Bytes of pixel storage held by this image.
    pub fn size_in_bytes(&self) -> usize {
        self.image.as_bytes().len()
    }
}

impl fmt::Debug for CloseableImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.image.dimensions();
        f.debug_struct("CloseableImage")
            .field("width", &width)
            .field("height", &height)
            .field("rotation", &self.rotation)
            .field("quality", &self.quality)
            .finish()
    }
}

/// Header facts about encoded bytes, carried next to the buffer so transform
/// stages don't re-parse them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransformMetadata {
    pub format: Option<ImageFormat>,
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation from the EXIF orientation (0, 90, 180 or 270)
    pub rotation: u32,
}

/// Encoded bytes plus their transform metadata.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub buffer: BufferRef,
    pub metadata: TransformMetadata,
}

impl EncodedImage {
    pub fn new(buffer: BufferRef, metadata: TransformMetadata) -> Self {
        Self { buffer, metadata }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_applies_pending_rotation() {
        let image = CloseableImage::new(DynamicImage::new_rgb8(4, 2), 90, QualityInfo::FULL);
        assert_eq!(image.rendered().dimensions(), (2, 4));
        assert_eq!((image.width(), image.height()), (4, 2));
    }

    #[test]
    fn test_size_in_bytes_counts_pixels() {
        let image = CloseableImage::full(DynamicImage::new_rgb8(3, 3));
        assert_eq!(image.size_in_bytes(), 27);
    }
}
