//! Header sniffing: format, dimensions and EXIF orientation.

use std::io::Cursor;

use exif::{In, Reader, Tag, Value};
use image::ImageFormat;

use crate::image::TransformMetadata;

/// Clockwise rotation for an EXIF orientation value. Mirrored orientations
/// are treated as unrotated.
pub fn orientation_to_rotation(orientation: u32) -> u32 {
    match orientation {
        3 => 180,
        6 => 90,
        8 => 270,
        _ => 0,
    }
}

fn exif_orientation(bytes: &[u8]) -> Option<u32> {
    let exif = Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;
    exif.get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|f| match &f.value {
            Value::Short(v) => v.first().map(|&x| x as u32),
            Value::Long(v) => v.first().copied(),
            _ => None,
        })
}

/// Read transform metadata without decoding pixels. Unknown parts are left
/// at their defaults.
pub fn read_metadata(bytes: &[u8]) -> TransformMetadata {
    let format = image::guess_format(bytes).ok();
    let (width, height) = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .unwrap_or((0, 0));
    let rotation = match format {
        Some(ImageFormat::Jpeg | ImageFormat::Tiff | ImageFormat::WebP | ImageFormat::Png) => {
            exif_orientation(bytes).map_or(0, orientation_to_rotation)
        }
        _ => 0,
    };
    TransformMetadata {
        format,
        width,
        height,
        rotation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{jpeg_bytes, png_bytes};

    #[test]
    fn test_orientation_mapping() {
        assert_eq!(orientation_to_rotation(1), 0);
        assert_eq!(orientation_to_rotation(3), 180);
        assert_eq!(orientation_to_rotation(6), 90);
        assert_eq!(orientation_to_rotation(8), 270);
        assert_eq!(orientation_to_rotation(2), 0);
    }

    #[test]
    fn test_reads_png_header() {
        let meta = read_metadata(&png_bytes(7, 3));
        assert_eq!(meta.format, Some(ImageFormat::Png));
        assert_eq!((meta.width, meta.height), (7, 3));
        assert_eq!(meta.rotation, 0);
    }

    #[test]
    fn test_reads_jpeg_header() {
        let meta = read_metadata(&jpeg_bytes(20, 10));
        assert_eq!(meta.format, Some(ImageFormat::Jpeg));
        assert_eq!((meta.width, meta.height), (20, 10));
    }

    #[test]
    fn test_unknown_bytes_give_defaults() {
        assert_eq!(read_metadata(b"nope"), TransformMetadata::default());
    }
}
