//! Cache key derivation.
//!
//! Encoded tiers (encoded memory cache, both disk partitions) are keyed by the
//! source URI alone so differently-resized requests share one download. The
//! decoded tier also keys on resize, rotation and postprocessing.

use blake3::Hasher as Blake3Hasher;

use crate::request::{ImageRequest, ResizeOptions};

/// Key of the encoded memory cache and the disk cache partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable file-name-safe digest of the key.
    pub fn resource_id(&self) -> String {
        let mut hasher = Blake3Hasher::new();
        hasher.update(self.0.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Key of the decoded-image memory cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitmapCacheKey {
    pub source: String,
    pub resize: Option<ResizeOptions>,
    pub auto_rotate: bool,
    pub postprocessor: Option<String>,
}

impl BitmapCacheKey {
    /// Whether this key was derived from `uri`, whatever the other options.
    pub fn is_for_uri(&self, uri: &str) -> bool {
        self.source == uri
    }
}

/// Maps a request to its tier-specific keys.
pub trait CacheKeyFactory: Send + Sync {
    /// Key of the plain decoded image.
    fn bitmap_cache_key(&self, request: &ImageRequest) -> BitmapCacheKey;

    /// Key of the decoded image after the request's postprocessor ran.
    fn postprocessed_bitmap_cache_key(&self, request: &ImageRequest) -> BitmapCacheKey;

    /// Key of the encoded bytes.
    fn encoded_cache_key(&self, request: &ImageRequest) -> CacheKey;
}

/// Derives keys from the canonical source URI.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCacheKeyFactory;

impl CacheKeyFactory for DefaultCacheKeyFactory {
    fn bitmap_cache_key(&self, request: &ImageRequest) -> BitmapCacheKey {
        BitmapCacheKey {
            source: request.uri(),
            resize: request.resize(),
            auto_rotate: request.auto_rotate(),
            postprocessor: None,
        }
    }

    fn postprocessed_bitmap_cache_key(&self, request: &ImageRequest) -> BitmapCacheKey {
        BitmapCacheKey {
            postprocessor: request.postprocessor().map(|p| p.name().to_string()),
            ..self.bitmap_cache_key(request)
        }
    }

    fn encoded_cache_key(&self, request: &ImageRequest) -> CacheKey {
        CacheKey::new(request.uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_key_ignores_resize() {
        let keys = DefaultCacheKeyFactory;
        let small = ImageRequest::builder("https://example.com/a.jpg")
            .unwrap()
            .resize(64, 64)
            .build();
        let large = ImageRequest::from_uri("https://example.com/a.jpg").unwrap();
        assert_eq!(keys.encoded_cache_key(&small), keys.encoded_cache_key(&large));
        assert_ne!(keys.bitmap_cache_key(&small), keys.bitmap_cache_key(&large));
    }

    #[test]
    fn test_resource_id_is_stable_hex() {
        let key = CacheKey::new("https://example.com/a.jpg");
        let id = key.resource_id();
        assert_eq!(id, key.clone().resource_id());
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_bitmap_key_matches_uri() {
        let keys = DefaultCacheKeyFactory;
        let request = ImageRequest::from_uri("https://example.com/a.jpg").unwrap();
        assert!(keys
            .bitmap_cache_key(&request)
            .is_for_uri("https://example.com/a.jpg"));
    }
}
