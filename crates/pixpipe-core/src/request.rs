//! Image requests: the immutable descriptor of what to load and how.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::producers::postprocess::Postprocessor;

/// File extensions routed to the video-frame producer.
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "mkv", "webm", "avi", "3gp"];

/// Where the bytes of an image come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageSource {
    /// `http://` or `https://` URL
    Network(String),
    /// Local still image (`file://` URI or bare path)
    LocalFile(PathBuf),
    /// Local video whose frame is extracted
    LocalVideo(PathBuf),
    /// `content://` URI resolved by a content provider
    ContentUri(String),
    /// `asset://` path inside the bundled asset tree
    Asset(String),
    /// `res://<id>` bundled resource
    Resource(u32),
    /// `data:` URI with inline base64 payload
    Data(String),
}

/// Coarse source kind, used to pick a producer sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Network,
    LocalFile,
    LocalVideo,
    ContentUri,
    Asset,
    Resource,
    Data,
}

impl ImageSource {
    /// Parse a URI (or bare filesystem path) into a source.
    pub fn parse(uri: &str) -> Result<Self, PipelineError> {
        let unsupported = || PipelineError::UnsupportedSource(uri.to_string());
        if uri.starts_with("data:") {
            return Ok(Self::Data(uri.to_string()));
        }
        match uri.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "http" | "https" => Ok(Self::Network(uri.to_string())),
                "file" => Ok(Self::local_path(PathBuf::from(rest))),
                "content" => Ok(Self::ContentUri(uri.to_string())),
                "asset" => Ok(Self::Asset(rest.trim_start_matches('/').to_string())),
                "res" => rest
                    .trim_start_matches('/')
                    .parse::<u32>()
                    .map(Self::Resource)
                    .map_err(|_| unsupported()),
                _ => Err(unsupported()),
            },
            None if !uri.is_empty() => Ok(Self::local_path(PathBuf::from(uri))),
            None => Err(unsupported()),
        }
    }

    fn local_path(path: PathBuf) -> Self {
        if is_video_path(&path) {
            Self::LocalVideo(path)
        } else {
            Self::LocalFile(path)
        }
    }

    /// Canonical URI of this source, used for cache keys.
    pub fn uri(&self) -> String {
        match self {
            Self::Network(url) => url.clone(),
            Self::LocalFile(path) | Self::LocalVideo(path) => {
                format!("file://{}", path.display())
            }
            Self::ContentUri(uri) => uri.clone(),
            Self::Asset(path) => format!("asset:///{path}"),
            Self::Resource(id) => format!("res:///{id}"),
            Self::Data(uri) => uri.clone(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Network(_) => SourceKind::Network,
            Self::LocalFile(_) => SourceKind::LocalFile,
            Self::LocalVideo(_) => SourceKind::LocalVideo,
            Self::ContentUri(_) => SourceKind::ContentUri,
            Self::Asset(_) => SourceKind::Asset,
            Self::Resource(_) => SourceKind::Resource,
            Self::Data(_) => SourceKind::Data,
        }
    }

    /// Local still image path, if this is one.
    pub fn local_path_ref(&self) -> Option<&Path> {
        match self {
            Self::LocalFile(path) | Self::LocalVideo(path) => Some(path),
            _ => None,
        }
    }
}

fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Target size the caller intends to display the image at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResizeOptions {
    pub width: u32,
    pub height: u32,
}

impl ResizeOptions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Larger of the two sides.
    pub fn max_side(&self) -> u32 {
        self.width.max(self.height)
    }
}

/// Scheduling priority of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Deepest tier a request may reach. Ordered from deepest to shallowest:
/// a request whose lowest permitted level is `DiskCache` stops after a disk
/// miss instead of going to the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestLevel {
    #[default]
    FullFetch,
    DiskCache,
    EncodedMemoryCache,
    BitmapMemoryCache,
}

/// Disk cache partition a request prefers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CacheChoice {
    #[default]
    Default,
    Small,
}

/// Immutable description of one image load.
#[derive(Clone)]
pub struct ImageRequest {
    source: ImageSource,
    resize: Option<ResizeOptions>,
    auto_rotate: bool,
    progressive_rendering: bool,
    priority: Priority,
    lowest_permitted_level: RequestLevel,
    cache_choice: CacheChoice,
    disk_cache_enabled: bool,
    postprocessor: Option<Arc<dyn Postprocessor>>,
    low_res_source: Option<ImageSource>,
}

impl ImageRequest {
    /// Start building a request for `uri`.
    pub fn builder(uri: &str) -> Result<ImageRequestBuilder, PipelineError> {
        Ok(ImageRequestBuilder::new(ImageSource::parse(uri)?))
    }

    /// Request `uri` with every option at its default.
    pub fn from_uri(uri: &str) -> Result<Self, PipelineError> {
        Ok(Self::builder(uri)?.build())
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn uri(&self) -> String {
        self.source.uri()
    }

    pub fn resize(&self) -> Option<ResizeOptions> {
        self.resize
    }

    pub fn auto_rotate(&self) -> bool {
        self.auto_rotate
    }

    pub fn progressive_rendering(&self) -> bool {
        self.progressive_rendering
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn lowest_permitted_level(&self) -> RequestLevel {
        self.lowest_permitted_level
    }

    pub fn cache_choice(&self) -> CacheChoice {
        self.cache_choice
    }

    pub fn disk_cache_enabled(&self) -> bool {
        self.disk_cache_enabled
    }

    pub fn postprocessor(&self) -> Option<&Arc<dyn Postprocessor>> {
        self.postprocessor.as_ref()
    }

    pub fn low_res_source(&self) -> Option<&ImageSource> {
        self.low_res_source.as_ref()
    }

    /// The same request pointed at its low-resolution source, if any.
    pub fn low_res_request(&self) -> Option<ImageRequest> {
        let low_res = self.low_res_source.clone()?;
        let mut request = self.clone();
        request.source = low_res;
        request.low_res_source = None;
        Some(request)
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("source", &self.source)
            .field("resize", &self.resize)
            .field("auto_rotate", &self.auto_rotate)
            .field("progressive_rendering", &self.progressive_rendering)
            .field("priority", &self.priority)
            .field("lowest_permitted_level", &self.lowest_permitted_level)
            .field("cache_choice", &self.cache_choice)
            .field("disk_cache_enabled", &self.disk_cache_enabled)
            .field("postprocessor", &self.postprocessor.as_ref().map(|p| p.name()))
            .field("low_res_source", &self.low_res_source)
            .finish()
    }
}

/// Builder for [`ImageRequest`].
pub struct ImageRequestBuilder {
    request: ImageRequest,
}

impl ImageRequestBuilder {
    pub fn new(source: ImageSource) -> Self {
        Self {
            request: ImageRequest {
                source,
                resize: None,
                auto_rotate: true,
                progressive_rendering: false,
                priority: Priority::default(),
                lowest_permitted_level: RequestLevel::default(),
                cache_choice: CacheChoice::default(),
                disk_cache_enabled: true,
                postprocessor: None,
                low_res_source: None,
            },
        }
    }

    pub fn resize(mut self, width: u32, height: u32) -> Self {
        self.request.resize = Some(ResizeOptions::new(width, height));
        self
    }

    pub fn auto_rotate(mut self, enabled: bool) -> Self {
        self.request.auto_rotate = enabled;
        self
    }

    pub fn progressive_rendering(mut self, enabled: bool) -> Self {
        self.request.progressive_rendering = enabled;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.request.priority = priority;
        self
    }

    pub fn lowest_permitted_level(mut self, level: RequestLevel) -> Self {
        self.request.lowest_permitted_level = level;
        self
    }

    pub fn cache_choice(mut self, choice: CacheChoice) -> Self {
        self.request.cache_choice = choice;
        self
    }

    pub fn disk_cache_enabled(mut self, enabled: bool) -> Self {
        self.request.disk_cache_enabled = enabled;
        self
    }

    pub fn postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.request.postprocessor = Some(postprocessor);
        self
    }

    pub fn low_res_uri(mut self, uri: &str) -> Result<Self, PipelineError> {
        self.request.low_res_source = Some(ImageSource::parse(uri)?);
        Ok(self)
    }

    pub fn build(self) -> ImageRequest {
        self.request
    }
}
