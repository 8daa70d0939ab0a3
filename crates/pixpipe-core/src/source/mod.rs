//! Byte sources the fetch producers read from.
//!
//! Local sources are synchronous readers opened on the local-read executor.
//! Network transport lives in [`network`].

pub mod network;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use base64::Engine;

use crate::request::ImageSource;

pub use network::{FetchResponse, HttpFetcher, NetworkFetcher};

/// An opened source: a reader plus its length when known up front.
pub struct SourceStream {
    pub reader: Box<dyn Read + Send>,
    pub length: Option<u64>,
}

impl SourceStream {
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let length = file.metadata().ok().map(|m| m.len());
        Ok(Self {
            reader: Box::new(file),
            length,
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let length = Some(bytes.len() as u64);
        Self {
            reader: Box::new(Cursor::new(bytes)),
            length,
        }
    }
}

/// Opens the bytes behind one kind of local [`ImageSource`].
///
/// `Ok(None)` means the source exists but holds no image data.
pub trait LocalSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, source: &ImageSource) -> io::Result<Option<SourceStream>>;
}

fn wrong_kind(source: &ImageSource) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unexpected source {}", source.uri()),
    )
}

/// Join `relative` under `root`, refusing `..` and absolute components.
fn confined(root: &Path, relative: &str) -> io::Result<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("path escapes root: {}", relative.display()),
        ));
    }
    Ok(root.join(relative))
}

/// Plain filesystem reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSource;

impl LocalSource for FileSource {
    fn name(&self) -> &'static str {
        "LocalFileFetchProducer"
    }

    fn open(&self, source: &ImageSource) -> io::Result<Option<SourceStream>> {
        match source {
            ImageSource::LocalFile(path) | ImageSource::LocalVideo(path) => {
                SourceStream::from_file(path).map(Some)
            }
            other => Err(wrong_kind(other)),
        }
    }
}

/// Resolves `content://` URIs to readable streams.
pub trait ContentResolver: Send + Sync {
    fn open(&self, uri: &str) -> io::Result<Option<SourceStream>>;
}

/// Serves `content://<authority>/<path>` from `<root>/<authority>/<path>`.
#[derive(Debug, Clone)]
pub struct DirectoryContentResolver {
    root: PathBuf,
}

impl DirectoryContentResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ContentResolver for DirectoryContentResolver {
    fn open(&self, uri: &str) -> io::Result<Option<SourceStream>> {
        let rest = uri.strip_prefix("content://").ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("not a content URI: {uri}"))
        })?;
        let path = confined(&self.root, rest)?;
        SourceStream::from_file(&path).map(Some)
    }
}

pub struct ContentUriSource {
    resolver: Arc<dyn ContentResolver>,
}

impl ContentUriSource {
    pub fn new(resolver: Arc<dyn ContentResolver>) -> Self {
        Self { resolver }
    }
}

impl LocalSource for ContentUriSource {
    fn name(&self) -> &'static str {
        "LocalContentUriFetchProducer"
    }

    fn open(&self, source: &ImageSource) -> io::Result<Option<SourceStream>> {
        match source {
            ImageSource::ContentUri(uri) => self.resolver.open(uri),
            other => Err(wrong_kind(other)),
        }
    }
}

/// Read-only tree of bundled assets.
pub trait AssetBundle: Send + Sync {
    fn open(&self, path: &str) -> io::Result<SourceStream>;
}

#[derive(Debug, Clone)]
pub struct DirectoryAssetBundle {
    root: PathBuf,
}

impl DirectoryAssetBundle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetBundle for DirectoryAssetBundle {
    fn open(&self, path: &str) -> io::Result<SourceStream> {
        SourceStream::from_file(&confined(&self.root, path)?)
    }
}

pub struct AssetSource {
    bundle: Arc<dyn AssetBundle>,
}

impl AssetSource {
    pub fn new(bundle: Arc<dyn AssetBundle>) -> Self {
        Self { bundle }
    }
}

impl LocalSource for AssetSource {
    fn name(&self) -> &'static str {
        "LocalAssetFetchProducer"
    }

    fn open(&self, source: &ImageSource) -> io::Result<Option<SourceStream>> {
        match source {
            ImageSource::Asset(path) => self.bundle.open(path).map(Some),
            other => Err(wrong_kind(other)),
        }
    }
}

/// Bundled resources addressed by numeric id.
pub trait ResourceBundle: Send + Sync {
    fn open(&self, id: u32) -> io::Result<SourceStream>;
}

/// Resource ids registered against in-memory bytes.
#[derive(Default)]
pub struct MapResourceBundle {
    entries: RwLock<HashMap<u32, Arc<[u8]>>>,
}

impl MapResourceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: u32, bytes: impl Into<Arc<[u8]>>) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, bytes.into());
    }
}

impl ResourceBundle for MapResourceBundle {
    fn open(&self, id: u32) -> io::Result<SourceStream> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bytes = entries.get(&id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no resource with id {id}"))
        })?;
        Ok(SourceStream::from_bytes(bytes.to_vec()))
    }
}

pub struct ResourceSource {
    bundle: Arc<dyn ResourceBundle>,
}

impl ResourceSource {
    pub fn new(bundle: Arc<dyn ResourceBundle>) -> Self {
        Self { bundle }
    }
}

impl LocalSource for ResourceSource {
    fn name(&self) -> &'static str {
        "LocalResourceFetchProducer"
    }

    fn open(&self, source: &ImageSource) -> io::Result<Option<SourceStream>> {
        match source {
            ImageSource::Resource(id) => self.bundle.open(*id).map(Some),
            other => Err(wrong_kind(other)),
        }
    }
}

/// Inline `data:` URIs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataUriSource;

impl DataUriSource {
    /// Payload bytes of `data:[<mediatype>][;base64],<data>`.
    pub fn decode(uri: &str) -> io::Result<Vec<u8>> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
        let body = uri
            .strip_prefix("data:")
            .ok_or_else(|| invalid("missing data: prefix"))?;
        let (header, payload) = body
            .split_once(',')
            .ok_or_else(|| invalid("data URI has no payload separator"))?;
        if header.split(';').any(|part| part.eq_ignore_ascii_case("base64")) {
            base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map_err(|e| invalid(&format!("bad base64 payload: {e}")))
        } else {
            Ok(payload.as_bytes().to_vec())
        }
    }
}

impl LocalSource for DataUriSource {
    fn name(&self) -> &'static str {
        "DataFetchProducer"
    }

    fn open(&self, source: &ImageSource) -> io::Result<Option<SourceStream>> {
        match source {
            ImageSource::Data(uri) => Ok(Some(SourceStream::from_bytes(Self::decode(uri)?))),
            other => Err(wrong_kind(other)),
        }
    }
}

/// Reads the JPEG thumbnail embedded in a local file's EXIF block.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifThumbnailSource;

impl ExifThumbnailSource {
    /// The embedded thumbnail bytes, or `None` when the file carries none.
    pub fn extract(path: &Path) -> io::Result<Option<Vec<u8>>> {
        let file = File::open(path)?;
        let mut reader = io::BufReader::new(file);
        let exif = match exif::Reader::new().read_from_container(&mut reader) {
            Ok(exif) => exif,
            Err(exif::Error::Io(e)) => return Err(e),
            Err(e) => {
                tracing::trace!("No EXIF block in {}: {e}", path.display());
                return Ok(None);
            }
        };

        let field_u32 = |tag| {
            exif.get_field(tag, exif::In::THUMBNAIL)
                .and_then(|f| f.value.get_uint(0))
        };
        let (Some(offset), Some(length)) = (
            field_u32(exif::Tag::JPEGInterchangeFormat),
            field_u32(exif::Tag::JPEGInterchangeFormatLength),
        ) else {
            return Ok(None);
        };

        // Offsets are relative to the TIFF header, which starts `buf()`.
        let buf = exif.buf();
        let start = offset as usize;
        let end = start.saturating_add(length as usize);
        if length == 0 || end > buf.len() {
            return Ok(None);
        }
        Ok(Some(buf[start..end].to_vec()))
    }
}

impl LocalSource for ExifThumbnailSource {
    fn name(&self) -> &'static str {
        "LocalExifThumbnailProducer"
    }

    fn open(&self, source: &ImageSource) -> io::Result<Option<SourceStream>> {
        match source {
            ImageSource::LocalFile(path) => {
                Ok(Self::extract(path)?.map(SourceStream::from_bytes))
            }
            other => Err(wrong_kind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::png_bytes;
    use std::io::Read as _;

    fn read_all(stream: SourceStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut reader = stream.reader;
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_file_source_reports_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, png_bytes(3, 3)).unwrap();

        let stream = FileSource
            .open(&ImageSource::LocalFile(path.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(stream.length, Some(std::fs::metadata(&path).unwrap().len()));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = FileSource
            .open(&ImageSource::LocalFile(PathBuf::from("/nonexistent/x.png")))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_content_resolver_maps_authority_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("media/images")).unwrap();
        std::fs::write(dir.path().join("media/images/1.png"), b"png").unwrap();

        let source = ContentUriSource::new(Arc::new(DirectoryContentResolver::new(dir.path())));
        let stream = source
            .open(&ImageSource::ContentUri("content://media/images/1.png".into()))
            .unwrap()
            .unwrap();
        assert_eq!(read_all(stream), b"png");
    }

    #[test]
    fn test_asset_bundle_rejects_parent_components() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = DirectoryAssetBundle::new(dir.path());
        let err = bundle.open("../secret.png").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_resource_bundle_lookup() {
        let bundle = MapResourceBundle::new();
        bundle.insert(42, b"icon".to_vec());
        let source = ResourceSource::new(Arc::new(bundle));

        let stream = source.open(&ImageSource::Resource(42)).unwrap().unwrap();
        assert_eq!(stream.length, Some(4));
        assert_eq!(read_all(stream), b"icon");
        assert!(source.open(&ImageSource::Resource(7)).is_err());
    }

    #[test]
    fn test_data_uri_base64_and_plain() {
        assert_eq!(
            DataUriSource::decode("data:image/png;base64,aGVsbG8=").unwrap(),
            b"hello"
        );
        assert_eq!(DataUriSource::decode("data:,raw").unwrap(), b"raw");
        assert!(DataUriSource::decode("data:image/png;base64").is_err());
    }

    #[test]
    fn test_exif_thumbnail_absent_in_plain_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        std::fs::write(&path, png_bytes(4, 4)).unwrap();
        assert!(ExifThumbnailSource::extract(&path).unwrap().is_none());
    }
}
