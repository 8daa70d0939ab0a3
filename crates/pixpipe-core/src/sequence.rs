//! Producer chain composition.
//!
//! [`ProducerSequences`] builds every chain once from a [`Config`] and a set
//! of [`Capabilities`], so all requests for the same source kind share one
//! set of multiplex maps. Building is pure wiring: nothing runs until a
//! request is submitted at a chain head.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::cache::{
    BitmapCacheKey, CacheKey, CacheKeyFactory, DefaultCacheKeyFactory, FileDiskCache,
    LruMemoryCache,
};
use crate::config::Config;
use crate::decoder::{DefaultImageDecoder, ImageDecoder, ProgressiveDecodePolicy, ProgressiveJpegConfig};
use crate::error::{PipelineError, Result};
use crate::executor::{DefaultExecutorSupplier, ExecutorSupplier};
use crate::image::{EncodedImage, ImageRef};
use crate::memory::{BufferPool, BufferRef, PooledBufferFactory, SharedBufferPool};
use crate::producers::{
    AddMetaProducer, BitmapKeyKind, BitmapMemoryCache, BitmapMemoryCacheGetProducer,
    BitmapMemoryCacheProducer, BranchOnSeparateImagesProducer, BranchProducer, DecodeProducer,
    DiskCachePartitions, DiskCacheProducer, EncodedMemoryCache, EncodedMemoryCacheProducer,
    LocalFetchProducer, MultiplexProducer, NetworkFetchProducer, NoVideoFrameExtractor,
    NullProducer, PostprocessorProducer, ProducerRef, RemoveMetaProducer, ResizeAndRotateProducer,
    SeparateImagesMode, SwallowResultProducer, ThreadHandoffProducer, ThrottlingProducer,
    VideoFrameExtractor, VideoFrameProducer, WebpTranscodeProducer,
};
use crate::request::{ImageRequest, SourceKind};
use crate::source::{
    AssetBundle, AssetSource, ContentResolver, ContentUriSource, DataUriSource,
    DirectoryAssetBundle, DirectoryContentResolver, ExifThumbnailSource, FileSource,
    HttpFetcher, LocalSource, MapResourceBundle, NetworkFetcher, ResourceBundle, ResourceSource,
};

/// The external collaborators a pipeline is built from.
#[derive(Clone)]
pub struct Capabilities {
    pub pool: Arc<dyn BufferPool>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub executors: Arc<dyn ExecutorSupplier>,
    pub cache_keys: Arc<dyn CacheKeyFactory>,
    pub bitmap_cache: BitmapMemoryCache,
    pub encoded_cache: EncodedMemoryCache,
    pub disk_caches: DiskCachePartitions,
    pub network: Arc<dyn NetworkFetcher>,
    pub content_resolver: Arc<dyn ContentResolver>,
    pub assets: Arc<dyn AssetBundle>,
    pub resources: Arc<dyn ResourceBundle>,
    pub video_frames: Arc<dyn VideoFrameExtractor>,
}

impl Capabilities {
    /// Default collaborators: `image` decoding, `reqwest` transport,
    /// directory-backed disk caches, LRU memory caches and blocking
    /// executors on `runtime`.
    pub fn from_config(config: &Config, runtime: Handle) -> Result<Self> {
        let pool: Arc<dyn BufferPool> = Arc::new(SharedBufferPool::default());
        let factory = PooledBufferFactory::new(Arc::clone(&pool));
        let disk = &config.disk_cache;
        let memory = &config.memory_cache;

        let bitmap_cache: BitmapMemoryCache = Arc::new(LruMemoryCache::<BitmapCacheKey, ImageRef>::new(
            "bitmap",
            memory.bitmap_max_entries,
            memory.bitmap_max_bytes,
        ));
        let encoded_cache: EncodedMemoryCache = Arc::new(LruMemoryCache::<CacheKey, BufferRef>::new(
            "encoded",
            memory.encoded_max_entries,
            memory.encoded_max_bytes,
        ));

        Ok(Self {
            decoder: Arc::new(DefaultImageDecoder::new(&config.decode)),
            executors: Arc::new(DefaultExecutorSupplier::new(runtime, &config.executors)),
            cache_keys: Arc::new(DefaultCacheKeyFactory),
            bitmap_cache,
            encoded_cache,
            disk_caches: DiskCachePartitions {
                main: Arc::new(FileDiskCache::new(
                    "main",
                    config.main_disk_cache_dir(),
                    disk.main_max_bytes,
                    factory.clone(),
                )),
                small: Arc::new(FileDiskCache::new(
                    "small",
                    config.small_disk_cache_dir(),
                    disk.small_max_bytes,
                    factory,
                )),
                small_image_threshold_px: disk.small_image_threshold_px,
            },
            network: Arc::new(HttpFetcher::new(&config.network)?),
            content_resolver: Arc::new(DirectoryContentResolver::new(config.content_dir())),
            assets: Arc::new(DirectoryAssetBundle::new(config.assets_dir())),
            resources: Arc::new(MapResourceBundle::new()),
            video_frames: Arc::new(NoVideoFrameExtractor),
            pool,
        })
    }
}

/// Every chain the pipeline serves, keyed by source kind.
pub struct ProducerSequences {
    decoded: HashMap<SourceKind, ProducerRef<ImageRef>>,
    encoded: HashMap<SourceKind, ProducerRef<BufferRef>>,
    bitmap_prefetch: HashMap<SourceKind, ProducerRef<()>>,
    disk_prefetch: ProducerRef<()>,
}

/// Shared state while building.
struct Builder<'a> {
    config: &'a Config,
    caps: &'a Capabilities,
    factory: PooledBufferFactory,
    progressive: Option<Arc<dyn ProgressiveDecodePolicy>>,
}

const LOCAL_KINDS: [SourceKind; 4] = [
    SourceKind::LocalFile,
    SourceKind::ContentUri,
    SourceKind::Asset,
    SourceKind::Resource,
];

impl ProducerSequences {
    pub fn new(config: &Config, caps: &Capabilities) -> Self {
        let builder = Builder {
            config,
            caps,
            factory: PooledBufferFactory::new(Arc::clone(&caps.pool)),
            progressive: config.decode.progressive_enabled.then(|| {
                Arc::new(ProgressiveJpegConfig::from_config(&config.decode))
                    as Arc<dyn ProgressiveDecodePolicy>
            }),
        };

        let mut decoded = HashMap::new();
        let mut encoded = HashMap::new();

        // Network: one encoded multiplex shared by the decoded, encoded and
        // prefetch chains.
        let network_encoded = builder.network_encoded();
        let network_decode = builder.decode(builder.resize(Arc::clone(&network_encoded)));
        let with_low_res: ProducerRef<ImageRef> = Arc::new(BranchOnSeparateImagesProducer::new(
            SeparateImagesMode::LowRes,
            Arc::clone(&network_decode),
            network_decode,
        ));
        decoded.insert(SourceKind::Network, builder.bitmap_tiers(with_low_res));
        encoded.insert(
            SourceKind::Network,
            Arc::new(RemoveMetaProducer::new(Arc::clone(&network_encoded))) as ProducerRef<BufferRef>,
        );
        let disk_prefetch: ProducerRef<()> =
            Arc::new(SwallowResultProducer::new(network_encoded));

        for kind in LOCAL_KINDS {
            let fetch = builder.local_fetch(kind);
            let transformed = if kind == SourceKind::LocalFile {
                builder.with_exif_thumbnail(Arc::clone(&fetch))
            } else {
                builder.resize(Arc::clone(&fetch))
            };
            let throttled: ProducerRef<EncodedImage> = Arc::new(ThrottlingProducer::new(
                config.throttling.max_simultaneous_local,
                transformed,
            ));
            decoded.insert(kind, builder.bitmap_tiers(builder.decode(throttled)));
            encoded.insert(
                kind,
                Arc::new(RemoveMetaProducer::new(fetch)) as ProducerRef<BufferRef>,
            );
        }

        let data_fetch = builder.local_fetch(SourceKind::Data);
        let data_decode = builder.decode(builder.resize(Arc::clone(&data_fetch)));
        decoded.insert(SourceKind::Data, builder.bitmap_tiers(data_decode));
        encoded.insert(
            SourceKind::Data,
            Arc::new(RemoveMetaProducer::new(data_fetch)) as ProducerRef<BufferRef>,
        );

        let video: ProducerRef<ImageRef> = Arc::new(VideoFrameProducer::new(
            Arc::clone(&caps.video_frames),
            caps.executors.for_local_storage_read(),
        ));
        decoded.insert(SourceKind::LocalVideo, builder.bitmap_tiers(video));

        let bitmap_prefetch = decoded
            .iter()
            .map(|(kind, chain)| {
                (
                    *kind,
                    Arc::new(SwallowResultProducer::new(Arc::clone(chain))) as ProducerRef<()>,
                )
            })
            .collect();

        tracing::debug!(
            "Built producer sequences for {} source kinds (progressive decoding {})",
            decoded.len(),
            if builder.progressive.is_some() { "on" } else { "off" }
        );

        Self {
            decoded,
            encoded,
            bitmap_prefetch,
            disk_prefetch,
        }
    }

    fn lookup<T: ?Sized>(
        map: &HashMap<SourceKind, Arc<T>>,
        request: &ImageRequest,
        operation: &str,
    ) -> std::result::Result<Arc<T>, PipelineError> {
        map.get(&request.source().kind())
            .cloned()
            .ok_or_else(|| PipelineError::UnsupportedOperation {
                uri: request.uri(),
                operation: operation.to_string(),
            })
    }

    /// Chain producing decoded images for `request`.
    pub fn decoded_sequence(
        &self,
        request: &ImageRequest,
    ) -> std::result::Result<ProducerRef<ImageRef>, PipelineError> {
        Self::lookup(&self.decoded, request, "decoded fetch")
    }

    /// Chain producing encoded bytes. Not available for video sources.
    pub fn encoded_sequence(
        &self,
        request: &ImageRequest,
    ) -> std::result::Result<ProducerRef<BufferRef>, PipelineError> {
        Self::lookup(&self.encoded, request, "encoded fetch")
    }

    /// Chain that fills the bitmap memory cache and reports completion.
    pub fn bitmap_prefetch_sequence(
        &self,
        request: &ImageRequest,
    ) -> std::result::Result<ProducerRef<()>, PipelineError> {
        Self::lookup(&self.bitmap_prefetch, request, "bitmap prefetch")
    }

    /// Chain that fills the disk cache. Local sources have nothing to warm
    /// and finish immediately.
    pub fn disk_prefetch_sequence(&self, request: &ImageRequest) -> ProducerRef<()> {
        match request.source().kind() {
            SourceKind::Network => Arc::clone(&self.disk_prefetch),
            _ => Arc::new(NullProducer::<()>::new()),
        }
    }
}

impl Builder<'_> {
    /// encoded-multiplex → encoded-cache → disk-cache → [webp] → network.
    fn network_encoded(&self) -> ProducerRef<EncodedImage> {
        let caps = self.caps;
        let mut fetch: ProducerRef<EncodedImage> = Arc::new(NetworkFetchProducer::new(
            Arc::clone(&caps.network),
            self.factory.clone(),
            caps.executors.runtime(),
            Duration::from_millis(self.config.network.intermediate_interval_ms),
        ));
        if self.config.transform.webp_transcode {
            fetch = Arc::new(WebpTranscodeProducer::new(
                self.factory.clone(),
                caps.executors.for_transform(),
                fetch,
            ));
        }
        let disk: ProducerRef<EncodedImage> = Arc::new(DiskCacheProducer::new(
            caps.disk_caches.clone(),
            Arc::clone(&caps.cache_keys),
            caps.executors.runtime(),
            fetch,
        ));
        let encoded_cache: ProducerRef<EncodedImage> = Arc::new(EncodedMemoryCacheProducer::new(
            Arc::clone(&caps.encoded_cache),
            Arc::clone(&caps.cache_keys),
            disk,
        ));
        Arc::new(MultiplexProducer::encoded(
            Arc::clone(&caps.cache_keys),
            encoded_cache,
        ))
    }

    fn local_fetch(&self, kind: SourceKind) -> ProducerRef<EncodedImage> {
        let source: Arc<dyn LocalSource> = match kind {
            SourceKind::ContentUri => {
                Arc::new(ContentUriSource::new(Arc::clone(&self.caps.content_resolver)))
            }
            SourceKind::Asset => Arc::new(AssetSource::new(Arc::clone(&self.caps.assets))),
            SourceKind::Resource => Arc::new(ResourceSource::new(Arc::clone(&self.caps.resources))),
            SourceKind::Data => Arc::new(DataUriSource),
            _ => Arc::new(FileSource),
        };
        self.fetch_from(source)
    }

    fn fetch_from(&self, source: Arc<dyn LocalSource>) -> ProducerRef<EncodedImage> {
        Arc::new(LocalFetchProducer::new(
            source,
            self.factory.clone(),
            self.caps.executors.for_local_storage_read(),
        ))
    }

    /// resize/rotate → add-meta → `next`.
    fn resize(&self, next: ProducerRef<EncodedImage>) -> ProducerRef<EncodedImage> {
        let with_meta: ProducerRef<EncodedImage> = Arc::new(AddMetaProducer::new(next));
        Arc::new(ResizeAndRotateProducer::new(
            self.factory.clone(),
            self.caps.executors.for_transform(),
            self.config.transform.jpeg_quality,
            self.config.transform.resize_intermediate_results,
            with_meta,
        ))
    }

    /// Try the embedded EXIF thumbnail before reading the whole file.
    fn with_exif_thumbnail(&self, file: ProducerRef<EncodedImage>) -> ProducerRef<EncodedImage> {
        let thumbnail = self.resize(self.fetch_from(Arc::new(ExifThumbnailSource)));
        Arc::new(BranchOnSeparateImagesProducer::new(
            SeparateImagesMode::Thumbnail,
            thumbnail,
            self.resize(file),
        ))
    }

    fn decode(&self, next: ProducerRef<EncodedImage>) -> ProducerRef<ImageRef> {
        Arc::new(DecodeProducer::new(
            Arc::clone(&self.caps.decoder),
            self.progressive.clone(),
            self.caps.executors.for_decode(),
            next,
        ))
    }

    /// Bitmap tiers over `next`, with the postprocessed tier in front for
    /// requests that carry a postprocessor.
    ///
    /// bitmap-get → hand-off → bitmap-multiplex → bitmap-cache → `next`
    fn bitmap_tiers(&self, next: ProducerRef<ImageRef>) -> ProducerRef<ImageRef> {
        let caps = self.caps;
        let cached: ProducerRef<ImageRef> = Arc::new(BitmapMemoryCacheProducer::new(
            Arc::clone(&caps.bitmap_cache),
            Arc::clone(&caps.cache_keys),
            BitmapKeyKind::Plain,
            next,
        ));
        let multiplexed: ProducerRef<ImageRef> = Arc::new(MultiplexProducer::bitmap(
            Arc::clone(&caps.cache_keys),
            cached,
        ));
        let handoff: ProducerRef<ImageRef> = Arc::new(ThreadHandoffProducer::new(
            caps.executors.for_background(),
            multiplexed,
        ));
        let plain: ProducerRef<ImageRef> = Arc::new(BitmapMemoryCacheGetProducer::new(
            Arc::clone(&caps.bitmap_cache),
            Arc::clone(&caps.cache_keys),
            handoff,
        ));

        let postprocess: ProducerRef<ImageRef> = Arc::new(PostprocessorProducer::new(
            caps.executors.for_background(),
            Arc::clone(&plain),
        ));
        let postprocessed: ProducerRef<ImageRef> = Arc::new(BitmapMemoryCacheProducer::new(
            Arc::clone(&caps.bitmap_cache),
            Arc::clone(&caps.cache_keys),
            BitmapKeyKind::Postprocessed,
            postprocess,
        ));
        Arc::new(BranchProducer::new(
            "PostprocessorBranchProducer",
            |request: &ImageRequest| request.postprocessor().is_some(),
            postprocessed,
            plain,
        ))
    }
}
