//! The pipeline facade: submits requests at the head of a chain and turns
//! consumer callbacks into futures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::cache::{BitmapCacheKey, CacheKey};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult, Result};
use crate::image::ImageRef;
use crate::memory::BufferRef;
use crate::producers::{
    Consumer, ConsumerRef, ContextSettings, Envelope, Origin, ProducerContext, ProducerRef,
    RequestListener, TerminalGuard, TracingRequestListener,
};
use crate::request::{ImageRequest, Priority};
use crate::sequence::{Capabilities, ProducerSequences};

/// How a fetch ended.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The final result.
    Ready { payload: T, origin: Origin },
    /// Finished without a result, e.g. the lowest permitted level was a
    /// cache and it missed.
    Empty { origin: Origin },
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn payload(self) -> Option<T> {
        match self {
            Self::Ready { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn origin(&self) -> Option<Origin> {
        match self {
            Self::Ready { origin, .. } | Self::Empty { origin } => Some(*origin),
            Self::Cancelled => None,
        }
    }
}

/// Control over a submitted request.
#[derive(Clone)]
pub struct RequestHandle {
    context: Arc<ProducerContext>,
}

impl RequestHandle {
    pub fn id(&self) -> &str {
        self.context.id()
    }

    /// Ask the chain to stop. The consumer still receives one terminal
    /// callback, which may be a result that was already on its way.
    pub fn cancel(&self) {
        self.context.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }

    pub fn set_priority(&self, priority: Priority) {
        self.context.set_priority(priority);
    }
}

/// Loads images through the composed producer chains.
pub struct ImagePipeline {
    config: Config,
    capabilities: Capabilities,
    sequences: ProducerSequences,
    listener: Arc<dyn RequestListener>,
    next_id: AtomicU64,
}

impl ImagePipeline {
    pub fn new(config: Config, capabilities: Capabilities) -> Self {
        let sequences = ProducerSequences::new(&config, &capabilities);
        Self {
            config,
            capabilities,
            sequences,
            listener: Arc::new(TracingRequestListener),
            next_id: AtomicU64::new(1),
        }
    }

    /// Pipeline with the default collaborators for `config`.
    pub fn from_config(config: Config, runtime: Handle) -> Result<Self> {
        let capabilities = Capabilities::from_config(&config, runtime)?;
        Ok(Self::new(config, capabilities))
    }

    /// Replace the request listener (tracing by default).
    pub fn with_listener(mut self, listener: Arc<dyn RequestListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Start loading a decoded image; results go to `consumer`.
    pub fn submit(
        &self,
        request: ImageRequest,
        consumer: ConsumerRef<ImageRef>,
    ) -> PipelineResult<RequestHandle> {
        let chain = self.sequences.decoded_sequence(&request)?;
        Ok(self.start(chain, request, consumer, false))
    }

    /// Start loading encoded bytes; results go to `consumer`.
    pub fn submit_encoded(
        &self,
        request: ImageRequest,
        consumer: ConsumerRef<BufferRef>,
    ) -> PipelineResult<RequestHandle> {
        let chain = self.sequences.encoded_sequence(&request)?;
        Ok(self.start(chain, request, consumer, false))
    }

    /// Load the final decoded image. Dropping the future cancels the request.
    pub async fn fetch_decoded_image(
        &self,
        request: ImageRequest,
    ) -> PipelineResult<Outcome<ImageRef>> {
        let chain = self.sequences.decoded_sequence(&request)?;
        self.run(chain, request, false).await
    }

    /// Load the final encoded bytes, without transform metadata.
    pub async fn fetch_encoded_image(
        &self,
        request: ImageRequest,
    ) -> PipelineResult<Outcome<BufferRef>> {
        let chain = self.sequences.encoded_sequence(&request)?;
        self.run(chain, request, false).await
    }

    /// Load the image into the bitmap memory cache.
    pub async fn prefetch_to_bitmap_cache(
        &self,
        request: ImageRequest,
    ) -> PipelineResult<()> {
        let chain = self.sequences.bitmap_prefetch_sequence(&request)?;
        self.run(chain, request, true).await.map(|_| ())
    }

    /// Load the encoded bytes into the disk cache.
    pub async fn prefetch_to_disk_cache(
        &self,
        request: ImageRequest,
    ) -> PipelineResult<()> {
        let chain = self.sequences.disk_prefetch_sequence(&request);
        self.run(chain, request, true).await.map(|_| ())
    }

    fn bitmap_key(&self, request: &ImageRequest) -> BitmapCacheKey {
        let keys = &self.capabilities.cache_keys;
        if request.postprocessor().is_some() {
            keys.postprocessed_bitmap_cache_key(request)
        } else {
            keys.bitmap_cache_key(request)
        }
    }

    pub fn is_in_bitmap_memory_cache(&self, request: &ImageRequest) -> bool {
        self.capabilities
            .bitmap_cache
            .contains(&self.bitmap_key(request))
    }

    pub async fn is_in_disk_cache(&self, request: &ImageRequest) -> bool {
        let key = self.capabilities.cache_keys.encoded_cache_key(request);
        self.capabilities
            .disk_caches
            .select(request)
            .contains(&key)
            .await
    }

    /// Drop every cached form of `uri` from all tiers.
    pub async fn evict(&self, uri: &str) -> PipelineResult<()> {
        let request = ImageRequest::from_uri(uri)?;
        let canonical = request.uri();
        let caps = &self.capabilities;

        let bitmaps = caps
            .bitmap_cache
            .remove_matching(&|key: &BitmapCacheKey| key.is_for_uri(&canonical));
        let encoded_key = caps.cache_keys.encoded_cache_key(&request);
        let encoded = caps
            .encoded_cache
            .remove_matching(&|key: &CacheKey| *key == encoded_key);
        for disk in [&caps.disk_caches.main, &caps.disk_caches.small] {
            if let Err(e) = disk.remove(&encoded_key).await {
                tracing::warn!("Failed to evict {} from disk cache: {}", canonical, e);
            }
        }
        tracing::debug!(
            "Evicted {}: {} decoded, {} encoded entries",
            canonical,
            bitmaps,
            encoded
        );
        Ok(())
    }

    pub fn clear_memory_caches(&self) {
        self.capabilities.bitmap_cache.clear();
        self.capabilities.encoded_cache.clear();
    }

    /// Clear both disk partitions. Failures are logged and skipped.
    pub async fn clear_disk_caches(&self) {
        let partitions = &self.capabilities.disk_caches;
        for disk in [&partitions.main, &partitions.small] {
            match disk.clear().await {
                Ok(()) => tracing::info!("Cleared {} disk cache", disk.name()),
                Err(e) => tracing::warn!("Failed to clear {} disk cache: {}", disk.name(), e),
            }
        }
    }

    fn start<T: Send + 'static>(
        &self,
        chain: ProducerRef<T>,
        request: ImageRequest,
        consumer: ConsumerRef<T>,
        is_prefetch: bool,
    ) -> RequestHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let request = Arc::new(request);
        let settings = ContextSettings::for_request(&request, is_prefetch);
        let context = ProducerContext::new(
            id,
            Arc::clone(&request),
            Arc::clone(&self.listener),
            settings,
        );
        self.listener
            .on_request_start(&request, context.id(), is_prefetch);

        let head = TerminalGuard::wrap(Arc::new(RequestConsumer {
            inner: consumer,
            request,
            id: context.id().to_string(),
            is_prefetch,
            listener: Arc::clone(&self.listener),
        }) as ConsumerRef<T>);
        chain.produce_results(head, Arc::clone(&context));
        RequestHandle { context }
    }

    async fn run<T: Send + 'static>(
        &self,
        chain: ProducerRef<T>,
        request: ImageRequest,
        is_prefetch: bool,
    ) -> PipelineResult<Outcome<T>> {
        let (tx, rx) = oneshot::channel();
        let consumer = Arc::new(OneshotConsumer {
            sender: Mutex::new(Some(tx)),
        });
        let handle = self.start(chain, request, consumer, is_prefetch);
        let id = handle.id().to_string();
        let mut guard = CancelOnDrop(Some(handle));
        let result = rx.await;
        guard.0 = None;
        result.unwrap_or(Err(PipelineError::Executor(id)))
    }
}

/// Cancels the request if the awaiting future is dropped early.
struct CancelOnDrop(Option<RequestHandle>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            tracing::debug!("Request {} dropped before completion", handle.id());
            handle.cancel();
        }
    }
}

/// Head of every chain: reports request-level events to the listener.
struct RequestConsumer<T> {
    inner: ConsumerRef<T>,
    request: Arc<ImageRequest>,
    id: String,
    is_prefetch: bool,
    listener: Arc<dyn RequestListener>,
}

impl<T: Send + 'static> Consumer<T> for RequestConsumer<T> {
    fn on_new_result(&self, envelope: Envelope<T>) {
        if envelope.is_last() {
            self.listener
                .on_request_success(&self.request, &self.id, self.is_prefetch);
        }
        self.inner.on_new_result(envelope);
    }

    fn on_failure(&self, error: PipelineError) {
        self.listener
            .on_request_failure(&self.request, &self.id, &error, self.is_prefetch);
        self.inner.on_failure(error);
    }

    fn on_cancellation(&self) {
        self.listener.on_request_cancellation(&self.id);
        self.inner.on_cancellation();
    }

    fn on_progress_update(&self, progress: f32) {
        self.inner.on_progress_update(progress);
    }
}

type OutcomeSender<T> = oneshot::Sender<PipelineResult<Outcome<T>>>;

/// Sends the terminal callback through a oneshot channel.
struct OneshotConsumer<T> {
    sender: Mutex<Option<OutcomeSender<T>>>,
}

impl<T> OneshotConsumer<T> {
    fn send(&self, result: PipelineResult<Outcome<T>>) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The receiver is gone when the caller stopped waiting.
            let _ = sender.send(result);
        }
    }
}

impl<T: Send + 'static> Consumer<T> for OneshotConsumer<T> {
    fn on_new_result(&self, envelope: Envelope<T>) {
        if !envelope.is_last() {
            return;
        }
        let origin = envelope.origin;
        let outcome = match envelope.payload {
            Some(payload) => Outcome::Ready { payload, origin },
            None => Outcome::Empty { origin },
        };
        self.send(Ok(outcome));
    }

    fn on_failure(&self, error: PipelineError) {
        self.send(Err(error));
    }

    fn on_cancellation(&self) {
        self.send(Ok(Outcome::Cancelled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutorSupplier;
    use crate::producers::DiskCachePartitions;
    use crate::request::RequestLevel;
    use crate::testing::{png_bytes, FakeNetworkFetcher, InMemoryDiskCache, RecordingListener};

    const URI: &str = "https://example.com/a.png";

    fn pipeline(fetcher: Arc<FakeNetworkFetcher>) -> ImagePipeline {
        let config = Config::default();
        let mut caps = Capabilities::from_config(&config, Handle::current()).unwrap();
        caps.executors = Arc::new(InlineExecutorSupplier::new(Handle::current()));
        caps.network = fetcher;
        caps.disk_caches = DiskCachePartitions {
            main: Arc::new(InMemoryDiskCache::new("main")),
            small: Arc::new(InMemoryDiskCache::new("small")),
            small_image_threshold_px: 256,
        };
        ImagePipeline::new(config, caps)
    }

    #[tokio::test]
    async fn test_fetch_then_memory_hit() {
        let fetcher = Arc::new(FakeNetworkFetcher::new());
        fetcher.respond(URI, vec![png_bytes(5, 3)]);
        let pipeline = pipeline(Arc::clone(&fetcher));

        let first = pipeline
            .fetch_decoded_image(ImageRequest::from_uri(URI).unwrap())
            .await
            .unwrap();
        assert_eq!(first.origin(), Some(Origin::Network));
        assert!(pipeline.is_in_bitmap_memory_cache(&ImageRequest::from_uri(URI).unwrap()));

        let second = pipeline
            .fetch_decoded_image(ImageRequest::from_uri(URI).unwrap())
            .await
            .unwrap();
        assert_eq!(second.origin(), Some(Origin::MemoryCache));
        assert_eq!(second.payload().map(|i| i.width()), Some(5));
        assert_eq!(fetcher.requests(URI), 1);
    }

    #[tokio::test]
    async fn test_cache_only_request_misses_empty() {
        let fetcher = Arc::new(FakeNetworkFetcher::new());
        let pipeline = pipeline(Arc::clone(&fetcher));
        let request = ImageRequest::builder(URI)
            .unwrap()
            .lowest_permitted_level(RequestLevel::BitmapMemoryCache)
            .build();

        let outcome = pipeline.fetch_decoded_image(request).await.unwrap();
        assert!(matches!(outcome, Outcome::Empty { .. }));
        assert_eq!(fetcher.requests(URI), 0);
    }

    #[tokio::test]
    async fn test_listener_sees_request_lifecycle() {
        let fetcher = Arc::new(FakeNetworkFetcher::new());
        fetcher.fail(URI, 500);
        let listener = Arc::new(RecordingListener::default());
        let pipeline = pipeline(fetcher).with_listener(listener.clone());

        let result = pipeline
            .fetch_decoded_image(ImageRequest::from_uri(URI).unwrap())
            .await;
        assert!(matches!(result, Err(PipelineError::Network { .. })));

        let events = listener.events();
        assert_eq!(events.first().map(String::as_str), Some("request_start"));
        assert!(events.iter().any(|e| e == "request_failure"));
        assert!(!events.iter().any(|e| e == "request_success"));
    }

    #[tokio::test]
    async fn test_evict_clears_every_tier() {
        let fetcher = Arc::new(FakeNetworkFetcher::new());
        fetcher.respond(URI, vec![png_bytes(2, 2)]);
        let pipeline = pipeline(Arc::clone(&fetcher));
        let request = ImageRequest::from_uri(URI).unwrap();

        pipeline
            .prefetch_to_bitmap_cache(request.clone())
            .await
            .unwrap();
        // The disk write runs on its own task.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(pipeline.is_in_bitmap_memory_cache(&request));
        assert!(pipeline.is_in_disk_cache(&request).await);

        pipeline.evict(URI).await.unwrap();
        assert!(!pipeline.is_in_bitmap_memory_cache(&request));
        assert!(!pipeline.is_in_disk_cache(&request).await);
    }

    #[tokio::test]
    async fn test_video_has_no_encoded_fetch() {
        let pipeline = pipeline(Arc::new(FakeNetworkFetcher::new()));
        let result = pipeline
            .fetch_encoded_image(ImageRequest::from_uri("/tmp/clip.mp4").unwrap())
            .await;
        assert!(matches!(result, Err(PipelineError::UnsupportedOperation { .. })));
    }
}
