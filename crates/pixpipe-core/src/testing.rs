//! Test doubles shared by unit and integration tests.
//!
//! Everything here is deterministic and in-memory. Helpers panic on misuse
//! since they only ever run inside tests.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::cache::{CacheKey, DiskCache};
use crate::decoder::ImageDecoder;
use crate::error::{CacheError, PipelineError};
use crate::executor::{Executor, Job};
use crate::image::{CloseableImage, ImageRef, QualityInfo};
use crate::memory::{BufferPool, BufferRef, PooledBufferFactory, SharedBufferPool};
use crate::producers::base::{Consumer, ConsumerRef, Envelope, Origin, Producer, Status};
use crate::producers::context::{ContextSettings, ProducerContext};
use crate::producers::listener::{NoopRequestListener, RequestListener};
use crate::request::ImageRequest;
use crate::source::{FetchResponse, NetworkFetcher};

pub use crate::executor::InlineExecutorSupplier;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Context for a default request to `uri`.
pub fn test_context(uri: &str) -> Arc<ProducerContext> {
    let request = ImageRequest::from_uri(uri).expect("test uri should parse");
    test_context_for(request, false)
}

pub fn test_context_for(request: ImageRequest, is_prefetch: bool) -> Arc<ProducerContext> {
    let settings = ContextSettings::for_request(&request, is_prefetch);
    let id = format!("test-{}", NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
    ProducerContext::new(id, Arc::new(request), Arc::new(NoopRequestListener), settings)
}

/// Pooled copy of `bytes` from a throwaway pool.
pub fn test_buffer(bytes: &[u8]) -> BufferRef {
    PooledBufferFactory::new(Arc::new(SharedBufferPool::default())).from_slice(bytes)
}

/// Black full-quality image.
pub fn test_image(width: u32, height: u32) -> ImageRef {
    CloseableImage::full(DynamicImage::new_rgb8(width, height))
}

fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, 128])
    }))
}

fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    gradient(width, height)
        .write_to(&mut out, format)
        .expect("in-memory encode should succeed");
    out.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Png)
}

/// Baseline JPEG.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Jpeg)
}

/// Lossless WebP.
pub fn webp_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::WebP)
}

/// Marker skeleton of a progressive JPEG with `scans` scans.
///
/// Returns the bytes and, for each scan, the offset of the marker that ends
/// it. The last entry is the offset of EOI, which is the final two bytes.
/// The entropy data is filler, so only the marker parser can use this.
pub fn synthetic_progressive_jpeg(scans: usize) -> (Vec<u8>, Vec<usize>) {
    let mut bytes = vec![0xFF, 0xD8];
    // SOF2: 8-bit, 8x8, one component.
    bytes.extend_from_slice(&[
        0xFF, 0xC2, 0x00, 0x0B, 0x08, 0x00, 0x08, 0x00, 0x08, 0x01, 0x01, 0x11, 0x00,
    ]);
    let mut scan_ends = Vec::with_capacity(scans);
    for scan in 0..scans {
        if scan > 0 {
            scan_ends.push(bytes.len());
        }
        bytes.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
        // Entropy-coded filler with an escaped 0xFF and a restart marker.
        bytes.extend_from_slice(&[0x12, 0x34, 0xFF, 0x00, 0x56, 0xFF, 0xD0, 0x78]);
    }
    scan_ends.push(bytes.len());
    bytes.extend_from_slice(&[0xFF, 0xD9]);
    (bytes, scan_ends)
}

/// Pool that counts acquisitions and releases.
#[derive(Default)]
pub struct TrackingPool {
    requested: Mutex<Vec<usize>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl TrackingPool {
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.acquired.load(Ordering::SeqCst) - self.released()
    }

    pub fn requested_capacities(&self) -> Vec<usize> {
        lock(&self.requested).clone()
    }
}

impl BufferPool for TrackingPool {
    fn acquire(&self, capacity: usize) -> Vec<u8> {
        lock(&self.requested).push(capacity);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Vec::with_capacity(capacity)
    }

    fn release(&self, _buffer: Vec<u8>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum Recorded<T> {
    Result(Envelope<T>),
    Failure(PipelineError),
    Cancellation,
    Progress(f32),
}

/// Consumer that records every callback.
pub struct RecordingConsumer<T> {
    events: Mutex<Vec<Recorded<T>>>,
}

impl<T: Clone + Send + 'static> RecordingConsumer<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn envelopes(&self) -> Vec<Envelope<T>> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                Recorded::Result(envelope) => Some(envelope.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn payloads(&self) -> Vec<T> {
        self.envelopes()
            .into_iter()
            .filter_map(|e| e.payload)
            .collect()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.envelopes().iter().map(|e| e.status).collect()
    }

    pub fn last_status(&self) -> Option<Status> {
        self.envelopes().last().map(|e| e.status)
    }

    pub fn last_origin(&self) -> Option<Origin> {
        self.envelopes().last().map(|e| e.origin)
    }

    pub fn failure(&self) -> Option<PipelineError> {
        lock(&self.events).iter().find_map(|e| match e {
            Recorded::Failure(error) => Some(error.clone()),
            _ => None,
        })
    }

    pub fn was_cancelled(&self) -> bool {
        lock(&self.events)
            .iter()
            .any(|e| matches!(e, Recorded::Cancellation))
    }

    pub fn progress_updates(&self) -> Vec<f32> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                Recorded::Progress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| match e {
                Recorded::Result(envelope) => envelope.is_last(),
                Recorded::Failure(_) | Recorded::Cancellation => true,
                Recorded::Progress(_) => false,
            })
            .count()
    }

    /// Wait up to five seconds for a terminal callback.
    pub async fn wait_for_terminal(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.terminal_count() == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no terminal callback within five seconds"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl<T: Send + 'static> Consumer<T> for RecordingConsumer<T> {
    fn on_new_result(&self, envelope: Envelope<T>) {
        lock(&self.events).push(Recorded::Result(envelope));
    }

    fn on_failure(&self, error: PipelineError) {
        lock(&self.events).push(Recorded::Failure(error));
    }

    fn on_cancellation(&self) {
        lock(&self.events).push(Recorded::Cancellation);
    }

    fn on_progress_update(&self, progress: f32) {
        lock(&self.events).push(Recorded::Progress(progress));
    }
}

/// Listener that records producer and request events as strings such as
/// `start:NetworkFetchProducer` or `request_success`.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    fn push(&self, event: String) {
        lock(&self.events).push(event);
    }
}

impl RequestListener for RecordingListener {
    fn on_request_start(&self, _request: &ImageRequest, _request_id: &str, _is_prefetch: bool) {
        self.push("request_start".into());
    }

    fn on_request_success(&self, _request: &ImageRequest, _request_id: &str, _is_prefetch: bool) {
        self.push("request_success".into());
    }

    fn on_request_failure(
        &self,
        _request: &ImageRequest,
        _request_id: &str,
        _error: &PipelineError,
        _is_prefetch: bool,
    ) {
        self.push("request_failure".into());
    }

    fn on_request_cancellation(&self, _request_id: &str) {
        self.push("request_cancellation".into());
    }

    fn on_producer_start(&self, _request_id: &str, producer: &str) {
        self.push(format!("start:{producer}"));
    }

    fn on_producer_event(&self, _request_id: &str, producer: &str, event: &str) {
        self.push(format!("event:{producer}:{event}"));
    }

    fn on_producer_finish_with_success(
        &self,
        _request_id: &str,
        producer: &str,
        _extra: &[(&'static str, String)],
    ) {
        self.push(format!("success:{producer}"));
    }

    fn on_producer_finish_with_failure(
        &self,
        _request_id: &str,
        producer: &str,
        _error: &PipelineError,
    ) {
        self.push(format!("failure:{producer}"));
    }

    fn on_producer_finish_with_cancellation(&self, _request_id: &str, producer: &str) {
        self.push(format!("cancel:{producer}"));
    }
}

/// Producer driven by the test: every call is recorded and results are
/// delivered by index.
pub struct ManualProducer<T> {
    calls: Mutex<Vec<(ConsumerRef<T>, Arc<ProducerContext>)>>,
}

impl<T: Send + 'static> ManualProducer<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Number of productions started so far.
    pub fn started(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn context(&self, index: usize) -> Arc<ProducerContext> {
        Arc::clone(&lock(&self.calls)[index].1)
    }

    fn consumer(&self, index: usize) -> ConsumerRef<T> {
        Arc::clone(&lock(&self.calls)[index].0)
    }

    pub fn deliver(&self, index: usize, envelope: Envelope<T>) {
        self.consumer(index).on_new_result(envelope);
    }

    pub fn fail(&self, index: usize, error: PipelineError) {
        self.consumer(index).on_failure(error);
    }

    pub fn cancel_downstream(&self, index: usize) {
        self.consumer(index).on_cancellation();
    }

    pub fn progress(&self, index: usize, progress: f32) {
        self.consumer(index).on_progress_update(progress);
    }
}

impl<T: Send + 'static> Producer<T> for ManualProducer<T> {
    fn produce_results(&self, consumer: ConsumerRef<T>, context: Arc<ProducerContext>) {
        lock(&self.calls).push((consumer, context));
    }

    fn name(&self) -> &'static str {
        "ManualProducer"
    }
}

/// Producer that answers every request with the same envelopes.
pub struct StaticProducer<T> {
    envelopes: Vec<Envelope<T>>,
    requested: Mutex<Vec<String>>,
}

impl<T: Clone + Send + Sync + 'static> StaticProducer<T> {
    pub fn final_result(payload: T, origin: Origin) -> Arc<Self> {
        Self::with_envelopes(vec![Envelope::final_result(payload, origin)])
    }

    pub fn with_envelopes(envelopes: Vec<Envelope<T>>) -> Arc<Self> {
        Arc::new(Self {
            envelopes,
            requested: Mutex::new(Vec::new()),
        })
    }

    pub fn invocations(&self) -> usize {
        lock(&self.requested).len()
    }

    /// URIs of the requests this producer was asked for, in order.
    pub fn requested_uris(&self) -> Vec<String> {
        lock(&self.requested).clone()
    }
}

impl<T: Clone + Send + Sync + 'static> Producer<T> for StaticProducer<T> {
    fn produce_results(&self, consumer: ConsumerRef<T>, context: Arc<ProducerContext>) {
        lock(&self.requested).push(context.request().uri());
        for envelope in &self.envelopes {
            consumer.on_new_result(envelope.clone());
        }
    }

    fn name(&self) -> &'static str {
        "StaticProducer"
    }
}

/// Decoder that ignores its input and returns a black image.
pub struct FixedImageDecoder {
    width: u32,
    height: u32,
    calls: AtomicUsize,
}

impl FixedImageDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageDecoder for FixedImageDecoder {
    fn decode(
        &self,
        _uri: &str,
        _bytes: &[u8],
        _quality: QualityInfo,
    ) -> Result<DynamicImage, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DynamicImage::new_rgb8(self.width, self.height))
    }
}

enum FakeResponse {
    Body { chunks: Vec<Vec<u8>>, delay: Duration },
    Status(u16),
}

/// Network fetcher serving canned responses. Unknown URIs answer 404.
#[derive(Default)]
pub struct FakeNetworkFetcher {
    responses: Mutex<HashMap<String, FakeResponse>>,
    requests: Mutex<HashMap<String, usize>>,
    advertised_lengths: Mutex<HashMap<String, u64>>,
}

impl FakeNetworkFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, uri: &str, chunks: Vec<Vec<u8>>) {
        self.respond_slowly(uri, chunks, Duration::ZERO);
    }

    /// Serve `chunks`, sleeping `delay` before each one.
    pub fn respond_slowly(&self, uri: &str, chunks: Vec<Vec<u8>>, delay: Duration) {
        lock(&self.responses).insert(uri.to_string(), FakeResponse::Body { chunks, delay });
    }

    pub fn fail(&self, uri: &str, status: u16) {
        lock(&self.responses).insert(uri.to_string(), FakeResponse::Status(status));
    }

    /// Report `length` as the content length of `uri`, whatever the body.
    pub fn advertise_length(&self, uri: &str, length: u64) {
        lock(&self.advertised_lengths).insert(uri.to_string(), length);
    }

    /// Times `uri` was fetched.
    pub fn requests(&self, uri: &str) -> usize {
        lock(&self.requests).get(uri).copied().unwrap_or(0)
    }
}

#[async_trait]
impl NetworkFetcher for FakeNetworkFetcher {
    async fn fetch(&self, uri: &str) -> Result<FetchResponse, PipelineError> {
        *lock(&self.requests).entry(uri.to_string()).or_insert(0) += 1;
        let (chunks, delay) = match lock(&self.responses).get(uri) {
            Some(FakeResponse::Body { chunks, delay }) => (chunks.clone(), *delay),
            Some(FakeResponse::Status(status)) => {
                return Err(PipelineError::Network {
                    uri: uri.to_string(),
                    status_code: Some(*status),
                    message: format!("HTTP {status}"),
                })
            }
            None => {
                return Err(PipelineError::Network {
                    uri: uri.to_string(),
                    status_code: Some(404),
                    message: "HTTP 404".to_string(),
                })
            }
        };
        let content_length = lock(&self.advertised_lengths)
            .get(uri)
            .copied()
            .or_else(|| Some(chunks.iter().map(|c| c.len() as u64).sum()));
        let body = futures_util::stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, io::Error>(chunk)
            })
            .boxed();
        Ok(FetchResponse {
            content_length,
            body,
        })
    }
}

/// Disk cache partition held in a map.
pub struct InMemoryDiskCache {
    name: &'static str,
    entries: Mutex<HashMap<CacheKey, BufferRef>>,
    fail_reads: AtomicBool,
}

impl InMemoryDiskCache {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Make every `get` fail with an I/O error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DiskCache for InMemoryDiskCache {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<BufferRef>, CacheError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Io {
                tier: self.name,
                source: io::Error::other("injected read failure"),
            });
        }
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, buffer: BufferRef) -> Result<(), CacheError> {
        lock(&self.entries).insert(key.clone(), buffer);
        Ok(())
    }

    async fn contains(&self, key: &CacheKey) -> bool {
        lock(&self.entries).contains_key(key)
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        lock(&self.entries).clear();
        Ok(())
    }
}

/// Executor that queues jobs until the test runs them.
#[derive(Default)]
pub struct ManualExecutor {
    queued: Mutex<Vec<Job>>,
}

impl ManualExecutor {
    /// Run queued jobs, including ones queued while running, until none remain.
    pub fn run_all(&self) {
        loop {
            let jobs = std::mem::take(&mut *lock(&self.queued));
            if jobs.is_empty() {
                return;
            }
            for job in jobs {
                job();
            }
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.queued).len()
    }
}

impl Executor for ManualExecutor {
    fn name(&self) -> &str {
        "manual"
    }

    fn execute(&self, job: Job) {
        lock(&self.queued).push(job);
    }
}
