//! Transform stages over encoded images: metadata, resize/rotate and WebP
//! transcoding.

use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ImageFormat};

use crate::decoder::read_metadata;
use crate::error::PipelineError;
use crate::executor::Executor;
use crate::image::{EncodedImage, TransformMetadata};
use crate::memory::{BufferRef, PooledBufferFactory};
use crate::request::ImageRequest;

use super::base::{Consumer, ConsumerRef, Envelope, Producer, ProducerRef, TerminalGuard};
use super::context::ProducerContext;
use super::job::JobScheduler;

/// Fills in format, dimensions and EXIF rotation.
pub struct AddMetaProducer {
    next: ProducerRef<EncodedImage>,
}

impl AddMetaProducer {
    pub fn new(next: ProducerRef<EncodedImage>) -> Self {
        Self { next }
    }
}

impl Producer<EncodedImage> for AddMetaProducer {
    fn produce_results(&self, consumer: ConsumerRef<EncodedImage>, context: Arc<ProducerContext>) {
        self.next
            .produce_results(Arc::new(AddMetaConsumer { inner: consumer }), context);
    }

    fn name(&self) -> &'static str {
        "AddImageTransformMetaDataProducer"
    }
}

struct AddMetaConsumer {
    inner: ConsumerRef<EncodedImage>,
}

impl Consumer<EncodedImage> for AddMetaConsumer {
    fn on_new_result(&self, envelope: Envelope<EncodedImage>) {
        self.inner.on_new_result(envelope.map(|mut encoded| {
            if encoded.metadata.format.is_none() {
                encoded.metadata = read_metadata(encoded.buffer.as_slice());
            }
            encoded
        }));
    }

    fn on_failure(&self, error: PipelineError) {
        self.inner.on_failure(error);
    }

    fn on_cancellation(&self) {
        self.inner.on_cancellation();
    }

    fn on_progress_update(&self, progress: f32) {
        self.inner.on_progress_update(progress);
    }
}

/// Strips transform metadata, exposing the raw bytes.
pub struct RemoveMetaProducer {
    next: ProducerRef<EncodedImage>,
}

impl RemoveMetaProducer {
    pub fn new(next: ProducerRef<EncodedImage>) -> Self {
        Self { next }
    }
}

impl Producer<BufferRef> for RemoveMetaProducer {
    fn produce_results(&self, consumer: ConsumerRef<BufferRef>, context: Arc<ProducerContext>) {
        self.next
            .produce_results(Arc::new(RemoveMetaConsumer { inner: consumer }), context);
    }

    fn name(&self) -> &'static str {
        "RemoveImageTransformMetaDataProducer"
    }
}

struct RemoveMetaConsumer {
    inner: ConsumerRef<BufferRef>,
}

impl Consumer<EncodedImage> for RemoveMetaConsumer {
    fn on_new_result(&self, envelope: Envelope<EncodedImage>) {
        self.inner.on_new_result(envelope.map(|encoded| encoded.buffer));
    }

    fn on_failure(&self, error: PipelineError) {
        self.inner.on_failure(error);
    }

    fn on_cancellation(&self) {
        self.inner.on_cancellation();
    }

    fn on_progress_update(&self, progress: f32) {
        self.inner.on_progress_update(progress);
    }
}

/// Target size for downsampling, or `None` when the image already fits.
///
/// `width`/`height` are the stored dimensions; `rotation` is applied first.
pub fn downsampled_size(
    request: &ImageRequest,
    width: u32,
    height: u32,
    rotation: u32,
) -> Option<(u32, u32)> {
    let resize = request.resize()?;
    if width == 0 || height == 0 {
        return None;
    }
    let (rotated_w, rotated_h) = if rotation % 180 == 90 {
        (height, width)
    } else {
        (width, height)
    };
    let ratio = f64::max(
        f64::from(resize.width) / f64::from(rotated_w),
        f64::from(resize.height) / f64::from(rotated_h),
    );
    if ratio >= 1.0 {
        return None;
    }
    let scale = |side: u32| ((f64::from(side) * ratio).round() as u32).max(1);
    Some((scale(width), scale(height)))
}

fn rotate(image: DynamicImage, rotation: u32) -> DynamicImage {
    match rotation {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image,
    }
}

/// Downsamples and rotates JPEG bytes so the decoder handles fewer pixels.
///
/// Works on final results only unless `resize_intermediate_results` is set.
/// Non-JPEG formats pass through untouched.
pub struct ResizeAndRotateProducer {
    factory: PooledBufferFactory,
    executor: Arc<dyn Executor>,
    jpeg_quality: u8,
    resize_intermediate_results: bool,
    next: ProducerRef<EncodedImage>,
}

impl ResizeAndRotateProducer {
    pub fn new(
        factory: PooledBufferFactory,
        executor: Arc<dyn Executor>,
        jpeg_quality: u8,
        resize_intermediate_results: bool,
        next: ProducerRef<EncodedImage>,
    ) -> Self {
        Self {
            factory,
            executor,
            jpeg_quality,
            resize_intermediate_results,
            next,
        }
    }
}

impl Producer<EncodedImage> for ResizeAndRotateProducer {
    fn produce_results(&self, consumer: ConsumerRef<EncodedImage>, context: Arc<ProducerContext>) {
        let consumer = TerminalGuard::wrap(consumer);
        let scheduler = JobScheduler::new(Arc::clone(&self.executor)).fail_on_panic(
            Arc::clone(&consumer),
            Arc::clone(&context),
            self.name(),
        );
        let transforming = Arc::new(TransformingConsumer {
            factory: self.factory.clone(),
            scheduler,
            jpeg_quality: self.jpeg_quality,
            resize_intermediate_results: self.resize_intermediate_results,
            consumer,
            context: Arc::clone(&context),
        });
        self.next.produce_results(transforming, context);
    }

    fn name(&self) -> &'static str {
        "ResizeAndRotateProducer"
    }
}

struct TransformingConsumer {
    factory: PooledBufferFactory,
    scheduler: JobScheduler,
    jpeg_quality: u8,
    resize_intermediate_results: bool,
    consumer: Arc<TerminalGuard<EncodedImage>>,
    context: Arc<ProducerContext>,
}

/// Decode, downsample, rotate and re-encode as JPEG.
fn transcode_jpeg(
    factory: &PooledBufferFactory,
    encoded: &EncodedImage,
    target: Option<(u32, u32)>,
    rotation: u32,
    quality: u8,
) -> Result<EncodedImage, String> {
    let image = image::load_from_memory_with_format(encoded.buffer.as_slice(), ImageFormat::Jpeg)
        .map_err(|e| e.to_string())?;
    let image = match target {
        Some((w, h)) => image.thumbnail_exact(w, h),
        None => image,
    };
    let image = DynamicImage::ImageRgb8(rotate(image, rotation).to_rgb8());

    let mut writer = factory.writer(encoded.buffer.len());
    image
        .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, quality))
        .map_err(|e| e.to_string())?;
    let metadata = TransformMetadata {
        format: Some(ImageFormat::Jpeg),
        width: image.width(),
        height: image.height(),
        rotation: 0,
    };
    Ok(EncodedImage::new(writer.into_buffer(), metadata))
}

impl Consumer<EncodedImage> for TransformingConsumer {
    fn on_new_result(&self, envelope: Envelope<EncodedImage>) {
        let is_last = envelope.is_last();
        let needs_work = envelope.payload.as_ref().and_then(|encoded| {
            if !is_last && !self.resize_intermediate_results {
                return None;
            }
            let meta = encoded.metadata;
            if meta.format != Some(ImageFormat::Jpeg) {
                return None;
            }
            let request = self.context.request();
            let rotation = if request.auto_rotate() { meta.rotation } else { 0 };
            let target = downsampled_size(request, meta.width, meta.height, rotation);
            (target.is_some() || rotation != 0).then_some((target, rotation))
        });

        let consumer = Arc::clone(&self.consumer);
        let Some((target, rotation)) = needs_work else {
            self.scheduler
                .run_inline_or_schedule(Box::new(move || consumer.on_new_result(envelope)));
            return;
        };

        let factory = self.factory.clone();
        let quality = self.jpeg_quality;
        let context = Arc::clone(&self.context);
        self.scheduler.schedule(Box::new(move || {
            if context.is_cancelled() {
                if is_last {
                    consumer.on_cancellation();
                }
                return;
            }
            let Some(encoded) = envelope.payload.as_ref() else {
                return;
            };
            match transcode_jpeg(&factory, encoded, target, rotation, quality) {
                Ok(transformed) => {
                    tracing::trace!(
                        "Resized {} to {}x{} (rotation {rotation})",
                        context.request().uri(),
                        transformed.metadata.width,
                        transformed.metadata.height
                    );
                    consumer.on_new_result(Envelope {
                        payload: Some(transformed),
                        status: envelope.status,
                        origin: envelope.origin,
                    });
                }
                Err(message) if is_last => consumer.on_failure(PipelineError::Transform {
                    uri: context.request().uri(),
                    message,
                }),
                Err(message) => {
                    tracing::debug!("Skipping resize of partial result: {message}");
                    consumer.on_new_result(envelope);
                }
            }
        }));
    }

    fn on_failure(&self, error: PipelineError) {
        let consumer = Arc::clone(&self.consumer);
        self.scheduler
            .run_inline_or_schedule(Box::new(move || consumer.on_failure(error)));
    }

    fn on_cancellation(&self) {
        let consumer = Arc::clone(&self.consumer);
        self.scheduler
            .run_inline_or_schedule(Box::new(move || consumer.on_cancellation()));
    }

    fn on_progress_update(&self, progress: f32) {
        self.consumer.on_progress_update(progress);
    }
}

/// Re-encodes WebP bytes as PNG for decoders without WebP support.
pub struct WebpTranscodeProducer {
    factory: PooledBufferFactory,
    executor: Arc<dyn Executor>,
    next: ProducerRef<EncodedImage>,
}

impl WebpTranscodeProducer {
    pub fn new(
        factory: PooledBufferFactory,
        executor: Arc<dyn Executor>,
        next: ProducerRef<EncodedImage>,
    ) -> Self {
        Self {
            factory,
            executor,
            next,
        }
    }
}

impl Producer<EncodedImage> for WebpTranscodeProducer {
    fn produce_results(&self, consumer: ConsumerRef<EncodedImage>, context: Arc<ProducerContext>) {
        let consumer = TerminalGuard::wrap(consumer);
        let scheduler = JobScheduler::new(Arc::clone(&self.executor)).fail_on_panic(
            Arc::clone(&consumer),
            Arc::clone(&context),
            self.name(),
        );
        let transcoding = Arc::new(WebpConsumer {
            factory: self.factory.clone(),
            scheduler,
            consumer,
            context: Arc::clone(&context),
        });
        self.next.produce_results(transcoding, context);
    }

    fn name(&self) -> &'static str {
        "WebpTranscodeProducer"
    }
}

struct WebpConsumer {
    factory: PooledBufferFactory,
    scheduler: JobScheduler,
    consumer: Arc<TerminalGuard<EncodedImage>>,
    context: Arc<ProducerContext>,
}

fn is_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}

fn transcode_webp(factory: &PooledBufferFactory, bytes: &[u8]) -> Result<BufferRef, String> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::WebP)
        .map_err(|e| e.to_string())?;
    let mut writer = factory.writer(bytes.len() * 2);
    image
        .write_with_encoder(PngEncoder::new(&mut writer))
        .map_err(|e| e.to_string())?;
    Ok(writer.into_buffer())
}

impl Consumer<EncodedImage> for WebpConsumer {
    fn on_new_result(&self, envelope: Envelope<EncodedImage>) {
        let consumer = Arc::clone(&self.consumer);
        let webp = envelope
            .payload
            .as_ref()
            .is_some_and(|e| is_webp(e.buffer.as_slice()));
        if !webp {
            self.scheduler
                .run_inline_or_schedule(Box::new(move || consumer.on_new_result(envelope)));
            return;
        }
        if !envelope.is_last() {
            // Partial WebP data cannot be transcoded.
            return;
        }

        let factory = self.factory.clone();
        let context = Arc::clone(&self.context);
        self.scheduler.schedule(Box::new(move || {
            if context.is_cancelled() {
                consumer.on_cancellation();
                return;
            }
            let Some(encoded) = envelope.payload.as_ref() else {
                return;
            };
            match transcode_webp(&factory, encoded.buffer.as_slice()) {
                Ok(buffer) => {
                    let transcoded = EncodedImage::new(buffer, TransformMetadata::default());
                    consumer.on_new_result(Envelope::final_result(transcoded, envelope.origin));
                }
                Err(message) => consumer.on_failure(PipelineError::Transform {
                    uri: context.request().uri(),
                    message,
                }),
            }
        }));
    }

    fn on_failure(&self, error: PipelineError) {
        let consumer = Arc::clone(&self.consumer);
        self.scheduler
            .run_inline_or_schedule(Box::new(move || consumer.on_failure(error)));
    }

    fn on_cancellation(&self) {
        let consumer = Arc::clone(&self.consumer);
        self.scheduler
            .run_inline_or_schedule(Box::new(move || consumer.on_cancellation()));
    }

    fn on_progress_update(&self, progress: f32) {
        self.consumer.on_progress_update(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use crate::producers::base::{Origin, Status};
    use crate::testing::{
        jpeg_bytes, png_bytes, test_buffer, test_context, test_context_for, webp_bytes,
        ManualExecutor, RecordingConsumer, StaticProducer, TrackingPool,
    };

    const URI: &str = "https://example.com/a.jpg";

    fn raw(bytes: Vec<u8>) -> EncodedImage {
        EncodedImage::new(test_buffer(&bytes), TransformMetadata::default())
    }

    fn resize_over(
        upstream: Arc<StaticProducer<EncodedImage>>,
    ) -> ResizeAndRotateProducer {
        ResizeAndRotateProducer::new(
            PooledBufferFactory::new(Arc::new(TrackingPool::default())),
            Arc::new(InlineExecutor),
            85,
            false,
            Arc::new(AddMetaProducer::new(upstream)),
        )
    }

    #[test]
    fn test_add_meta_reads_header() {
        let upstream = StaticProducer::final_result(raw(png_bytes(9, 5)), Origin::Local);
        let producer = AddMetaProducer::new(upstream);
        let consumer = RecordingConsumer::<EncodedImage>::new();
        producer.produce_results(consumer.clone(), test_context(URI));

        let meta = consumer.payloads()[0].metadata;
        assert_eq!(meta.format, Some(ImageFormat::Png));
        assert_eq!((meta.width, meta.height), (9, 5));
    }

    #[test]
    fn test_downsampled_size() {
        let request = ImageRequest::builder(URI).unwrap().resize(50, 50).build();
        assert_eq!(downsampled_size(&request, 200, 100, 0), Some((100, 50)));
        assert_eq!(downsampled_size(&request, 40, 40, 0), None);
        assert_eq!(downsampled_size(&request, 100, 400, 90), Some((50, 200)));
        let r#unsized = ImageRequest::from_uri(URI).unwrap();
        assert_eq!(downsampled_size(&r#unsized, 200, 100, 0), None);
    }

    #[test]
    fn test_large_jpeg_is_downsampled() {
        let upstream = StaticProducer::final_result(raw(jpeg_bytes(200, 100)), Origin::Network);
        let request = ImageRequest::builder(URI).unwrap().resize(50, 50).build();
        let consumer = RecordingConsumer::<EncodedImage>::new();
        resize_over(upstream).produce_results(consumer.clone(), test_context_for(request, false));

        let encoded = &consumer.payloads()[0];
        assert_eq!((encoded.metadata.width, encoded.metadata.height), (100, 50));
        assert_eq!(encoded.metadata.rotation, 0);
        assert_eq!(consumer.last_origin(), Some(Origin::Network));
        let decoded = image::load_from_memory(encoded.buffer.as_slice()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
    }

    #[test]
    fn test_small_jpeg_passes_through() {
        let bytes = jpeg_bytes(20, 20);
        let upstream = StaticProducer::final_result(raw(bytes.clone()), Origin::Network);
        let request = ImageRequest::builder(URI).unwrap().resize(50, 50).build();
        let consumer = RecordingConsumer::<EncodedImage>::new();
        resize_over(upstream).produce_results(consumer.clone(), test_context_for(request, false));

        assert_eq!(consumer.payloads()[0].buffer.as_slice(), bytes.as_slice());
    }

    #[test]
    fn test_pass_through_skips_the_executor() {
        let bytes = png_bytes(20, 20);
        let upstream = StaticProducer::final_result(raw(bytes.clone()), Origin::Network);
        let executor = Arc::new(ManualExecutor::default());
        let producer = ResizeAndRotateProducer::new(
            PooledBufferFactory::new(Arc::new(TrackingPool::default())),
            executor.clone(),
            85,
            false,
            Arc::new(AddMetaProducer::new(upstream)),
        );
        let consumer = RecordingConsumer::<EncodedImage>::new();
        producer.produce_results(consumer.clone(), test_context(URI));

        assert_eq!(executor.pending(), 0);
        assert_eq!(consumer.statuses(), vec![Status::Final]);
        assert_eq!(consumer.payloads()[0].buffer.as_slice(), bytes.as_slice());
    }

    #[test]
    fn test_intermediate_results_are_untouched() {
        let bytes = jpeg_bytes(200, 100);
        let upstream = StaticProducer::with_envelopes(vec![
            Envelope::intermediate(raw(bytes.clone()), Origin::Network),
            Envelope::final_result(raw(bytes.clone()), Origin::Network),
        ]);
        let request = ImageRequest::builder(URI).unwrap().resize(50, 50).build();
        let consumer = RecordingConsumer::<EncodedImage>::new();
        resize_over(upstream).produce_results(consumer.clone(), test_context_for(request, false));

        assert_eq!(consumer.statuses(), vec![Status::Intermediate, Status::Final]);
        assert_eq!(consumer.payloads()[0].buffer.as_slice(), bytes.as_slice());
        assert_eq!(consumer.payloads()[1].metadata.width, 100);
    }

    #[test]
    fn test_remove_meta_yields_bytes() {
        let upstream = StaticProducer::final_result(raw(b"abc".to_vec()), Origin::Network);
        let producer = RemoveMetaProducer::new(upstream);
        let consumer = RecordingConsumer::<BufferRef>::new();
        producer.produce_results(consumer.clone(), test_context(URI));
        assert_eq!(consumer.payloads()[0].as_slice(), b"abc");
    }

    #[test]
    fn test_webp_final_becomes_png() {
        let upstream = StaticProducer::final_result(raw(webp_bytes(4, 4)), Origin::Network);
        let producer = WebpTranscodeProducer::new(
            PooledBufferFactory::new(Arc::new(TrackingPool::default())),
            Arc::new(InlineExecutor),
            upstream,
        );
        let consumer = RecordingConsumer::<EncodedImage>::new();
        producer.produce_results(consumer.clone(), test_context(URI));

        let bytes = consumer.payloads()[0].buffer.as_slice().to_vec();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
    }
}
