//! Memory cache read-through / write-through stages.

use std::sync::Arc;

use crate::cache::{BitmapCacheKey, CacheKey, CacheKeyFactory, MemoryCache};
use crate::error::PipelineError;
use crate::image::{EncodedImage, ImageRef, TransformMetadata};
use crate::memory::BufferRef;
use crate::request::RequestLevel;

use super::base::{Consumer, ConsumerRef, Envelope, Origin, Producer, ProducerRef, Status};
use super::context::ProducerContext;

pub type BitmapMemoryCache = Arc<dyn MemoryCache<BitmapCacheKey, ImageRef>>;
pub type EncodedMemoryCache = Arc<dyn MemoryCache<CacheKey, BufferRef>>;

/// Which bitmap key a stage reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapKeyKind {
    Plain,
    Postprocessed,
}

impl BitmapKeyKind {
    fn key(self, keys: &dyn CacheKeyFactory, ctx: &ProducerContext) -> BitmapCacheKey {
        match self {
            Self::Plain => keys.bitmap_cache_key(ctx.request()),
            Self::Postprocessed => keys.postprocessed_bitmap_cache_key(ctx.request()),
        }
    }
}

fn report_lookup(ctx: &ProducerContext, producer: &'static str, found: bool) {
    ctx.listener().on_producer_finish_with_success(
        ctx.id(),
        producer,
        &[("cached_value_found", found.to_string())],
    );
}

/// Decoded-image cache stage: look up, and on a miss store the final image
/// produced downstream.
pub struct BitmapMemoryCacheProducer {
    cache: BitmapMemoryCache,
    keys: Arc<dyn CacheKeyFactory>,
    kind: BitmapKeyKind,
    next: ProducerRef<ImageRef>,
}

impl BitmapMemoryCacheProducer {
    pub fn new(
        cache: BitmapMemoryCache,
        keys: Arc<dyn CacheKeyFactory>,
        kind: BitmapKeyKind,
        next: ProducerRef<ImageRef>,
    ) -> Self {
        Self {
            cache,
            keys,
            kind,
            next,
        }
    }
}

impl Producer<ImageRef> for BitmapMemoryCacheProducer {
    fn produce_results(&self, consumer: ConsumerRef<ImageRef>, context: Arc<ProducerContext>) {
        let name = self.name();
        context.listener().on_producer_start(context.id(), name);
        let key = self.kind.key(self.keys.as_ref(), &context);

        if let Some(image) = self.cache.get(&key) {
            report_lookup(&context, name, true);
            if image.quality().is_full_quality {
                consumer.on_new_result(Envelope::final_result(image, Origin::MemoryCache));
                return;
            }
            // A partial image is shown while the full one loads.
            consumer.on_new_result(Envelope::intermediate(image, Origin::MemoryCache));
        }

        if context.lowest_permitted_level() >= RequestLevel::BitmapMemoryCache {
            report_lookup(&context, name, false);
            consumer.on_new_result(Envelope::no_result(Origin::MemoryCache));
            return;
        }

        let writer = Arc::new(BitmapCachingConsumer {
            cache: Arc::clone(&self.cache),
            key,
            inner: consumer,
        });
        self.next.produce_results(writer, context);
    }

    fn name(&self) -> &'static str {
        match self.kind {
            BitmapKeyKind::Plain => "BitmapMemoryCacheProducer",
            BitmapKeyKind::Postprocessed => "PostprocessedBitmapMemoryCacheProducer",
        }
    }
}

struct BitmapCachingConsumer {
    cache: BitmapMemoryCache,
    key: BitmapCacheKey,
    inner: ConsumerRef<ImageRef>,
}

impl Consumer<ImageRef> for BitmapCachingConsumer {
    fn on_new_result(&self, envelope: Envelope<ImageRef>) {
        if envelope.status == Status::Final {
            if let Some(image) = envelope.payload.as_ref() {
                if image.quality().is_full_quality {
                    self.cache.cache(self.key.clone(), Arc::clone(image));
                }
            }
        }
        self.inner.on_new_result(envelope);
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

/// Probe-only decoded-image stage placed before the background hand-off so
/// hits are served on the caller's thread.
pub struct BitmapMemoryCacheGetProducer {
    cache: BitmapMemoryCache,
    keys: Arc<dyn CacheKeyFactory>,
    next: ProducerRef<ImageRef>,
}

impl BitmapMemoryCacheGetProducer {
    pub fn new(
        cache: BitmapMemoryCache,
        keys: Arc<dyn CacheKeyFactory>,
        next: ProducerRef<ImageRef>,
    ) -> Self {
        Self { cache, keys, next }
    }
}

impl Producer<ImageRef> for BitmapMemoryCacheGetProducer {
    fn produce_results(&self, consumer: ConsumerRef<ImageRef>, context: Arc<ProducerContext>) {
        let name = self.name();
        context.listener().on_producer_start(context.id(), name);
        let key = self.keys.bitmap_cache_key(context.request());

        match self.cache.get(&key) {
            Some(image) if image.quality().is_full_quality => {
                report_lookup(&context, name, true);
                consumer.on_new_result(Envelope::final_result(image, Origin::MemoryCache));
            }
            _ if context.lowest_permitted_level() >= RequestLevel::BitmapMemoryCache => {
                report_lookup(&context, name, false);
                consumer.on_new_result(Envelope::no_result(Origin::MemoryCache));
            }
            _ => {
                report_lookup(&context, name, false);
                self.next.produce_results(consumer, context);
            }
        }
    }

    fn name(&self) -> &'static str {
        "BitmapMemoryCacheGetProducer"
    }
}

/// Encoded-bytes cache stage.
pub struct EncodedMemoryCacheProducer {
    cache: EncodedMemoryCache,
    keys: Arc<dyn CacheKeyFactory>,
    next: ProducerRef<EncodedImage>,
}

impl EncodedMemoryCacheProducer {
    pub fn new(
        cache: EncodedMemoryCache,
        keys: Arc<dyn CacheKeyFactory>,
        next: ProducerRef<EncodedImage>,
    ) -> Self {
        Self { cache, keys, next }
    }
}

impl Producer<EncodedImage> for EncodedMemoryCacheProducer {
    fn produce_results(&self, consumer: ConsumerRef<EncodedImage>, context: Arc<ProducerContext>) {
        let name = self.name();
        context.listener().on_producer_start(context.id(), name);
        let key = self.keys.encoded_cache_key(context.request());

        if let Some(buffer) = self.cache.get(&key) {
            report_lookup(&context, name, true);
            let encoded = EncodedImage::new(buffer, TransformMetadata::default());
            consumer.on_new_result(Envelope::final_result(encoded, Origin::MemoryCache));
            return;
        }

        report_lookup(&context, name, false);
        if context.lowest_permitted_level() >= RequestLevel::EncodedMemoryCache {
            consumer.on_new_result(Envelope::no_result(Origin::MemoryCache));
            return;
        }

        let writer = Arc::new(EncodedCachingConsumer {
            cache: Arc::clone(&self.cache),
            key,
            inner: consumer,
        });
        self.next.produce_results(writer, context);
    }

    fn name(&self) -> &'static str {
        "EncodedMemoryCacheProducer"
    }
}

struct EncodedCachingConsumer {
    cache: EncodedMemoryCache,
    key: CacheKey,
    inner: ConsumerRef<EncodedImage>,
}

impl Consumer<EncodedImage> for EncodedCachingConsumer {
    fn on_new_result(&self, envelope: Envelope<EncodedImage>) {
        if envelope.status == Status::Final {
            if let Some(encoded) = envelope.payload.as_ref() {
                self.cache.cache(self.key.clone(), Arc::clone(&encoded.buffer));
            }
        }
        self.inner.on_new_result(envelope);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DefaultCacheKeyFactory, LruMemoryCache};
    use crate::image::{CloseableImage, QualityInfo};
    use crate::request::ImageRequest;
    use crate::testing::{
        test_buffer, test_context, test_context_for, test_image, RecordingConsumer, StaticProducer,
    };

    const URI: &str = "https://example.com/a.jpg";

    fn bitmap_cache() -> BitmapMemoryCache {
        Arc::new(LruMemoryCache::new("bitmap", 16, 1 << 24))
    }

    fn encoded_cache() -> EncodedMemoryCache {
        Arc::new(LruMemoryCache::new("encoded", 16, 1 << 24))
    }

    #[test]
    fn test_bitmap_hit_skips_downstream() {
        let cache = bitmap_cache();
        let keys: Arc<dyn CacheKeyFactory> = Arc::new(DefaultCacheKeyFactory);
        let request = ImageRequest::from_uri(URI).unwrap();
        cache.cache(keys.bitmap_cache_key(&request), test_image(4, 4));

        let downstream = StaticProducer::final_result(test_image(8, 8), Origin::Network);
        let producer = BitmapMemoryCacheProducer::new(
            Arc::clone(&cache),
            keys,
            BitmapKeyKind::Plain,
            downstream.clone(),
        );
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce_results(consumer.clone(), test_context(URI));

        assert_eq!(downstream.invocations(), 0);
        assert_eq!(consumer.last_origin(), Some(Origin::MemoryCache));
        assert_eq!(consumer.last_status(), Some(Status::Final));
        assert_eq!(consumer.payloads()[0].width(), 4);
    }

    #[test]
    fn test_bitmap_miss_writes_through() {
        let cache = bitmap_cache();
        let keys: Arc<dyn CacheKeyFactory> = Arc::new(DefaultCacheKeyFactory);
        let downstream = StaticProducer::final_result(test_image(8, 8), Origin::Network);
        let producer = BitmapMemoryCacheProducer::new(
            Arc::clone(&cache),
            Arc::clone(&keys),
            BitmapKeyKind::Plain,
            downstream.clone(),
        );
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce_results(consumer.clone(), test_context(URI));

        assert_eq!(downstream.invocations(), 1);
        assert_eq!(consumer.last_origin(), Some(Origin::Network));
        let request = ImageRequest::from_uri(URI).unwrap();
        let cached = cache.get(&keys.bitmap_cache_key(&request)).unwrap();
        assert!(Arc::ptr_eq(&cached, &consumer.payloads()[0]));
    }

    #[test]
    fn test_partial_hit_is_intermediate_and_continues() {
        let cache = bitmap_cache();
        let keys: Arc<dyn CacheKeyFactory> = Arc::new(DefaultCacheKeyFactory);
        let request = ImageRequest::from_uri(URI).unwrap();
        let partial = Arc::new(CloseableImage::new(
            image::DynamicImage::new_rgb8(2, 2),
            0,
            QualityInfo {
                scan_number: 1,
                is_good_enough: false,
                is_full_quality: false,
            },
        ));
        cache.cache(keys.bitmap_cache_key(&request), partial);

        let downstream = StaticProducer::final_result(test_image(8, 8), Origin::Network);
        let producer =
            BitmapMemoryCacheProducer::new(cache, keys, BitmapKeyKind::Plain, downstream.clone());
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce_results(consumer.clone(), test_context(URI));

        assert_eq!(downstream.invocations(), 1);
        assert_eq!(
            consumer.statuses(),
            vec![Status::Intermediate, Status::Final]
        );
    }

    #[test]
    fn test_lowest_level_stops_at_bitmap_cache() {
        let request = ImageRequest::builder(URI)
            .unwrap()
            .lowest_permitted_level(RequestLevel::BitmapMemoryCache)
            .build();
        let downstream = StaticProducer::final_result(test_image(8, 8), Origin::Network);
        let producer = BitmapMemoryCacheGetProducer::new(
            bitmap_cache(),
            Arc::new(DefaultCacheKeyFactory),
            downstream.clone(),
        );
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce_results(consumer.clone(), test_context_for(request, false));

        assert_eq!(downstream.invocations(), 0);
        assert_eq!(consumer.last_status(), Some(Status::NoResult));
        assert_eq!(consumer.terminal_count(), 1);
    }

    #[test]
    fn test_encoded_miss_then_hit() {
        let cache = encoded_cache();
        let keys: Arc<dyn CacheKeyFactory> = Arc::new(DefaultCacheKeyFactory);
        let downstream = StaticProducer::final_result(
            EncodedImage::new(test_buffer(b"jpeg-bytes"), TransformMetadata::default()),
            Origin::Network,
        );
        let producer =
            EncodedMemoryCacheProducer::new(Arc::clone(&cache), keys, downstream.clone());

        let first = RecordingConsumer::<EncodedImage>::new();
        producer.produce_results(first.clone(), test_context(URI));
        let second = RecordingConsumer::<EncodedImage>::new();
        producer.produce_results(second.clone(), test_context(URI));

        assert_eq!(downstream.invocations(), 1);
        assert_eq!(first.last_origin(), Some(Origin::Network));
        assert_eq!(second.last_origin(), Some(Origin::MemoryCache));
        assert_eq!(second.payloads()[0].buffer.as_slice(), b"jpeg-bytes");
    }
}
