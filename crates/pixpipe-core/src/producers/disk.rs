//! Disk cache read-through / write-through stage.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::cache::{CacheKey, CacheKeyFactory, DiskCache};
use crate::error::PipelineError;
use crate::image::{EncodedImage, TransformMetadata};
use crate::request::{CacheChoice, ImageRequest, RequestLevel};

use super::base::{Consumer, ConsumerRef, Envelope, Origin, Producer, ProducerRef, Status};
use super::context::ProducerContext;

/// Main and small-image partitions.
#[derive(Clone)]
pub struct DiskCachePartitions {
    pub main: Arc<dyn DiskCache>,
    pub small: Arc<dyn DiskCache>,
    /// Requests whose larger resize side is below this many pixels use the
    /// small partition. Zero disables size-based routing.
    pub small_image_threshold_px: u32,
}

impl DiskCachePartitions {
    /// Partition a request reads from and writes to.
    pub fn select(&self, request: &ImageRequest) -> &Arc<dyn DiskCache> {
        let small_by_size = self.small_image_threshold_px > 0
            && request
                .resize()
                .is_some_and(|r| r.max_side() < self.small_image_threshold_px);
        if request.cache_choice() == CacheChoice::Small || small_by_size {
            &self.small
        } else {
            &self.main
        }
    }
}

pub struct DiskCacheProducer {
    partitions: DiskCachePartitions,
    keys: Arc<dyn CacheKeyFactory>,
    runtime: Handle,
    next: ProducerRef<EncodedImage>,
}

impl DiskCacheProducer {
    pub fn new(
        partitions: DiskCachePartitions,
        keys: Arc<dyn CacheKeyFactory>,
        runtime: Handle,
        next: ProducerRef<EncodedImage>,
    ) -> Self {
        Self {
            partitions,
            keys,
            runtime,
            next,
        }
    }
}

impl Producer<EncodedImage> for DiskCacheProducer {
    fn produce_results(&self, consumer: ConsumerRef<EncodedImage>, context: Arc<ProducerContext>) {
        let name = self.name();
        context.listener().on_producer_start(context.id(), name);

        if !context.request().disk_cache_enabled() {
            context.listener().on_producer_finish_with_success(
                context.id(),
                name,
                &[("skipped", "true".to_string())],
            );
            self.next.produce_results(consumer, context);
            return;
        }

        let cache = Arc::clone(self.partitions.select(context.request()));
        let key = self.keys.encoded_cache_key(context.request());
        let next = Arc::clone(&self.next);
        let runtime = self.runtime.clone();

        self.runtime.spawn(async move {
            if context.is_cancelled() {
                context
                    .listener()
                    .on_producer_finish_with_cancellation(context.id(), name);
                consumer.on_cancellation();
                return;
            }

            let lookup = tokio::select! {
                result = cache.get(&key) => Some(result),
                _ = context.cancelled() => None,
            };
            let Some(lookup) = lookup else {
                context
                    .listener()
                    .on_producer_finish_with_cancellation(context.id(), name);
                consumer.on_cancellation();
                return;
            };

            let cached = match lookup {
                Ok(cached) => cached,
                Err(e) => {
                    tracing::warn!("Disk cache read failed for {}: {e}", key.as_str());
                    None
                }
            };

            context.listener().on_producer_finish_with_success(
                context.id(),
                name,
                &[
                    ("cached_value_found", cached.is_some().to_string()),
                    ("partition", cache.name().to_string()),
                ],
            );

            if let Some(buffer) = cached {
                let encoded = EncodedImage::new(buffer, TransformMetadata::default());
                consumer.on_new_result(Envelope::final_result(encoded, Origin::DiskCache));
                return;
            }

            if context.lowest_permitted_level() >= RequestLevel::DiskCache {
                consumer.on_new_result(Envelope::no_result(Origin::DiskCache));
                return;
            }

            let writer = Arc::new(DiskCachingConsumer {
                cache,
                key,
                runtime,
                inner: consumer,
            });
            next.produce_results(writer, context);
        });
    }

    fn name(&self) -> &'static str {
        "DiskCacheProducer"
    }
}

/// Writes the final network bytes to disk without delaying delivery.
struct DiskCachingConsumer {
    cache: Arc<dyn DiskCache>,
    key: CacheKey,
    runtime: Handle,
    inner: ConsumerRef<EncodedImage>,
}

impl Consumer<EncodedImage> for DiskCachingConsumer {
    fn on_new_result(&self, envelope: Envelope<EncodedImage>) {
        if envelope.status == Status::Final && envelope.origin == Origin::Network {
            if let Some(encoded) = envelope.payload.as_ref() {
                let cache = Arc::clone(&self.cache);
                let key = self.key.clone();
                let buffer = Arc::clone(&encoded.buffer);
                self.runtime.spawn(async move {
                    if let Err(e) = cache.put(&key, buffer).await {
                        tracing::warn!("Disk cache write failed for {}: {e}", key.as_str());
                    }
                });
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
