//! Network fetch stage.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::runtime::Handle;

use crate::error::PipelineError;
use crate::image::{EncodedImage, TransformMetadata};
use crate::memory::{PooledBufferFactory, DEFAULT_PRESIZE};
use crate::source::NetworkFetcher;

use super::base::{ConsumerRef, Envelope, Origin, Producer};
use super::context::ProducerContext;

/// Streams a response body into a pooled buffer.
///
/// When the request wants progressive rendering, snapshots of the bytes so
/// far are delivered as intermediate results, at most one per interval.
pub struct NetworkFetchProducer {
    fetcher: Arc<dyn NetworkFetcher>,
    factory: PooledBufferFactory,
    runtime: Handle,
    intermediate_interval: Duration,
}

impl NetworkFetchProducer {
    pub fn new(
        fetcher: Arc<dyn NetworkFetcher>,
        factory: PooledBufferFactory,
        runtime: Handle,
        intermediate_interval: Duration,
    ) -> Self {
        Self {
            fetcher,
            factory,
            runtime,
            intermediate_interval,
        }
    }
}

fn cancelled(consumer: &ConsumerRef<EncodedImage>, context: &ProducerContext, name: &str) {
    context
        .listener()
        .on_producer_finish_with_cancellation(context.id(), name);
    consumer.on_cancellation();
}

impl Producer<EncodedImage> for NetworkFetchProducer {
    fn produce_results(&self, consumer: ConsumerRef<EncodedImage>, context: Arc<ProducerContext>) {
        let name = self.name();
        context.listener().on_producer_start(context.id(), name);
        let fetcher = Arc::clone(&self.fetcher);
        let factory = self.factory.clone();
        let interval = self.intermediate_interval;

        self.runtime.spawn(async move {
            if context.is_cancelled() {
                cancelled(&consumer, &context, name);
                return;
            }
            let uri = context.request().uri();
            let started = Instant::now();

            let response = tokio::select! {
                response = fetcher.fetch(&uri) => response,
                _ = context.cancelled() => {
                    cancelled(&consumer, &context, name);
                    return;
                }
            };
            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    context
                        .listener()
                        .on_producer_finish_with_failure(context.id(), name, &error);
                    consumer.on_failure(error);
                    return;
                }
            };

            // Advertised lengths are only a hint; the writer caps its pre-size.
            let total = response.content_length;
            let capacity = total
                .and_then(|len| usize::try_from(len).ok())
                .unwrap_or(DEFAULT_PRESIZE);
            let mut writer = factory.writer(capacity);
            let mut body = response.body;
            let mut received: u64 = 0;
            let mut last_intermediate = Instant::now();

            loop {
                let chunk = tokio::select! {
                    chunk = body.next() => chunk,
                    _ = context.cancelled() => {
                        drop(writer);
                        cancelled(&consumer, &context, name);
                        return;
                    }
                };
                let chunk = match chunk {
                    None => break,
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        let error = PipelineError::read_failed(uri.clone(), e);
                        context
                            .listener()
                            .on_producer_finish_with_failure(context.id(), name, &error);
                        consumer.on_failure(error);
                        return;
                    }
                };
                if let Err(e) = writer.write_all(&chunk) {
                    consumer.on_failure(PipelineError::read_failed(uri.clone(), e));
                    return;
                }
                received += chunk.len() as u64;

                if let Some(total) = total.filter(|t| *t > 0) {
                    consumer.on_progress_update((received as f32 / total as f32).min(1.0));
                }

                let wants_intermediate = context.request().progressive_rendering()
                    && context.is_intermediate_results_expected();
                if wants_intermediate && last_intermediate.elapsed() >= interval {
                    last_intermediate = Instant::now();
                    let partial = EncodedImage::new(writer.snapshot(), TransformMetadata::default());
                    consumer.on_new_result(Envelope::intermediate(partial, Origin::Network));
                }
            }

            tracing::debug!(
                "Fetched {} ({} bytes in {}ms)",
                uri,
                received,
                started.elapsed().as_millis()
            );
            context.listener().on_producer_finish_with_success(
                context.id(),
                name,
                &[
                    ("total_bytes", received.to_string()),
                    ("fetch_time_ms", started.elapsed().as_millis().to_string()),
                ],
            );
            let encoded = EncodedImage::new(writer.into_buffer(), TransformMetadata::default());
            consumer.on_new_result(Envelope::final_result(encoded, Origin::Network));
        });
    }

    fn name(&self) -> &'static str {
        "NetworkFetchProducer"
    }
}
