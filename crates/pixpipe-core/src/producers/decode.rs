//! Decode stage: encoded bytes in, decoded images out.

use std::sync::{Arc, Mutex, PoisonError};

use crate::decoder::{ImageDecoder, ProgressiveDecodePolicy, ProgressiveJpegParser};
use crate::error::PipelineError;
use crate::executor::Executor;
use crate::image::{CloseableImage, EncodedImage, ImageRef, QualityInfo};

use super::base::{Consumer, ConsumerRef, Envelope, Origin, Producer, ProducerRef, TerminalGuard};
use super::context::ProducerContext;
use super::job::JobScheduler;

pub struct DecodeProducer {
    decoder: Arc<dyn ImageDecoder>,
    progressive: Option<Arc<dyn ProgressiveDecodePolicy>>,
    executor: Arc<dyn Executor>,
    next: ProducerRef<EncodedImage>,
}

impl DecodeProducer {
    /// `progressive` is `None` when partial decoding is disabled.
    pub fn new(
        decoder: Arc<dyn ImageDecoder>,
        progressive: Option<Arc<dyn ProgressiveDecodePolicy>>,
        executor: Arc<dyn Executor>,
        next: ProducerRef<EncodedImage>,
    ) -> Self {
        Self {
            decoder,
            progressive,
            executor,
            next,
        }
    }
}

impl Producer<ImageRef> for DecodeProducer {
    fn produce_results(&self, consumer: ConsumerRef<ImageRef>, context: Arc<ProducerContext>) {
        context.listener().on_producer_start(context.id(), self.name());
        let consumer = TerminalGuard::wrap(consumer);
        let scheduler = JobScheduler::new(Arc::clone(&self.executor)).fail_on_panic(
            Arc::clone(&consumer),
            Arc::clone(&context),
            self.name(),
        );
        let decoding = Arc::new(DecodingConsumer {
            decoder: Arc::clone(&self.decoder),
            progressive: self.progressive.clone(),
            scheduler,
            consumer,
            context: Arc::clone(&context),
            progress: Mutex::new(ProgressState::default()),
        });
        self.next.produce_results(decoding, context);
    }

    fn name(&self) -> &'static str {
        "DecodeProducer"
    }
}

#[derive(Default)]
struct ProgressState {
    parser: ProgressiveJpegParser,
    last_scheduled_scan: u32,
}

struct DecodingConsumer {
    decoder: Arc<dyn ImageDecoder>,
    progressive: Option<Arc<dyn ProgressiveDecodePolicy>>,
    scheduler: JobScheduler,
    consumer: Arc<TerminalGuard<ImageRef>>,
    context: Arc<ProducerContext>,
    progress: Mutex<ProgressState>,
}

impl DecodingConsumer {
    /// Scan to decode for this intermediate buffer, if the policy accepts it.
    fn accept_partial(&self, encoded: &EncodedImage) -> Option<(usize, QualityInfo)> {
        let policy = self.progressive.as_ref()?;
        if !self.context.request().progressive_rendering()
            || !self.context.is_intermediate_results_expected()
        {
            return None;
        }
        let mut state = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.parser.parse_more_data(encoded.buffer.as_slice()) {
            return None;
        }
        let scan = state.parser.best_scan_number();
        if scan <= state.last_scheduled_scan {
            return None;
        }
        if scan < policy.next_scan_to_decode(state.last_scheduled_scan)
            && !state.parser.is_end_marker_read()
        {
            return None;
        }
        state.last_scheduled_scan = scan;
        Some((state.parser.best_scan_end_offset(), policy.quality_info(scan)))
    }

    fn schedule_decode(&self, encoded: EncodedImage, origin: Origin, partial: Option<(usize, QualityInfo)>) {
        let decoder = Arc::clone(&self.decoder);
        let consumer = Arc::clone(&self.consumer);
        let context = Arc::clone(&self.context);

        self.scheduler.schedule(Box::new(move || {
            if context.is_cancelled() {
                if partial.is_none() {
                    consumer.on_cancellation();
                }
                return;
            }
            let uri = context.request().uri();
            let rotation = if context.request().auto_rotate() {
                encoded.metadata.rotation
            } else {
                0
            };

            match partial {
                Some((end_offset, quality)) => {
                    let bytes = &encoded.buffer.as_slice()[..end_offset.min(encoded.buffer.len())];
                    match decoder.decode(&uri, bytes, quality) {
                        Ok(image) => {
                            let image = Arc::new(CloseableImage::new(image, rotation, quality));
                            consumer.on_new_result(Envelope::intermediate(image, origin));
                        }
                        Err(e) => tracing::debug!("Partial decode of scan {} skipped: {e}", quality.scan_number),
                    }
                }
                None => match decoder.decode(&uri, encoded.buffer.as_slice(), QualityInfo::FULL) {
                    Ok(image) => {
                        context.listener().on_producer_finish_with_success(
                            context.id(),
                            "DecodeProducer",
                            &[("image_size", format!("{}x{}", image.width(), image.height()))],
                        );
                        let image = Arc::new(CloseableImage::new(image, rotation, QualityInfo::FULL));
                        consumer.on_new_result(Envelope::final_result(image, origin));
                    }
                    Err(error) => {
                        context
                            .listener()
                            .on_producer_finish_with_failure(context.id(), "DecodeProducer", &error);
                        consumer.on_failure(error);
                    }
                },
            }
        }));
    }

    /// Route a terminal through the scheduler so it lands after any running decode.
    fn schedule_terminal(&self, deliver: impl FnOnce(&TerminalGuard<ImageRef>) + Send + 'static) {
        let consumer = Arc::clone(&self.consumer);
        self.scheduler.schedule(Box::new(move || deliver(&consumer)));
    }
}

impl Consumer<EncodedImage> for DecodingConsumer {
    fn on_new_result(&self, envelope: Envelope<EncodedImage>) {
        let origin = envelope.origin;
        match (envelope.is_last(), envelope.payload) {
            (true, Some(encoded)) => self.schedule_decode(encoded, origin, None),
            (true, None) => {
                self.schedule_terminal(move |c| c.on_new_result(Envelope::no_result(origin)))
            }
            (false, Some(encoded)) => {
                if let Some(partial) = self.accept_partial(&encoded) {
                    self.schedule_decode(encoded, origin, Some(partial));
                }
            }
            (false, None) => {}
        }
    }

    fn on_failure(&self, error: PipelineError) {
        self.schedule_terminal(move |c| c.on_failure(error));
    }

    fn on_cancellation(&self) {
        self.schedule_terminal(|c| c.on_cancellation());
    }

    fn on_progress_update(&self, progress: f32) {
        self.consumer.on_progress_update(progress);
    }
}
