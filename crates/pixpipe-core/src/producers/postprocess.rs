//! Caller-supplied transforms of the final decoded image.

use std::sync::Arc;

use image::DynamicImage;

use crate::error::PipelineError;
use crate::executor::Executor;
use crate::image::{CloseableImage, ImageRef};

use super::base::{Consumer, ConsumerRef, Envelope, Producer, ProducerRef, TerminalGuard};
use super::context::ProducerContext;
use super::job::JobScheduler;

/// Mutates a private copy of a decoded image.
///
/// `name` identifies the transform in cache keys, so two postprocessors
/// with the same name must produce the same output.
pub trait Postprocessor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, image: &mut DynamicImage) -> Result<(), String>;
}

/// Converts to 8-bit grayscale.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrayscalePostprocessor;

impl Postprocessor for GrayscalePostprocessor {
    fn name(&self) -> &str {
        "grayscale"
    }

    fn process(&self, image: &mut DynamicImage) -> Result<(), String> {
        *image = DynamicImage::ImageLuma8(image.to_luma8());
        Ok(())
    }
}

/// Gaussian blur.
#[derive(Debug, Clone)]
pub struct BlurPostprocessor {
    sigma: f32,
    name: String,
}

impl BlurPostprocessor {
    pub fn new(sigma: f32) -> Self {
        Self {
            sigma,
            name: format!("blur:{sigma}"),
        }
    }
}

impl Postprocessor for BlurPostprocessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, image: &mut DynamicImage) -> Result<(), String> {
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(format!("invalid blur sigma {}", self.sigma));
        }
        *image = image.blur(self.sigma);
        Ok(())
    }
}

/// Applies the request's postprocessor to the final image on the
/// background executor. The incoming image is copied first so other
/// holders of it (the plain bitmap cache) are unaffected.
pub struct PostprocessorProducer {
    executor: Arc<dyn Executor>,
    next: ProducerRef<ImageRef>,
}

impl PostprocessorProducer {
    pub fn new(executor: Arc<dyn Executor>, next: ProducerRef<ImageRef>) -> Self {
        Self { executor, next }
    }
}

impl Producer<ImageRef> for PostprocessorProducer {
    fn produce_results(&self, consumer: ConsumerRef<ImageRef>, context: Arc<ProducerContext>) {
        let Some(postprocessor) = context.request().postprocessor().cloned() else {
            self.next.produce_results(consumer, context);
            return;
        };
        context.listener().on_producer_start(context.id(), self.name());
        let consumer = TerminalGuard::wrap(consumer);
        let scheduler = JobScheduler::new(Arc::clone(&self.executor)).fail_on_panic(
            Arc::clone(&consumer),
            Arc::clone(&context),
            self.name(),
        );
        let processing = Arc::new(PostprocessingConsumer {
            postprocessor,
            scheduler,
            consumer,
            context: Arc::clone(&context),
        });
        self.next.produce_results(processing, context);
    }

    fn name(&self) -> &'static str {
        "PostprocessorProducer"
    }
}

struct PostprocessingConsumer {
    postprocessor: Arc<dyn Postprocessor>,
    scheduler: JobScheduler,
    consumer: Arc<TerminalGuard<ImageRef>>,
    context: Arc<ProducerContext>,
}

impl Consumer<ImageRef> for PostprocessingConsumer {
    fn on_new_result(&self, envelope: Envelope<ImageRef>) {
        let consumer = Arc::clone(&self.consumer);
        if !envelope.is_last() || envelope.payload.is_none() {
            self.scheduler
                .schedule(Box::new(move || consumer.on_new_result(envelope)));
            return;
        }

        let postprocessor = Arc::clone(&self.postprocessor);
        let context = Arc::clone(&self.context);
        self.scheduler.schedule(Box::new(move || {
            if context.is_cancelled() {
                consumer.on_cancellation();
                return;
            }
            let Some(source) = envelope.payload.as_ref() else {
                return;
            };
            let mut copy = source.image().clone();
            match postprocessor.process(&mut copy) {
                Ok(()) => {
                    context.listener().on_producer_finish_with_success(
                        context.id(),
                        "PostprocessorProducer",
                        &[("postprocessor", postprocessor.name().to_string())],
                    );
                    let processed: ImageRef =
                        Arc::new(CloseableImage::new(copy, source.rotation(), source.quality()));
                    consumer.on_new_result(Envelope::final_result(processed, envelope.origin));
                }
                Err(message) => {
                    let error = PipelineError::Postprocess {
                        uri: context.request().uri(),
                        postprocessor: postprocessor.name().to_string(),
                        message,
                    };
                    context.listener().on_producer_finish_with_failure(
                        context.id(),
                        "PostprocessorProducer",
                        &error,
                    );
                    consumer.on_failure(error);
                }
            }
        }));
    }

    fn on_failure(&self, error: PipelineError) {
        let consumer = Arc::clone(&self.consumer);
        self.scheduler
            .schedule(Box::new(move || consumer.on_failure(error)));
    }

    fn on_cancellation(&self) {
        let consumer = Arc::clone(&self.consumer);
        self.scheduler
            .schedule(Box::new(move || consumer.on_cancellation()));
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
    use crate::request::ImageRequest;
    use crate::testing::{test_context, test_context_for, RecordingConsumer, StaticProducer};
    use image::{GenericImageView, Rgb, RgbImage};

    const URI: &str = "https://example.com/a.jpg";

    fn red_image() -> ImageRef {
        CloseableImage::full(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            2,
            2,
            Rgb([255, 0, 0]),
        )))
    }

    #[test]
    fn test_postprocessor_works_on_a_copy() {
        let original = red_image();
        let upstream = StaticProducer::final_result(Arc::clone(&original), Origin::MemoryCache);
        let producer = PostprocessorProducer::new(Arc::new(InlineExecutor), upstream);
        let request = ImageRequest::builder(URI)
            .unwrap()
            .postprocessor(Arc::new(GrayscalePostprocessor))
            .build();
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce_results(consumer.clone(), test_context_for(request, false));

        let processed = &consumer.payloads()[0];
        assert!(!Arc::ptr_eq(processed, &original));
        assert!(matches!(processed.image(), DynamicImage::ImageLuma8(_)));
        assert_eq!(original.image().get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(consumer.last_origin(), Some(Origin::MemoryCache));
    }

    #[test]
    fn test_without_postprocessor_is_passthrough() {
        let original = red_image();
        let upstream = StaticProducer::final_result(Arc::clone(&original), Origin::Network);
        let producer = PostprocessorProducer::new(Arc::new(InlineExecutor), upstream);
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce_results(consumer.clone(), test_context(URI));
        assert!(Arc::ptr_eq(&consumer.payloads()[0], &original));
    }

    #[test]
    fn test_postprocessor_error_is_failure() {
        let upstream = StaticProducer::final_result(red_image(), Origin::Network);
        let producer = PostprocessorProducer::new(Arc::new(InlineExecutor), upstream);
        let request = ImageRequest::builder(URI)
            .unwrap()
            .postprocessor(Arc::new(BlurPostprocessor::new(-1.0)))
            .build();
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce_results(consumer.clone(), test_context_for(request, false));

        assert!(matches!(consumer.failure(), Some(PipelineError::Postprocess { .. })));
        assert_eq!(consumer.last_status(), None);
    }

    #[test]
    fn test_intermediates_pass_through_unprocessed() {
        let partial = red_image();
        let upstream = StaticProducer::with_envelopes(vec![
            Envelope::intermediate(Arc::clone(&partial), Origin::Network),
            Envelope::final_result(red_image(), Origin::Network),
        ]);
        let producer = PostprocessorProducer::new(Arc::new(InlineExecutor), upstream);
        let request = ImageRequest::builder(URI)
            .unwrap()
            .postprocessor(Arc::new(GrayscalePostprocessor))
            .build();
        let consumer = RecordingConsumer::<ImageRef>::new();
        producer.produce_results(consumer.clone(), test_context_for(request, false));

        assert_eq!(consumer.statuses(), vec![Status::Intermediate, Status::Final]);
        assert!(Arc::ptr_eq(&consumer.payloads()[0], &partial));
    }
}
