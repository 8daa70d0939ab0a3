//! Routing between alternative sub-chains.

use std::sync::Arc;

use crate::error::PipelineError;
use crate::image::{EncodedImage, ImageRef};
use crate::producers::base::{
    Consumer, ConsumerRef, Envelope, Producer, ProducerRef, Status, TerminalGuard,
};
use crate::producers::context::ProducerContext;
use crate::request::{ImageRequest, ResizeOptions};

type RoutePredicate = dyn Fn(&ImageRequest) -> bool + Send + Sync;

/// Sends each request down one of two chains, chosen once per request.
pub struct BranchProducer<T> {
    name: &'static str,
    predicate: Box<RoutePredicate>,
    when_true: ProducerRef<T>,
    when_false: ProducerRef<T>,
}

impl<T: Send + 'static> BranchProducer<T> {
    pub fn new(
        name: &'static str,
        predicate: impl Fn(&ImageRequest) -> bool + Send + Sync + 'static,
        when_true: ProducerRef<T>,
        when_false: ProducerRef<T>,
    ) -> Self {
        Self {
            name,
            predicate: Box::new(predicate),
            when_true,
            when_false,
        }
    }
}

impl<T: Send + 'static> Producer<T> for BranchProducer<T> {
    fn produce_results(&self, consumer: ConsumerRef<T>, context: Arc<ProducerContext>) {
        let taken = (self.predicate)(context.request());
        let branch = if taken {
            &self.when_true
        } else {
            &self.when_false
        };
        context
            .listener()
            .on_producer_event(context.id(), self.name, branch.name());
        branch.produce_results(consumer, context);
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Display dimensions of a result, after any pending rotation.
pub trait ImageDimensions {
    fn display_dimensions(&self) -> Option<(u32, u32)>;
}

fn rotated(width: u32, height: u32, rotation: u32) -> (u32, u32) {
    if rotation % 180 == 90 {
        (height, width)
    } else {
        (width, height)
    }
}

impl ImageDimensions for EncodedImage {
    fn display_dimensions(&self) -> Option<(u32, u32)> {
        let m = &self.metadata;
        (m.width > 0 && m.height > 0).then(|| rotated(m.width, m.height, m.rotation))
    }
}

impl ImageDimensions for ImageRef {
    fn display_dimensions(&self) -> Option<(u32, u32)> {
        Some(rotated(self.width(), self.height(), self.rotation()))
    }
}

/// A preview is acceptable when it is at least three quarters of the
/// requested size on both axes.
pub fn is_big_enough(dimensions: Option<(u32, u32)>, resize: Option<ResizeOptions>) -> bool {
    match (dimensions, resize) {
        (Some((w, h)), Some(resize)) => {
            u64::from(w) * 4 >= u64::from(resize.width) * 3
                && u64::from(h) * 4 >= u64::from(resize.height) * 3
        }
        _ => false,
    }
}

/// What the first chain of a [`BranchOnSeparateImagesProducer`] is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparateImagesMode {
    /// The request's low-resolution companion URI.
    LowRes,
    /// The same request; the first chain serves an embedded thumbnail.
    Thumbnail,
}

/// Tries a cheaper image first and falls back to the full chain.
///
/// The first chain's final result is accepted when it is big enough for the
/// request's resize target. Otherwise it is forwarded as an intermediate
/// preview and the second chain runs. A failure or empty result from the
/// first chain also starts the second chain.
pub struct BranchOnSeparateImagesProducer<T> {
    mode: SeparateImagesMode,
    first: ProducerRef<T>,
    second: ProducerRef<T>,
}

impl<T> BranchOnSeparateImagesProducer<T>
where
    T: ImageDimensions + Clone + Send + Sync + 'static,
{
    pub fn new(mode: SeparateImagesMode, first: ProducerRef<T>, second: ProducerRef<T>) -> Self {
        Self {
            mode,
            first,
            second,
        }
    }

    fn first_context(&self, context: &Arc<ProducerContext>) -> Option<Arc<ProducerContext>> {
        match self.mode {
            SeparateImagesMode::LowRes => context
                .request()
                .low_res_request()
                .map(|request| context.for_request(Arc::new(request))),
            SeparateImagesMode::Thumbnail => context
                .request()
                .resize()
                .map(|_| Arc::clone(context)),
        }
    }
}

impl<T> Producer<T> for BranchOnSeparateImagesProducer<T>
where
    T: ImageDimensions + Clone + Send + Sync + 'static,
{
    fn produce_results(&self, consumer: ConsumerRef<T>, context: Arc<ProducerContext>) {
        let Some(first_context) = self.first_context(&context) else {
            self.second.produce_results(consumer, context);
            return;
        };
        let first_consumer = Arc::new(FirstChainConsumer {
            consumer: TerminalGuard::wrap(consumer) as ConsumerRef<T>,
            context,
            second: Arc::clone(&self.second),
        });
        self.first.produce_results(first_consumer, first_context);
    }

    fn name(&self) -> &'static str {
        "BranchOnSeparateImagesProducer"
    }
}

struct FirstChainConsumer<T> {
    consumer: ConsumerRef<T>,
    context: Arc<ProducerContext>,
    second: ProducerRef<T>,
}

impl<T: Send + 'static> FirstChainConsumer<T> {
    fn start_second(&self) {
        self.context
            .listener()
            .on_producer_event(self.context.id(), "BranchOnSeparateImagesProducer", "fallback");
        self.second
            .produce_results(Arc::clone(&self.consumer), Arc::clone(&self.context));
    }
}

impl<T> Consumer<T> for FirstChainConsumer<T>
where
    T: ImageDimensions + Clone + Send + Sync + 'static,
{
    fn on_new_result(&self, envelope: Envelope<T>) {
        if !envelope.is_last() {
            self.consumer.on_new_result(envelope);
            return;
        }
        let big_enough = is_big_enough(
            envelope.payload.as_ref().and_then(ImageDimensions::display_dimensions),
            self.context.request().resize(),
        );
        if big_enough {
            self.consumer.on_new_result(envelope);
            return;
        }
        if envelope.payload.is_some() {
            self.consumer
                .on_new_result(envelope.with_status(Status::Intermediate));
        }
        self.start_second();
    }

    fn on_failure(&self, error: PipelineError) {
        tracing::debug!(
            "first branch failed for {}, falling back: {error}",
            self.context.request().uri()
        );
        self.start_second();
    }

    fn on_cancellation(&self) {
        self.consumer.on_cancellation();
    }

    fn on_progress_update(&self, _progress: f32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producers::base::Origin;
    use crate::testing::{test_context, test_context_for, test_image, RecordingConsumer, StaticProducer};

    #[test]
    fn test_branch_routes_by_request() {
        let yes = StaticProducer::final_result(1u32, Origin::Local);
        let no = StaticProducer::final_result(2u32, Origin::Network);
        let branch = BranchProducer::new(
            "LocalOrNetwork",
            |r: &ImageRequest| r.uri().starts_with("file:"),
            yes.clone(),
            no.clone(),
        );

        let local = RecordingConsumer::<u32>::new();
        branch.produce_results(local.clone(), test_context("file:///tmp/a.jpg"));
        let remote = RecordingConsumer::<u32>::new();
        branch.produce_results(remote.clone(), test_context("https://example.com/a.jpg"));

        assert_eq!(local.payloads(), vec![1]);
        assert_eq!(remote.payloads(), vec![2]);
        assert_eq!((yes.invocations(), no.invocations()), (1, 1));
    }

    #[test]
    fn test_big_enough_needs_three_quarters() {
        let target = Some(ResizeOptions::new(100, 100));
        assert!(is_big_enough(Some((75, 75)), target));
        assert!(!is_big_enough(Some((74, 200)), target));
        assert!(!is_big_enough(Some((500, 500)), None));
        assert!(!is_big_enough(None, target));
    }

    fn thumbnail_request(w: u32, h: u32) -> ImageRequest {
        ImageRequest::builder("file:///photos/a.jpg")
            .unwrap()
            .resize(w, h)
            .build()
    }

    #[test]
    fn test_big_thumbnail_is_final() {
        let first = StaticProducer::final_result(test_image(160, 120), Origin::Local);
        let second = StaticProducer::final_result(test_image(4000, 3000), Origin::Local);
        let branch = BranchOnSeparateImagesProducer::new(
            SeparateImagesMode::Thumbnail,
            first.clone(),
            second.clone(),
        );
        let consumer = RecordingConsumer::<ImageRef>::new();
        branch.produce_results(consumer.clone(), test_context_for(thumbnail_request(160, 120), false));

        assert_eq!(consumer.statuses(), vec![Status::Final]);
        assert_eq!(consumer.payloads()[0].width(), 160);
        assert_eq!(second.invocations(), 0);
    }

    #[test]
    fn test_small_thumbnail_becomes_preview() {
        let first = StaticProducer::final_result(test_image(160, 120), Origin::Local);
        let second = StaticProducer::final_result(test_image(1600, 1200), Origin::Local);
        let branch = BranchOnSeparateImagesProducer::new(
            SeparateImagesMode::Thumbnail,
            first.clone(),
            second.clone(),
        );
        let consumer = RecordingConsumer::<ImageRef>::new();
        branch.produce_results(consumer.clone(), test_context_for(thumbnail_request(800, 600), false));

        assert_eq!(consumer.statuses(), vec![Status::Intermediate, Status::Final]);
        let widths: Vec<u32> = consumer.payloads().iter().map(|i| i.width()).collect();
        assert_eq!(widths, vec![160, 1600]);
    }

    #[test]
    fn test_missing_thumbnail_falls_back() {
        let first = StaticProducer::<ImageRef>::with_envelopes(vec![Envelope::no_result(Origin::Local)]);
        let second = StaticProducer::final_result(test_image(1600, 1200), Origin::Local);
        let branch = BranchOnSeparateImagesProducer::new(
            SeparateImagesMode::Thumbnail,
            first.clone(),
            second.clone(),
        );
        let consumer = RecordingConsumer::<ImageRef>::new();
        branch.produce_results(consumer.clone(), test_context_for(thumbnail_request(800, 600), false));

        assert_eq!(consumer.statuses(), vec![Status::Final]);
        assert_eq!(consumer.terminal_count(), 1);
    }

    #[test]
    fn test_no_resize_skips_thumbnail() {
        let first = StaticProducer::final_result(test_image(160, 120), Origin::Local);
        let second = StaticProducer::final_result(test_image(1600, 1200), Origin::Local);
        let branch = BranchOnSeparateImagesProducer::new(
            SeparateImagesMode::Thumbnail,
            first.clone(),
            second.clone(),
        );
        let consumer = RecordingConsumer::<ImageRef>::new();
        branch.produce_results(consumer.clone(), test_context("file:///photos/a.jpg"));

        assert_eq!(first.invocations(), 0);
        assert_eq!(second.invocations(), 1);
    }

    #[test]
    fn test_low_res_runs_for_companion_uri() {
        let first = StaticProducer::final_result(test_image(50, 50), Origin::Network);
        let second = StaticProducer::final_result(test_image(1000, 1000), Origin::Network);
        let branch = BranchOnSeparateImagesProducer::new(
            SeparateImagesMode::LowRes,
            first.clone(),
            second.clone(),
        );
        let request = ImageRequest::builder("https://example.com/full.jpg")
            .unwrap()
            .low_res_uri("https://example.com/small.jpg")
            .unwrap()
            .build();
        let consumer = RecordingConsumer::<ImageRef>::new();
        branch.produce_results(consumer.clone(), test_context_for(request, false));

        assert_eq!(first.requested_uris(), vec!["https://example.com/small.jpg"]);
        assert_eq!(consumer.statuses(), vec![Status::Intermediate, Status::Final]);
    }
}
