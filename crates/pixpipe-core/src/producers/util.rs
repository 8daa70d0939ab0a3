//! Small stages used to terminate or adapt chains.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::producers::base::{Consumer, ConsumerRef, Envelope, Origin, Producer, ProducerRef};
use crate::producers::context::ProducerContext;

/// Finishes every request at once with an empty result.
pub struct NullProducer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> NullProducer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for NullProducer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Producer<T> for NullProducer<T> {
    fn produce_results(&self, consumer: ConsumerRef<T>, _context: Arc<ProducerContext>) {
        consumer.on_new_result(Envelope::no_result(Origin::MemoryCache));
    }

    fn name(&self) -> &'static str {
        "NullProducer"
    }
}

/// Runs `next` for its side effects (cache population) and reports only
/// completion. Used by the prefetch sequences.
pub struct SwallowResultProducer<T> {
    next: ProducerRef<T>,
}

impl<T: Send + 'static> SwallowResultProducer<T> {
    pub fn new(next: ProducerRef<T>) -> Self {
        Self { next }
    }
}

impl<T: Send + 'static> Producer<()> for SwallowResultProducer<T> {
    fn produce_results(&self, consumer: ConsumerRef<()>, context: Arc<ProducerContext>) {
        self.next
            .produce_results(Arc::new(SwallowingConsumer { inner: consumer, _marker: PhantomData }), context);
    }

    fn name(&self) -> &'static str {
        "SwallowResultProducer"
    }
}

struct SwallowingConsumer<T> {
    inner: ConsumerRef<()>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Consumer<T> for SwallowingConsumer<T> {
    fn on_new_result(&self, envelope: Envelope<T>) {
        if envelope.is_last() {
            self.inner
                .on_new_result(Envelope::no_result(envelope.origin));
        }
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
    use crate::producers::base::Status;
    use crate::testing::{test_context, RecordingConsumer, StaticProducer};

    #[test]
    fn test_null_producer_finishes_empty() {
        let consumer = RecordingConsumer::<u32>::new();
        NullProducer::new().produce_results(consumer.clone(), test_context("https://example.com/a.jpg"));
        assert_eq!(consumer.statuses(), vec![Status::NoResult]);
    }

    #[test]
    fn test_swallow_keeps_only_completion() {
        let upstream = StaticProducer::with_envelopes(vec![
            Envelope::intermediate(1u32, Origin::Network),
            Envelope::final_result(2u32, Origin::Network),
        ]);
        let swallow = SwallowResultProducer::new(upstream.clone() as ProducerRef<u32>);
        let consumer = RecordingConsumer::<()>::new();
        swallow.produce_results(consumer.clone(), test_context("https://example.com/a.jpg"));

        assert_eq!(consumer.statuses(), vec![Status::NoResult]);
        assert_eq!(consumer.last_origin(), Some(Origin::Network));
    }
}
