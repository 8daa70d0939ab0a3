//! Moves the rest of a chain onto another executor.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::executor::Executor;
use crate::producers::base::{ConsumerRef, Producer, ProducerRef};
use crate::producers::context::{ContextCallbacks, ProducerContext};

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Starts `next` from a job on `executor` instead of the calling thread.
///
/// If the request is cancelled before the job runs, the consumer is
/// cancelled right away and `next` is never started.
pub struct ThreadHandoffProducer<T> {
    executor: Arc<dyn Executor>,
    next: ProducerRef<T>,
}

impl<T: Send + 'static> ThreadHandoffProducer<T> {
    pub fn new(executor: Arc<dyn Executor>, next: ProducerRef<T>) -> Self {
        Self { executor, next }
    }
}

impl<T: Send + 'static> Producer<T> for ThreadHandoffProducer<T> {
    fn produce_results(&self, consumer: ConsumerRef<T>, context: Arc<ProducerContext>) {
        let state = Arc::new(AtomicU8::new(PENDING));
        context.listener().on_producer_start(context.id(), self.name());

        context.add_callbacks(Arc::new(PendingHandoff {
            state: Arc::clone(&state),
            consumer: Arc::clone(&consumer),
            context: Arc::downgrade(&context),
        }));

        let next = Arc::clone(&self.next);
        let name = self.name();
        self.executor.execute(Box::new(move || {
            if state
                .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            context
                .listener()
                .on_producer_finish_with_success(context.id(), name, &[]);
            next.produce_results(consumer, context);
        }));
    }

    fn name(&self) -> &'static str {
        "BackgroundThreadHandoffProducer"
    }
}

struct PendingHandoff<T> {
    state: Arc<AtomicU8>,
    consumer: ConsumerRef<T>,
    context: std::sync::Weak<ProducerContext>,
}

impl<T: Send + 'static> ContextCallbacks for PendingHandoff<T> {
    fn on_cancellation_requested(&self) {
        if self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(context) = self.context.upgrade() {
                context
                    .listener()
                    .on_producer_finish_with_cancellation(context.id(), "BackgroundThreadHandoffProducer");
            }
            self.consumer.on_cancellation();
        }
    }
}
