//! Bounded concurrency with FIFO release.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::PipelineError;
use crate::producers::base::{Consumer, ConsumerRef, Envelope, Producer, ProducerRef, TerminalGuard};
use crate::producers::context::{ContextCallbacks, ProducerContext};

struct Waiting<T> {
    ticket: u64,
    consumer: ConsumerRef<T>,
    context: Arc<ProducerContext>,
}

struct ThrottleState<T> {
    active: usize,
    queue: VecDeque<Waiting<T>>,
    next_ticket: u64,
}

struct Shared<T> {
    max_simultaneous: usize,
    next: ProducerRef<T>,
    state: Mutex<ThrottleState<T>>,
}

/// Runs at most `max_simultaneous` downstream productions at once.
///
/// Requests over the limit wait in arrival order. A slot is handed to the
/// oldest waiter when an active production reaches any terminal state.
pub struct ThrottlingProducer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> ThrottlingProducer<T> {
    pub fn new(max_simultaneous: usize, next: ProducerRef<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_simultaneous: max_simultaneous.max(1),
                next,
                state: Mutex::new(ThrottleState {
                    active: 0,
                    queue: VecDeque::new(),
                    next_ticket: 0,
                }),
            }),
        }
    }

    /// Productions currently running downstream.
    pub fn active(&self) -> usize {
        self.shared.lock().active
    }

    /// Requests waiting for a slot.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, ThrottleState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> Shared<T> {
    fn start(self: &Arc<Self>, consumer: ConsumerRef<T>, context: Arc<ProducerContext>) {
        let throttled = TerminalGuard::wrap(Arc::new(ThrottledConsumer {
            inner: consumer,
            shared: Arc::clone(self),
        }) as ConsumerRef<T>);
        self.next.produce_results(throttled, context);
    }

    /// Hand the freed slot to the oldest waiter, or give it back.
    fn release_slot(self: &Arc<Self>) {
        let next = {
            let mut state = self.lock();
            let next = state.queue.pop_front();
            if next.is_none() {
                state.active = state.active.saturating_sub(1);
            }
            next
        };
        if let Some(waiting) = next {
            tracing::trace!("throttle: starting queued request {}", waiting.context.id());
            self.start(waiting.consumer, waiting.context);
        }
    }

    fn cancel_waiting(&self, ticket: u64) {
        let removed = {
            let mut state = self.lock();
            state
                .queue
                .iter()
                .position(|w| w.ticket == ticket)
                .and_then(|pos| state.queue.remove(pos))
        };
        if let Some(waiting) = removed {
            waiting
                .context
                .listener()
                .on_producer_finish_with_cancellation(waiting.context.id(), "ThrottlingProducer");
            waiting.consumer.on_cancellation();
        }
    }
}

impl<T: Send + 'static> Producer<T> for ThrottlingProducer<T> {
    fn produce_results(&self, consumer: ConsumerRef<T>, context: Arc<ProducerContext>) {
        context.listener().on_producer_start(context.id(), self.name());
        let consumer: ConsumerRef<T> = TerminalGuard::wrap(consumer);

        let run_now = {
            let mut state = self.shared.lock();
            if state.active < self.shared.max_simultaneous {
                state.active += 1;
                Some(consumer)
            } else {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.queue.push_back(Waiting {
                    ticket,
                    consumer,
                    context: Arc::clone(&context),
                });
                drop(state);
                context
                    .listener()
                    .on_producer_event(context.id(), self.name(), "queued");
                context.add_callbacks(Arc::new(WaitingCallbacks {
                    shared: Arc::downgrade(&self.shared),
                    ticket,
                }));
                None
            }
        };

        if let Some(consumer) = run_now {
            self.shared.start(consumer, context);
        }
    }

    fn name(&self) -> &'static str {
        "ThrottlingProducer"
    }
}

struct ThrottledConsumer<T: Send + 'static> {
    inner: ConsumerRef<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Consumer<T> for ThrottledConsumer<T> {
    fn on_new_result(&self, envelope: Envelope<T>) {
        let is_last = envelope.is_last();
        self.inner.on_new_result(envelope);
        if is_last {
            self.shared.release_slot();
        }
    }

    fn on_failure(&self, error: PipelineError) {
        self.inner.on_failure(error);
        self.shared.release_slot();
    }

    fn on_cancellation(&self) {
        self.inner.on_cancellation();
        self.shared.release_slot();
    }

    fn on_progress_update(&self, progress: f32) {
        self.inner.on_progress_update(progress);
    }
}

struct WaitingCallbacks<T> {
    shared: Weak<Shared<T>>,
    ticket: u64,
}

impl<T: Send + 'static> ContextCallbacks for WaitingCallbacks<T> {
    fn on_cancellation_requested(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel_waiting(self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producers::base::Origin;
    use crate::testing::{test_context, ManualProducer, RecordingConsumer};

    fn submit(
        throttle: &ThrottlingProducer<u32>,
        n: usize,
    ) -> Vec<(Arc<RecordingConsumer<u32>>, Arc<ProducerContext>)> {
        (0..n)
            .map(|i| {
                let consumer = RecordingConsumer::<u32>::new();
                let ctx = test_context(&format!("https://example.com/{i}.jpg"));
                throttle.produce_results(consumer.clone(), Arc::clone(&ctx));
                (consumer, ctx)
            })
            .collect()
    }

    fn started_uris(manual: &ManualProducer<u32>) -> Vec<String> {
        (0..manual.started())
            .map(|i| manual.context(i).request().uri())
            .collect()
    }

    #[test]
    fn test_limit_two_of_five_releases_in_order() {
        let manual = ManualProducer::<u32>::new();
        let throttle = ThrottlingProducer::new(2, manual.clone());
        let submitted = submit(&throttle, 5);

        assert_eq!(manual.started(), 2);
        assert_eq!(throttle.queued(), 3);

        manual.deliver(1, Envelope::final_result(1, Origin::Local));
        assert_eq!(manual.started(), 3);
        manual.fail(0, PipelineError::UnsupportedSource("x".into()));
        assert_eq!(manual.started(), 4);
        assert_eq!(throttle.active(), 2);
        manual.cancel_downstream(2);
        assert_eq!(manual.started(), 5);

        assert_eq!(
            started_uris(&manual),
            (0..5)
                .map(|i| format!("https://example.com/{i}.jpg"))
                .collect::<Vec<_>>()
        );
        assert_eq!(submitted[1].0.payloads(), vec![1]);

        manual.deliver(3, Envelope::final_result(3, Origin::Local));
        manual.deliver(4, Envelope::final_result(4, Origin::Local));
        assert_eq!(throttle.active(), 0);
    }

    #[test]
    fn test_cancelled_waiter_leaves_queue_immediately() {
        let manual = ManualProducer::<u32>::new();
        let throttle = ThrottlingProducer::new(1, manual.clone());
        let submitted = submit(&throttle, 3);

        submitted[1].1.cancel();
        assert!(submitted[1].0.was_cancelled());
        assert_eq!(throttle.queued(), 1);

        manual.deliver(0, Envelope::final_result(0, Origin::Local));
        assert_eq!(
            started_uris(&manual),
            vec!["https://example.com/0.jpg", "https://example.com/2.jpg"]
        );
    }
}
