//! Request deduplication.
//!
//! Concurrent requests that map to the same key and the same lowest
//! permitted level share one downstream production. Consumers attach to the
//! live entry in arrival order, every result is broadcast to them in that
//! order, and the downstream production is cancelled only once the last
//! attached consumer has gone.
//!
//! Each attached consumer gets its callbacks through a [`SerialConsumer`]:
//! deliveries are queued while the entry state is locked and drained after
//! it is released, so a late joiner's replay can never overtake or overlap
//! a concurrent broadcast.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::cache::{BitmapCacheKey, CacheKey, CacheKeyFactory};
use crate::error::PipelineError;
use crate::image::{EncodedImage, ImageRef};
use crate::request::{ImageRequest, Priority, RequestLevel};

use super::base::{Consumer, ConsumerRef, Envelope, Producer, ProducerRef, TerminalGuard};
use super::context::{ContextCallbacks, ContextSettings, ProducerContext};

type KeyFn<K> = Arc<dyn Fn(&ImageRequest) -> K + Send + Sync>;

/// Requests only share a production when they may descend equally deep.
type EntryKey<K> = (K, RequestLevel);

pub struct MultiplexProducer<K, T> {
    shared: Arc<Shared<K, T>>,
}

struct Shared<K, T> {
    name: &'static str,
    key_fn: KeyFn<K>,
    next: ProducerRef<T>,
    entries: Mutex<HashMap<EntryKey<K>, Arc<Multiplexer<K, T>>>>,
}

#[derive(Clone)]
enum Delivery<T> {
    Result(Envelope<T>),
    Progress(f32),
    Failure(PipelineError),
    Cancellation,
}

struct SerialQueue<T> {
    pending: VecDeque<Delivery<T>>,
    draining: bool,
}

/// Delivers one consumer's callbacks in queue order, one at a time.
///
/// A callback that re-enters only queues; the thread already draining
/// delivers it once the current callback returns.
struct SerialConsumer<T> {
    inner: ConsumerRef<T>,
    queue: Mutex<SerialQueue<T>>,
}

impl<T> SerialConsumer<T> {
    fn new(inner: ConsumerRef<T>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            queue: Mutex::new(SerialQueue {
                pending: VecDeque::new(),
                draining: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SerialQueue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, delivery: Delivery<T>) {
        self.lock().pending.push_back(delivery);
    }

    fn drain(&self) {
        {
            let mut queue = self.lock();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        loop {
            let next = {
                let mut queue = self.lock();
                match queue.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            match next {
                Delivery::Result(envelope) => self.inner.on_new_result(envelope),
                Delivery::Progress(progress) => self.inner.on_progress_update(progress),
                Delivery::Failure(error) => self.inner.on_failure(error),
                Delivery::Cancellation => self.inner.on_cancellation(),
            }
        }
    }
}

struct Attached<T> {
    id: u64,
    consumer: Arc<SerialConsumer<T>>,
    context: Arc<ProducerContext>,
}

struct MuxState<T> {
    consumers: Vec<Attached<T>>,
    last_intermediate: Option<Envelope<T>>,
    last_progress: Option<f32>,
    downstream: Option<Arc<ProducerContext>>,
    terminal: bool,
    next_id: u64,
}

/// One in-flight production and the consumers waiting on it.
struct Multiplexer<K, T> {
    key: EntryKey<K>,
    shared: Weak<Shared<K, T>>,
    state: Mutex<MuxState<T>>,
}

impl MultiplexProducer<BitmapCacheKey, ImageRef> {
    /// Dedup decoded-image productions by their bitmap cache key.
    pub fn bitmap(cache_keys: Arc<dyn CacheKeyFactory>, next: ProducerRef<ImageRef>) -> Self {
        Self::new(
            "BitmapMemoryCacheKeyMultiplexProducer",
            Arc::new(move |request: &ImageRequest| cache_keys.bitmap_cache_key(request)),
            next,
        )
    }
}

impl MultiplexProducer<CacheKey, EncodedImage> {
    /// Dedup encoded-byte productions by their encoded cache key.
    pub fn encoded(cache_keys: Arc<dyn CacheKeyFactory>, next: ProducerRef<EncodedImage>) -> Self {
        Self::new(
            "EncodedCacheKeyMultiplexProducer",
            Arc::new(move |request: &ImageRequest| cache_keys.encoded_cache_key(request)),
            next,
        )
    }
}

impl<K, T> MultiplexProducer<K, T>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, key_fn: KeyFn<K>, next: ProducerRef<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                key_fn,
                next,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of keys with an in-flight production.
    pub fn in_flight(&self) -> usize {
        self.shared.lock_entries().len()
    }
}

impl<K, T> Shared<K, T> {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<EntryKey<K>, Arc<Multiplexer<K, T>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, T> Shared<K, T>
where
    K: Hash + Eq,
{
    fn remove_entry(&self, key: &EntryKey<K>, mux: &Arc<Multiplexer<K, T>>) {
        let mut entries = self.lock_entries();
        if entries.get(key).is_some_and(|live| Arc::ptr_eq(live, mux)) {
            entries.remove(key);
        }
    }
}

impl<K, T> Producer<T> for MultiplexProducer<K, T>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn produce_results(&self, consumer: ConsumerRef<T>, context: Arc<ProducerContext>) {
        let key = (
            (self.shared.key_fn)(context.request()),
            context.lowest_permitted_level(),
        );
        let guarded: ConsumerRef<T> = TerminalGuard::wrap(consumer);
        let consumer = SerialConsumer::new(guarded);

        // Entries lock, then entry state lock. Never the other way round.
        let (mux, id, created) = {
            let mut entries = self.shared.lock_entries();
            let live = entries
                .get(&key)
                .and_then(|mux| mux.try_attach(&consumer, &context).map(|id| (Arc::clone(mux), id)));
            match live {
                Some((mux, id)) => (mux, id, false),
                None => {
                    let mux = Arc::new(Multiplexer::new(key.clone(), Arc::downgrade(&self.shared)));
                    let id = mux.try_attach(&consumer, &context).unwrap_or(u64::MAX);
                    entries.insert(key.clone(), Arc::clone(&mux));
                    (mux, id, true)
                }
            }
        };

        let listener = context.listener();
        listener.on_producer_start(context.id(), self.shared.name);
        if !created {
            tracing::debug!("{}: attached to in-flight {:?}", self.shared.name, key);
        }

        context.add_callbacks(Arc::new(AttachedCallbacks {
            mux: Arc::downgrade(&mux),
            id,
        }));

        // Replays queued by the attach.
        consumer.drain();

        if created {
            mux.start_downstream();
        } else {
            mux.update_downstream();
        }
    }

    fn name(&self) -> &'static str {
        self.shared.name
    }
}

impl<K, T> Multiplexer<K, T>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn new(key: EntryKey<K>, shared: Weak<Shared<K, T>>) -> Self {
        Self {
            key,
            shared,
            state: Mutex::new(MuxState {
                consumers: Vec::new(),
                last_intermediate: None,
                last_progress: None,
                downstream: None,
                terminal: false,
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a consumer unless the entry already delivered its terminal.
    ///
    /// The last progress and intermediate are queued on the consumer before
    /// the state lock is released.
    fn try_attach(
        &self,
        consumer: &Arc<SerialConsumer<T>>,
        context: &Arc<ProducerContext>,
    ) -> Option<u64> {
        let mut state = self.lock();
        if state.terminal {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        if let Some(progress) = state.last_progress {
            consumer.push(Delivery::Progress(progress));
        }
        if let Some(envelope) = &state.last_intermediate {
            consumer.push(Delivery::Result(envelope.clone()));
        }
        state.consumers.push(Attached {
            id,
            consumer: Arc::clone(consumer),
            context: Arc::clone(context),
        });
        Some(id)
    }

    fn downstream_settings(state: &MuxState<T>) -> Option<ContextSettings> {
        let first = state.consumers.first()?;
        let priority = state
            .consumers
            .iter()
            .map(|a| a.context.priority())
            .max()
            .unwrap_or(Priority::Medium);
        Some(ContextSettings {
            priority,
            is_prefetch: state.consumers.iter().all(|a| a.context.is_prefetch()),
            intermediate_results_expected: state
                .consumers
                .iter()
                .any(|a| a.context.is_intermediate_results_expected()),
            lowest_permitted_level: first.context.lowest_permitted_level(),
        })
    }

    fn start_downstream(self: &Arc<Self>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let context = {
            let mut state = self.lock();
            if state.terminal || state.downstream.is_some() {
                return;
            }
            let Some(settings) = Self::downstream_settings(&state) else {
                return;
            };
            let first = &state.consumers[0].context;
            let context = ProducerContext::new(
                first.id(),
                Arc::clone(first.request()),
                Arc::clone(first.listener()),
                settings,
            );
            state.downstream = Some(Arc::clone(&context));
            context
        };
        tracing::trace!("{}: starting downstream for {:?}", shared.name, self.key);
        let forwarder: ConsumerRef<T> = TerminalGuard::wrap(Arc::new(Forwarder {
            mux: Arc::clone(self),
        }));
        shared.next.produce_results(forwarder, context);
    }

    /// Push recomputed priority and prefetch flags to the downstream context.
    fn update_downstream(&self) {
        let (context, settings) = {
            let state = self.lock();
            match (&state.downstream, Self::downstream_settings(&state)) {
                (Some(context), Some(settings)) => (Arc::clone(context), settings),
                _ => return,
            }
        };
        context.set_priority(settings.priority);
        context.set_is_prefetch(settings.is_prefetch);
        context.set_intermediate_results_expected(settings.intermediate_results_expected);
    }

    fn detach(self: &Arc<Self>, id: u64) {
        let (removed, cancel_downstream, emptied) = {
            let mut state = self.lock();
            if state.terminal {
                return;
            }
            let Some(pos) = state.consumers.iter().position(|a| a.id == id) else {
                return;
            };
            let removed = state.consumers.remove(pos);
            removed.consumer.push(Delivery::Cancellation);
            let emptied = state.consumers.is_empty();
            let cancel_downstream = if emptied {
                state.terminal = true;
                state.last_intermediate = None;
                state.downstream.take()
            } else {
                None
            };
            (removed, cancel_downstream, emptied)
        };

        removed
            .context
            .listener()
            .on_producer_finish_with_cancellation(removed.context.id(), self.name());
        removed.consumer.drain();

        if emptied {
            if let Some(shared) = self.shared.upgrade() {
                shared.remove_entry(&self.key, self);
            }
            if let Some(context) = cancel_downstream {
                tracing::debug!("{}: last consumer left {:?}, cancelling", self.name(), self.key);
                context.cancel();
            }
        } else {
            self.update_downstream();
        }
    }

    fn name(&self) -> &'static str {
        self.shared.upgrade().map(|s| s.name).unwrap_or("MultiplexProducer")
    }

    /// Mark terminal, queue `delivery` on everyone attached and hand them back.
    fn finish(self: &Arc<Self>, delivery: Delivery<T>) -> Vec<Attached<T>> {
        let consumers = {
            let mut state = self.lock();
            if state.terminal {
                return Vec::new();
            }
            state.terminal = true;
            state.last_intermediate = None;
            state.downstream = None;
            for attached in &state.consumers {
                attached.consumer.push(delivery.clone());
            }
            std::mem::take(&mut state.consumers)
        };
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_entry(&self.key, self);
        }
        consumers
    }

    /// Queue `delivery` on every attached consumer, then drain them.
    fn broadcast(&self, delivery: Delivery<T>) {
        let consumers: Vec<Arc<SerialConsumer<T>>> = {
            let mut state = self.lock();
            if state.terminal {
                return;
            }
            match &delivery {
                Delivery::Result(envelope) => state.last_intermediate = Some(envelope.clone()),
                Delivery::Progress(progress) => state.last_progress = Some(*progress),
                Delivery::Failure(_) | Delivery::Cancellation => {}
            }
            state
                .consumers
                .iter()
                .map(|a| {
                    a.consumer.push(delivery.clone());
                    Arc::clone(&a.consumer)
                })
                .collect()
        };
        for consumer in consumers {
            consumer.drain();
        }
    }
}

/// Receives the shared downstream production's results.
struct Forwarder<K, T> {
    mux: Arc<Multiplexer<K, T>>,
}

impl<K, T> Consumer<T> for Forwarder<K, T>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn on_new_result(&self, envelope: Envelope<T>) {
        if !envelope.is_last() {
            self.mux.broadcast(Delivery::Result(envelope));
            return;
        }
        let name = self.mux.name();
        for attached in self.mux.finish(Delivery::Result(envelope)) {
            attached
                .context
                .listener()
                .on_producer_finish_with_success(attached.context.id(), name, &[]);
            attached.consumer.drain();
        }
    }

    fn on_failure(&self, error: PipelineError) {
        let name = self.mux.name();
        for attached in self.mux.finish(Delivery::Failure(error.clone())) {
            attached
                .context
                .listener()
                .on_producer_finish_with_failure(attached.context.id(), name, &error);
            attached.consumer.drain();
        }
    }

    fn on_cancellation(&self) {
        for attached in self.mux.finish(Delivery::Cancellation) {
            attached.consumer.drain();
        }
    }

    fn on_progress_update(&self, progress: f32) {
        self.mux.broadcast(Delivery::Progress(progress));
    }
}

/// Registered on each attached consumer's context.
struct AttachedCallbacks<K, T> {
    mux: Weak<Multiplexer<K, T>>,
    id: u64,
}

impl<K, T> ContextCallbacks for AttachedCallbacks<K, T>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn on_cancellation_requested(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.detach(self.id);
        }
    }

    fn on_priority_changed(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.update_downstream();
        }
    }

    fn on_is_prefetch_changed(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.update_downstream();
        }
    }

    fn on_is_intermediate_result_expected_changed(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.update_downstream();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producers::base::{Origin, Status};
    use crate::testing::{test_context, test_context_for, ManualProducer, RecordingConsumer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records payloads and how deeply its callbacks nest. Runs `hook` inside
    /// the first result it sees.
    #[derive(Default)]
    struct NestingConsumer {
        seen: Mutex<Vec<u32>>,
        depth: AtomicUsize,
        max_depth: AtomicUsize,
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl Consumer<u32> for NestingConsumer {
        fn on_new_result(&self, envelope: Envelope<u32>) {
            let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_depth.fetch_max(depth, Ordering::SeqCst);
            if let Some(payload) = envelope.payload {
                self.seen.lock().unwrap().push(payload);
            }
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _error: PipelineError) {}

        fn on_cancellation(&self) {}
    }

    fn by_uri(next: ProducerRef<u32>) -> MultiplexProducer<String, u32> {
        MultiplexProducer::new("TestMultiplexProducer", Arc::new(|r: &ImageRequest| r.uri()), next)
    }

    #[test]
    fn test_concurrent_requests_share_one_production() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let consumers: Vec<_> = (0..3).map(|_| RecordingConsumer::<u32>::new()).collect();

        for consumer in &consumers {
            mux.produce_results(consumer.clone(), test_context("https://example.com/a.jpg"));
        }
        assert_eq!(manual.started(), 1);
        assert_eq!(mux.in_flight(), 1);

        manual.deliver(0, Envelope::final_result(7, Origin::Network));

        for consumer in &consumers {
            assert_eq!(consumer.payloads(), vec![7]);
            assert_eq!(consumer.last_status(), Some(Status::Final));
            assert_eq!(consumer.terminal_count(), 1);
        }
        assert_eq!(mux.in_flight(), 0);
    }

    #[test]
    fn test_different_keys_run_separately() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        mux.produce_results(RecordingConsumer::<u32>::new(), test_context("https://example.com/a.jpg"));
        mux.produce_results(RecordingConsumer::<u32>::new(), test_context("https://example.com/b.jpg"));
        assert_eq!(manual.started(), 2);
    }

    #[test]
    fn test_late_consumer_gets_last_intermediate() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let first = RecordingConsumer::<u32>::new();
        mux.produce_results(first.clone(), test_context("https://example.com/a.jpg"));
        manual.deliver(0, Envelope::intermediate(1, Origin::Network));

        let late = RecordingConsumer::<u32>::new();
        mux.produce_results(late.clone(), test_context("https://example.com/a.jpg"));
        assert_eq!(late.payloads(), vec![1]);

        manual.deliver(0, Envelope::final_result(2, Origin::Network));
        assert_eq!(first.payloads(), vec![1, 2]);
        assert_eq!(late.payloads(), vec![1, 2]);
    }

    #[test]
    fn test_failure_is_broadcast_identically() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let a = RecordingConsumer::<u32>::new();
        let b = RecordingConsumer::<u32>::new();
        mux.produce_results(a.clone(), test_context("https://example.com/a.jpg"));
        mux.produce_results(b.clone(), test_context("https://example.com/a.jpg"));

        manual.fail(
            0,
            PipelineError::Decode {
                uri: "https://example.com/a.jpg".into(),
                message: "bad".into(),
            },
        );

        let a_err = a.failure().unwrap().to_string();
        assert_eq!(a_err, b.failure().unwrap().to_string());
        assert_eq!(a.terminal_count(), 1);
    }

    #[test]
    fn test_cancelling_sole_consumer_cancels_downstream() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let consumer = RecordingConsumer::<u32>::new();
        let ctx = test_context("https://example.com/a.jpg");
        mux.produce_results(consumer.clone(), Arc::clone(&ctx));

        ctx.cancel();

        assert!(consumer.was_cancelled());
        assert!(manual.context(0).is_cancelled());
        assert_eq!(mux.in_flight(), 0);
    }

    #[test]
    fn test_cancelling_one_of_two_keeps_downstream_running() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let leaving = RecordingConsumer::<u32>::new();
        let staying = RecordingConsumer::<u32>::new();
        let leaving_ctx = test_context("https://example.com/a.jpg");
        mux.produce_results(leaving.clone(), Arc::clone(&leaving_ctx));
        mux.produce_results(staying.clone(), test_context("https://example.com/a.jpg"));

        leaving_ctx.cancel();
        assert!(leaving.was_cancelled());
        assert!(!manual.context(0).is_cancelled());

        manual.deliver(0, Envelope::final_result(9, Origin::Network));
        assert_eq!(staying.payloads(), vec![9]);
        assert!(leaving.payloads().is_empty());
    }

    #[test]
    fn test_new_request_after_terminal_starts_fresh_production() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        mux.produce_results(RecordingConsumer::<u32>::new(), test_context("https://example.com/a.jpg"));
        manual.deliver(0, Envelope::final_result(1, Origin::Network));

        let again = RecordingConsumer::<u32>::new();
        mux.produce_results(again.clone(), test_context("https://example.com/a.jpg"));
        assert_eq!(manual.started(), 2);
        assert!(again.payloads().is_empty());
    }

    #[test]
    fn test_downstream_priority_is_max_of_attached() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let low = ImageRequest::builder("https://example.com/a.jpg")
            .unwrap()
            .priority(Priority::Low)
            .build();
        mux.produce_results(RecordingConsumer::<u32>::new(), test_context_for(low, false));
        assert_eq!(manual.context(0).priority(), Priority::Low);

        let high_ctx = test_context("https://example.com/a.jpg");
        mux.produce_results(RecordingConsumer::<u32>::new(), Arc::clone(&high_ctx));
        high_ctx.set_priority(Priority::High);
        assert_eq!(manual.context(0).priority(), Priority::High);
    }

    #[test]
    fn test_downstream_is_prefetch_only_when_all_are() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let request = ImageRequest::from_uri("https://example.com/a.jpg").unwrap();
        mux.produce_results(RecordingConsumer::<u32>::new(), test_context_for(request.clone(), true));
        assert!(manual.context(0).is_prefetch());

        mux.produce_results(RecordingConsumer::<u32>::new(), test_context_for(request, false));
        assert!(!manual.context(0).is_prefetch());
    }

    #[test]
    fn test_different_levels_run_separately() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let cache_only = ImageRequest::builder("https://example.com/a.jpg")
            .unwrap()
            .lowest_permitted_level(RequestLevel::DiskCache)
            .build();
        let lookup = RecordingConsumer::<u32>::new();
        let full = RecordingConsumer::<u32>::new();
        mux.produce_results(lookup.clone(), test_context_for(cache_only, false));
        mux.produce_results(full.clone(), test_context("https://example.com/a.jpg"));

        assert_eq!(manual.started(), 2);
        assert_eq!(manual.context(0).lowest_permitted_level(), RequestLevel::DiskCache);
        assert_eq!(manual.context(1).lowest_permitted_level(), RequestLevel::FullFetch);

        manual.deliver(0, Envelope::no_result(Origin::DiskCache));
        manual.deliver(1, Envelope::final_result(5, Origin::Network));
        assert_eq!(lookup.last_status(), Some(Status::NoResult));
        assert_eq!(full.payloads(), vec![5]);
        assert_eq!(full.last_status(), Some(Status::Final));
    }

    #[test]
    fn test_broadcast_during_replay_is_queued_behind_it() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let first = RecordingConsumer::<u32>::new();
        mux.produce_results(first.clone(), test_context("https://example.com/a.jpg"));
        manual.deliver(0, Envelope::intermediate(1, Origin::Network));

        let late = Arc::new(NestingConsumer::default());
        let downstream = manual.clone();
        *late.hook.lock().unwrap() = Some(Box::new(move || {
            downstream.deliver(0, Envelope::intermediate(2, Origin::Network));
        }));
        mux.produce_results(late.clone(), test_context("https://example.com/a.jpg"));

        assert_eq!(*late.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(late.max_depth.load(Ordering::SeqCst), 1);

        manual.deliver(0, Envelope::final_result(3, Origin::Network));
        assert_eq!(*late.seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(first.payloads(), vec![1, 2, 3]);
    }

    #[test]
    fn test_late_joiners_all_get_replay_then_final() {
        let manual = ManualProducer::<u32>::new();
        let mux = by_uri(manual.clone());
        let early: Vec<_> = (0..3).map(|_| RecordingConsumer::<u32>::new()).collect();
        for consumer in &early {
            mux.produce_results(consumer.clone(), test_context("https://example.com/a.jpg"));
        }
        manual.progress(0, 0.5);
        manual.deliver(0, Envelope::intermediate(1, Origin::Network));

        let late: Vec<_> = (0..2).map(|_| RecordingConsumer::<u32>::new()).collect();
        for consumer in &late {
            mux.produce_results(consumer.clone(), test_context("https://example.com/a.jpg"));
        }
        assert_eq!(manual.started(), 1);
        manual.deliver(0, Envelope::final_result(2, Origin::Network));

        for consumer in early.iter().chain(&late) {
            assert_eq!(consumer.payloads(), vec![1, 2]);
            assert_eq!(consumer.progress_updates(), vec![0.5]);
            assert_eq!(consumer.terminal_count(), 1);
        }
    }
}
