//! Per-request control object shared by every stage of a chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::request::{ImageRequest, Priority, RequestLevel};

use super::listener::RequestListener;

/// Notified when a context's mutable state changes.
pub trait ContextCallbacks: Send + Sync {
    fn on_cancellation_requested(&self);

    fn on_priority_changed(&self) {}

    fn on_is_prefetch_changed(&self) {}

    fn on_is_intermediate_result_expected_changed(&self) {}
}

/// Cancellation-only callback built from a closure.
pub struct OnCancel<F>(pub F);

impl<F: Fn() + Send + Sync> ContextCallbacks for OnCancel<F> {
    fn on_cancellation_requested(&self) {
        (self.0)();
    }
}

/// Initial values of the mutable parts of a context.
#[derive(Debug, Clone, Copy)]
pub struct ContextSettings {
    pub priority: Priority,
    pub is_prefetch: bool,
    pub intermediate_results_expected: bool,
    pub lowest_permitted_level: RequestLevel,
}

impl ContextSettings {
    pub fn for_request(request: &ImageRequest, is_prefetch: bool) -> Self {
        Self {
            priority: request.priority(),
            is_prefetch,
            intermediate_results_expected: request.progressive_rendering(),
            lowest_permitted_level: request.lowest_permitted_level(),
        }
    }
}

struct ContextState {
    priority: Priority,
    is_prefetch: bool,
    intermediate_results_expected: bool,
    callbacks: Vec<Arc<dyn ContextCallbacks>>,
}

pub struct ProducerContext {
    id: String,
    request: Arc<ImageRequest>,
    listener: Arc<dyn RequestListener>,
    lowest_permitted_level: RequestLevel,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    state: Mutex<ContextState>,
}

impl ProducerContext {
    pub fn new(
        id: impl Into<String>,
        request: Arc<ImageRequest>,
        listener: Arc<dyn RequestListener>,
        settings: ContextSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            request,
            listener,
            lowest_permitted_level: settings.lowest_permitted_level,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            state: Mutex::new(ContextState {
                priority: settings.priority,
                is_prefetch: settings.is_prefetch,
                intermediate_results_expected: settings.intermediate_results_expected,
                callbacks: Vec::new(),
            }),
        })
    }

    /// Context for a different request that shares this one's id, listener
    /// and lifecycle. Cancelling the parent cancels the child.
    pub fn for_request(self: &Arc<Self>, request: Arc<ImageRequest>) -> Arc<Self> {
        let mut settings = ContextSettings::for_request(&request, self.is_prefetch());
        settings.priority = self.priority();
        settings.intermediate_results_expected = self.is_intermediate_results_expected();
        let child = Self::new(self.id.clone(), request, Arc::clone(&self.listener), settings);
        let weak = Arc::downgrade(&child);
        self.add_callbacks(Arc::new(OnCancel(move || {
            if let Some(child) = weak.upgrade() {
                child.cancel();
            }
        })));
        child
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &Arc<ImageRequest> {
        &self.request
    }

    pub fn listener(&self) -> &Arc<dyn RequestListener> {
        &self.listener
    }

    pub fn lowest_permitted_level(&self) -> RequestLevel {
        self.lowest_permitted_level
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn priority(&self) -> Priority {
        self.lock().priority
    }

    pub fn is_prefetch(&self) -> bool {
        self.lock().is_prefetch
    }

    pub fn is_intermediate_results_expected(&self) -> bool {
        self.lock().intermediate_results_expected
    }

    /// Register callbacks. If the context is already cancelled the
    /// cancellation callback runs immediately on the calling thread.
    pub fn add_callbacks(&self, callbacks: Arc<dyn ContextCallbacks>) {
        {
            let mut state = self.lock();
            if !self.is_cancelled() {
                state.callbacks.push(callbacks);
                return;
            }
        }
        callbacks.on_cancellation_requested();
    }

    /// Request cancellation. Callbacks run once, outside the state lock.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_notify.notify_waiters();
        let callbacks = std::mem::take(&mut self.lock().callbacks);
        tracing::trace!("request {} cancelled", self.id);
        for callback in callbacks {
            callback.on_cancellation_requested();
        }
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub fn set_priority(&self, priority: Priority) {
        let callbacks = {
            let mut state = self.lock();
            if state.priority == priority {
                return;
            }
            state.priority = priority;
            state.callbacks.clone()
        };
        for callback in callbacks {
            callback.on_priority_changed();
        }
    }

    pub fn set_is_prefetch(&self, is_prefetch: bool) {
        let callbacks = {
            let mut state = self.lock();
            if state.is_prefetch == is_prefetch {
                return;
            }
            state.is_prefetch = is_prefetch;
            state.callbacks.clone()
        };
        for callback in callbacks {
            callback.on_is_prefetch_changed();
        }
    }

    pub fn set_intermediate_results_expected(&self, expected: bool) {
        let callbacks = {
            let mut state = self.lock();
            if state.intermediate_results_expected == expected {
                return;
            }
            state.intermediate_results_expected = expected;
            state.callbacks.clone()
        };
        for callback in callbacks {
            callback.on_is_intermediate_result_expected_changed();
        }
    }
}

impl std::fmt::Debug for ProducerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerContext")
            .field("id", &self.id)
            .field("uri", &self.request.uri())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counting {
        cancels: AtomicUsize,
        priority_changes: AtomicUsize,
    }

    impl ContextCallbacks for Counting {
        fn on_cancellation_requested(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn on_priority_changed(&self) {
            self.priority_changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            cancels: AtomicUsize::new(0),
            priority_changes: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_cancel_fires_callbacks_once() {
        let ctx = test_context("https://example.com/a.jpg");
        let callbacks = counting();
        ctx.add_callbacks(callbacks.clone());

        ctx.cancel();
        ctx.cancel();

        assert!(ctx.is_cancelled());
        assert_eq!(callbacks.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_callbacks_fire_immediately() {
        let ctx = test_context("https://example.com/a.jpg");
        ctx.cancel();
        let callbacks = counting();
        ctx.add_callbacks(callbacks.clone());
        assert_eq!(callbacks.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_priority_callbacks_only_on_change() {
        let ctx = test_context("https://example.com/a.jpg");
        let callbacks = counting();
        ctx.add_callbacks(callbacks.clone());

        ctx.set_priority(ctx.priority());
        ctx.set_priority(Priority::High);
        ctx.set_priority(Priority::High);

        assert_eq!(ctx.priority(), Priority::High);
        assert_eq!(callbacks.priority_changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_context_follows_parent_cancellation() {
        let ctx = test_context("https://example.com/a.jpg");
        let child = ctx.for_request(Arc::new(
            ImageRequest::from_uri("https://example.com/a_small.jpg").unwrap(),
        ));
        assert_eq!(child.id(), ctx.id());
        ctx.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let ctx = test_context("https://example.com/a.jpg");
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
