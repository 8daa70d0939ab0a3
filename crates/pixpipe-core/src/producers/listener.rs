//! Request and producer lifecycle observers.

use std::sync::Arc;

use crate::error::PipelineError;
use crate::request::ImageRequest;

/// Receives lifecycle events for requests and the stages they pass through.
/// Every method defaults to a no-op.
pub trait RequestListener: Send + Sync {
    fn on_request_start(&self, _request: &ImageRequest, _request_id: &str, _is_prefetch: bool) {}

    fn on_request_success(&self, _request: &ImageRequest, _request_id: &str, _is_prefetch: bool) {}

    fn on_request_failure(
        &self,
        _request: &ImageRequest,
        _request_id: &str,
        _error: &PipelineError,
        _is_prefetch: bool,
    ) {
    }

    fn on_request_cancellation(&self, _request_id: &str) {}

    fn on_producer_start(&self, _request_id: &str, _producer: &str) {}

    fn on_producer_event(&self, _request_id: &str, _producer: &str, _event: &str) {}

    fn on_producer_finish_with_success(
        &self,
        _request_id: &str,
        _producer: &str,
        _extra: &[(&'static str, String)],
    ) {
    }

    fn on_producer_finish_with_failure(
        &self,
        _request_id: &str,
        _producer: &str,
        _error: &PipelineError,
    ) {
    }

    fn on_producer_finish_with_cancellation(&self, _request_id: &str, _producer: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRequestListener;

impl RequestListener for NoopRequestListener {}

/// Reports lifecycle events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRequestListener;

impl RequestListener for TracingRequestListener {
    fn on_request_start(&self, request: &ImageRequest, request_id: &str, is_prefetch: bool) {
        tracing::debug!(request_id, uri = %request.uri(), is_prefetch, "request started");
    }

    fn on_request_success(&self, request: &ImageRequest, request_id: &str, _is_prefetch: bool) {
        tracing::debug!(request_id, uri = %request.uri(), "request succeeded");
    }

    fn on_request_failure(
        &self,
        request: &ImageRequest,
        request_id: &str,
        error: &PipelineError,
        _is_prefetch: bool,
    ) {
        tracing::debug!(request_id, uri = %request.uri(), "request failed: {error}");
    }

    fn on_request_cancellation(&self, request_id: &str) {
        tracing::debug!(request_id, "request cancelled");
    }

    fn on_producer_start(&self, request_id: &str, producer: &str) {
        tracing::trace!(request_id, producer, "producer started");
    }

    fn on_producer_event(&self, request_id: &str, producer: &str, event: &str) {
        tracing::trace!(request_id, producer, event, "producer event");
    }

    fn on_producer_finish_with_success(
        &self,
        request_id: &str,
        producer: &str,
        extra: &[(&'static str, String)],
    ) {
        tracing::trace!(request_id, producer, ?extra, "producer finished");
    }

    fn on_producer_finish_with_failure(
        &self,
        request_id: &str,
        producer: &str,
        error: &PipelineError,
    ) {
        tracing::debug!(request_id, producer, "producer failed: {error}");
    }

    fn on_producer_finish_with_cancellation(&self, request_id: &str, producer: &str) {
        tracing::trace!(request_id, producer, "producer cancelled");
    }
}

/// Fans every event out to a list of listeners.
#[derive(Default, Clone)]
pub struct ForwardingRequestListener {
    listeners: Vec<Arc<dyn RequestListener>>,
}

impl ForwardingRequestListener {
    pub fn new(listeners: Vec<Arc<dyn RequestListener>>) -> Self {
        Self { listeners }
    }

    pub fn push(&mut self, listener: Arc<dyn RequestListener>) {
        self.listeners.push(listener);
    }
}

impl RequestListener for ForwardingRequestListener {
    fn on_request_start(&self, request: &ImageRequest, request_id: &str, is_prefetch: bool) {
        for l in &self.listeners {
            l.on_request_start(request, request_id, is_prefetch);
        }
    }

    fn on_request_success(&self, request: &ImageRequest, request_id: &str, is_prefetch: bool) {
        for l in &self.listeners {
            l.on_request_success(request, request_id, is_prefetch);
        }
    }

    fn on_request_failure(
        &self,
        request: &ImageRequest,
        request_id: &str,
        error: &PipelineError,
        is_prefetch: bool,
    ) {
        for l in &self.listeners {
            l.on_request_failure(request, request_id, error, is_prefetch);
        }
    }

    fn on_request_cancellation(&self, request_id: &str) {
        for l in &self.listeners {
            l.on_request_cancellation(request_id);
        }
    }

    fn on_producer_start(&self, request_id: &str, producer: &str) {
        for l in &self.listeners {
            l.on_producer_start(request_id, producer);
        }
    }

    fn on_producer_event(&self, request_id: &str, producer: &str, event: &str) {
        for l in &self.listeners {
            l.on_producer_event(request_id, producer, event);
        }
    }

    fn on_producer_finish_with_success(
        &self,
        request_id: &str,
        producer: &str,
        extra: &[(&'static str, String)],
    ) {
        for l in &self.listeners {
            l.on_producer_finish_with_success(request_id, producer, extra);
        }
    }

    fn on_producer_finish_with_failure(
        &self,
        request_id: &str,
        producer: &str,
        error: &PipelineError,
    ) {
        for l in &self.listeners {
            l.on_producer_finish_with_failure(request_id, producer, error);
        }
    }

    fn on_producer_finish_with_cancellation(&self, request_id: &str, producer: &str) {
        for l in &self.listeners {
            l.on_producer_finish_with_cancellation(request_id, producer);
        }
    }
}
