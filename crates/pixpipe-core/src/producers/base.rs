//! The producer/consumer contract every stage implements.
//!
//! A consumer moves through `NEW -> intermediate* -> terminal` where the
//! terminal transition is one of a final result, a failure or a
//! cancellation. [`TerminalGuard`] enforces that nothing follows the
//! terminal transition, so every stage wraps the consumer it hands out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::PipelineError;

use super::context::ProducerContext;

/// Lifecycle tag of a delivered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A partial result. More results follow.
    Intermediate,
    /// The last result of the request.
    Final,
    /// The request finished without producing anything.
    NoResult,
}

/// Where a delivered result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Network,
    Local,
    DiskCache,
    MemoryCache,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Local => "local",
            Self::DiskCache => "disk_cache",
            Self::MemoryCache => "memory_cache",
        }
    }
}

/// A result travelling up the chain.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: Option<T>,
    pub status: Status,
    pub origin: Origin,
}

impl<T> Envelope<T> {
    pub fn intermediate(payload: T, origin: Origin) -> Self {
        Self {
            payload: Some(payload),
            status: Status::Intermediate,
            origin,
        }
    }

    pub fn final_result(payload: T, origin: Origin) -> Self {
        Self {
            payload: Some(payload),
            status: Status::Final,
            origin,
        }
    }

    pub fn no_result(origin: Origin) -> Self {
        Self {
            payload: None,
            status: Status::NoResult,
            origin,
        }
    }

    /// True for `Final` and `NoResult`.
    pub fn is_last(&self) -> bool {
        self.status != Status::Intermediate
    }

    /// Convert the payload, keeping status and origin.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            payload: self.payload.map(f),
            status: self.status,
            origin: self.origin,
        }
    }

    /// Same payload with a different status.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }
}

/// Receives the results of one production.
///
/// Implementations must tolerate calls from any thread, but a correctly
/// wrapped consumer never sees two calls at once for the same request.
pub trait Consumer<T>: Send + Sync {
    /// Intermediate or last result. A last result is terminal.
    fn on_new_result(&self, envelope: Envelope<T>);

    fn on_failure(&self, error: PipelineError);

    fn on_cancellation(&self);

    /// Progress in `[0, 1]`.
    fn on_progress_update(&self, _progress: f32) {}
}

pub type ConsumerRef<T> = Arc<dyn Consumer<T>>;

/// One stage of a chain.
pub trait Producer<T>: Send + Sync {
    /// Begin producing for `consumer`. Exactly one terminal callback is
    /// eventually delivered to `consumer`.
    fn produce_results(&self, consumer: ConsumerRef<T>, context: Arc<ProducerContext>);

    /// Stage name reported to request listeners.
    fn name(&self) -> &'static str;
}

pub type ProducerRef<T> = Arc<dyn Producer<T>>;

/// Wraps a consumer so callbacks after the first terminal are dropped.
pub struct TerminalGuard<T> {
    inner: ConsumerRef<T>,
    finished: AtomicBool,
}

impl<T: Send + 'static> TerminalGuard<T> {
    pub fn wrap(inner: ConsumerRef<T>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            finished: AtomicBool::new(false),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Claim the terminal slot. Returns `false` when a terminal was
    /// already delivered.
    fn claim_terminal(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }
}

impl<T: Send + 'static> Consumer<T> for TerminalGuard<T> {
    fn on_new_result(&self, envelope: Envelope<T>) {
        if envelope.is_last() {
            if self.claim_terminal() {
                self.inner.on_new_result(envelope);
            }
        } else if !self.is_finished() {
            self.inner.on_new_result(envelope);
        }
    }

    fn on_failure(&self, error: PipelineError) {
        if self.claim_terminal() {
            self.inner.on_failure(error);
        } else {
            tracing::trace!("dropping failure after terminal: {error}");
        }
    }

    fn on_cancellation(&self) {
        if self.claim_terminal() {
            self.inner.on_cancellation();
        }
    }

    fn on_progress_update(&self, progress: f32) {
        if !self.is_finished() {
            self.inner.on_progress_update(progress);
        }
    }
}
