//! Named executors.
//!
//! Stages never spawn threads themselves; they hand closures to one of the
//! executors exposed by an [`ExecutorSupplier`]. Async I/O (network, disk
//! cache) runs as tasks on the supplier's tokio runtime handle.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::config::ExecutorsConfig;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs, possibly on another thread.
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, job: Job);
}

/// The named executors every stage may dispatch onto.
pub trait ExecutorSupplier: Send + Sync {
    fn for_decode(&self) -> Arc<dyn Executor>;

    fn for_local_storage_read(&self) -> Arc<dyn Executor>;

    fn for_background(&self) -> Arc<dyn Executor>;

    fn for_transform(&self) -> Arc<dyn Executor>;

    /// Runtime used for network fetches and disk cache I/O.
    fn runtime(&self) -> Handle;
}

/// Runs blocking jobs on the tokio blocking pool, at most `threads` at once.
pub struct BlockingExecutor {
    name: String,
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl BlockingExecutor {
    pub fn new(name: impl Into<String>, handle: Handle, threads: usize) -> Self {
        Self {
            name: name.into(),
            handle,
            permits: Arc::new(Semaphore::new(threads.max(1))),
        }
    }
}

impl Executor for BlockingExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, job: Job) {
        let permits = Arc::clone(&self.permits);
        let name = self.name.clone();
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::error!("{name} executor closed, dropping job");
                return;
            };
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                tracing::error!("{name} executor job panicked: {e}");
            }
        });
    }
}

/// Runs every job immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        "inline"
    }

    fn execute(&self, job: Job) {
        job();
    }
}

/// Tokio-backed supplier with one bounded executor per name.
pub struct DefaultExecutorSupplier {
    handle: Handle,
    decode: Arc<dyn Executor>,
    local_read: Arc<dyn Executor>,
    background: Arc<dyn Executor>,
    transform: Arc<dyn Executor>,
}

impl DefaultExecutorSupplier {
    pub fn new(handle: Handle, config: &ExecutorsConfig) -> Self {
        let make = |name: &str, threads: usize| -> Arc<dyn Executor> {
            Arc::new(BlockingExecutor::new(name, handle.clone(), threads))
        };
        Self {
            decode: make("decode", config.decode_threads),
            local_read: make("local-read", config.local_read_threads),
            background: make("background", config.background_threads),
            transform: make("transform", config.transform_threads),
            handle,
        }
    }
}

impl ExecutorSupplier for DefaultExecutorSupplier {
    fn for_decode(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.decode)
    }

    fn for_local_storage_read(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.local_read)
    }

    fn for_background(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.background)
    }

    fn for_transform(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.transform)
    }

    fn runtime(&self) -> Handle {
        self.handle.clone()
    }
}

/// Supplier whose named executors all run inline; async work still goes to
/// the given runtime.
pub struct InlineExecutorSupplier {
    handle: Handle,
}

impl InlineExecutorSupplier {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl ExecutorSupplier for InlineExecutorSupplier {
    fn for_decode(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn for_local_storage_read(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn for_background(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn for_transform(&self) -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn runtime(&self) -> Handle {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_inline_executor_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        InlineExecutor.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_executor_bounds_concurrency() {
        let executor = BlockingExecutor::new("decode", Handle::current(), 2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..6 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(());
            }));
        }
        for _ in 0..6 {
            rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
