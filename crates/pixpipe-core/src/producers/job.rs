//! Per-request sequential job runner.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::PipelineError;
use crate::executor::{Executor, Job};

use super::base::{Consumer, TerminalGuard};
use super::context::ProducerContext;

type PanicHandler = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct SchedulerState {
    pending: Option<Job>,
    running: bool,
}

/// Runs jobs for one request on an executor, one at a time.
///
/// Only the newest pending job is kept: scheduling while another job waits
/// replaces it. Jobs never overlap, so the consumer they feed sees strictly
/// sequential callbacks. A job that panics is reported to the panic handler
/// and the runner moves on to the next pending job.
#[derive(Clone)]
pub struct JobScheduler {
    executor: Arc<dyn Executor>,
    state: Arc<Mutex<SchedulerState>>,
    on_panic: Option<PanicHandler>,
}

/// Clears `running` if the runner unwinds past its loop.
struct RunnerGuard<'a> {
    state: &'a Mutex<SchedulerState>,
    armed: bool,
}

impl Drop for RunnerGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            JobScheduler::lock(self.state).running = false;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl JobScheduler {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            on_panic: None,
        }
    }

    /// Call `handler` with the panic message whenever a job panics.
    pub fn on_panic(mut self, handler: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_panic = Some(Arc::new(handler));
        self
    }

    /// Fail `consumer` when a job panics, so the request still terminates.
    pub fn fail_on_panic<T: Send + 'static>(
        self,
        consumer: Arc<TerminalGuard<T>>,
        context: Arc<ProducerContext>,
        stage: &'static str,
    ) -> Self {
        self.on_panic(move |message| {
            let error = PipelineError::Panicked {
                uri: context.request().uri(),
                stage: stage.to_string(),
                message,
            };
            context
                .listener()
                .on_producer_finish_with_failure(context.id(), stage, &error);
            consumer.on_failure(error);
        })
    }

    fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
        state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `job`, replacing any job that has not started yet.
    pub fn schedule(&self, job: Job) {
        let start_runner = {
            let mut state = Self::lock(&self.state);
            if state.pending.replace(job).is_some() {
                tracing::trace!("replaced a pending job");
            }
            !std::mem::replace(&mut state.running, true)
        };
        if start_runner {
            let state = Arc::clone(&self.state);
            let on_panic = self.on_panic.clone();
            self.executor
                .execute(Box::new(move || Self::drain(&state, on_panic.as_ref())));
        }
    }

    /// Run `job` on the calling thread when the scheduler is idle, otherwise
    /// queue it behind the running job.
    ///
    /// For cheap work such as forwarding a result unchanged.
    pub fn run_inline_or_schedule(&self, job: Job) {
        {
            let mut state = Self::lock(&self.state);
            if state.running {
                if state.pending.replace(job).is_some() {
                    tracing::trace!("replaced a pending job");
                }
                return;
            }
            state.running = true;
        }
        let mut guard = RunnerGuard {
            state: &*self.state,
            armed: true,
        };
        Self::run_job(job, self.on_panic.as_ref());
        let restart = {
            let mut state = Self::lock(&self.state);
            if state.pending.is_none() {
                state.running = false;
            }
            state.pending.is_some()
        };
        guard.armed = false;
        if restart {
            let state = Arc::clone(&self.state);
            let on_panic = self.on_panic.clone();
            self.executor
                .execute(Box::new(move || Self::drain(&state, on_panic.as_ref())));
        }
    }

    /// Drop the pending job, if any.
    pub fn clear_pending(&self) {
        Self::lock(&self.state).pending = None;
    }

    fn drain(state: &Mutex<SchedulerState>, on_panic: Option<&PanicHandler>) {
        let mut guard = RunnerGuard { state, armed: true };
        loop {
            let next = {
                let mut locked = Self::lock(state);
                match locked.pending.take() {
                    Some(job) => job,
                    None => {
                        locked.running = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            Self::run_job(next, on_panic);
        }
    }

    fn run_job(job: Job, on_panic: Option<&PanicHandler>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let message = panic_message(&*payload);
            tracing::error!("Job panicked: {message}");
            if let Some(handler) = on_panic {
                handler(message);
            }
        }
    }
}
