//! Execution contexts
//!
//! Two kinds of deferred work exist in the core:
//!
//! - Protocol work (sending frame-done and release events, posting faults)
//!   must run on the protocol-handling context. [`QueuedExecutor`] collects it
//!   from any thread and the protocol loop drains it with
//!   [`QueuedExecutor::dispatch_pending`].
//! - GPU work (image creation, uploads) needs a current render context.
//!   [`RenderExecutor`] implementations run it with a context made current for
//!   exactly the duration of the job.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::error::PlatformError;
use crate::platform::{ContextGuard, RenderContext};

/// A unit of deferred work
pub type Work = Box<dyn FnOnce() + Send>;

/// GPU work; receives whether the render context could be made current
pub type RenderWork = Box<dyn FnOnce(Result<(), PlatformError>) + Send>;

pub trait Executor: Send + Sync {
    fn spawn(&self, work: Work);
}

pub trait RenderExecutor: Send + Sync {
    fn spawn_render(&self, work: RenderWork);
}

/// Executor drained explicitly by the protocol loop
#[derive(Default)]
pub struct QueuedExecutor {
    queue: Mutex<VecDeque<Work>>,
}

impl QueuedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs everything queued so far, including work queued by that work
    ///
    /// Returns the number of jobs run. The queue lock is never held while a job runs.
    pub fn dispatch_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch: Vec<Work> = self.queue.lock().drain(..).collect();
            if batch.is_empty() {
                return ran;
            }
            for work in batch {
                work();
                ran += 1;
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Executor for QueuedExecutor {
    fn spawn(&self, work: Work) {
        self.queue.lock().push_back(work);
    }
}

fn run_with_context(context: &dyn RenderContext, work: RenderWork) {
    match ContextGuard::acquire(context) {
        Ok(_guard) => work(Ok(())),
        Err(e) => {
            warn!("⚠️ Render worker could not make its context current: {}", e);
            work(Err(e))
        }
    }
}

/// Runs render work immediately on the calling thread
pub struct InlineRenderExecutor {
    context: Arc<dyn RenderContext>,
}

impl InlineRenderExecutor {
    pub fn new(context: Arc<dyn RenderContext>) -> Self {
        Self { context }
    }
}

impl RenderExecutor for InlineRenderExecutor {
    fn spawn_render(&self, work: RenderWork) {
        run_with_context(self.context.as_ref(), work);
    }
}

/// Bounded pool of render workers on a tokio runtime
///
/// Jobs run on tokio's blocking pool; at most `workers` of them run at once,
/// each with the worker context current for the duration of the job.
pub struct RenderWorkerPool {
    handle: Handle,
    context: Arc<dyn RenderContext>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    workers: usize,
}

impl RenderWorkerPool {
    pub fn new(handle: Handle, context: Arc<dyn RenderContext>, workers: usize) -> Self {
        let workers = workers.max(1);
        debug!("🧵 Render worker pool with {} workers", workers);
        Self {
            handle,
            context,
            permits: Arc::new(Semaphore::new(workers)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            workers,
        }
    }

    /// Pool on the runtime the caller is running in
    pub fn from_current(context: Arc<dyn RenderContext>, workers: usize) -> Option<Self> {
        Handle::try_current()
            .ok()
            .map(|handle| Self::new(handle, context, workers))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Jobs submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl RenderExecutor for RenderWorkerPool {
    fn spawn_render(&self, work: RenderWork) {
        let context = self.context.clone();
        let permits = self.permits.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::AcqRel);

        self.handle.spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    work(Err(PlatformError::ContextUnavailable(
                        "render worker pool closed".into(),
                    )));
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            };
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                run_with_context(context.as_ref(), work);
            })
            .await;
            if let Err(e) = result {
                warn!("⚠️ Render job panicked: {}", e);
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }
}
