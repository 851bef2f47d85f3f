//! Callback Scheduler
//!
//! Registration callbacks never run inside the write that triggered them.
//! They are handed to a [`Scheduler`] and run later, which is what gives
//! several writes in a row the chance to coalesce into one callback.
//!
//! Two schedulers are provided:
//!
//! - [`TokioScheduler`] spawns each job as a task on a tokio runtime.
//! - [`QueueScheduler`] holds jobs until [`QueueScheduler::run_pending`] is
//!   called. Use it where there is no runtime, or where tests need to decide
//!   exactly when callbacks run.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tokio::runtime::Handle;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dispatches registration callbacks.
pub trait Scheduler: Send + Sync {
    /// Arrange for `job` to run at some later point.
    ///
    /// A job may also be dropped unrun, for example when the runtime shuts
    /// down. The registration it belongs to then reschedules on its next
    /// change.
    fn schedule(&self, job: Job);

    /// Run whatever is queued on the calling thread. Returns the number of
    /// jobs run. Schedulers that run jobs elsewhere return 0.
    fn run_pending(&self) -> usize {
        0
    }
}

/// Spawns jobs onto a tokio runtime.
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler").finish_non_exhaustive()
    }
}

/// Queues jobs until they are run explicitly.
#[derive(Default)]
pub struct QueueScheduler {
    queue: Mutex<VecDeque<Job>>,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, job: Job) {
        self.queue.lock().push_back(job);
    }

    /// Run jobs until the queue is empty, including jobs scheduled by the
    /// jobs themselves.
    fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Pop under the lock, run outside it.
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("pending", &self.len())
            .finish()
    }
}
