//! Tracking Registrations
//!
//! A registration is an external observer's interest in whatever nodes its
//! body reads.
//!
//! # How Registrations Work
//!
//! 1. When created, the body runs immediately inside a registration frame.
//!    Every node it reads becomes watched.
//!
//! 2. When a watched node changes, or anything upstream of a watched computed
//!    node changes, the registration is invalidated and a rerun is handed to
//!    the graph's scheduler.
//!
//! 3. Further changes before that rerun starts are dropped: one episode,
//!    one callback. The rerun is told which node started the episode.
//!
//! 4. The rerun forgets the old watched set and runs the body again in a
//!    fresh frame, so conditional reads are tracked as they are now.
//!
//! # Cancellation
//!
//! Cancelling (or dropping the [`Registration`]) removes it from every node
//! it watches. A rerun that was already queued checks the cancelled flag and
//! does nothing.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::graph::{Graph, GraphInner, NodeId, NodeKey};

use super::context::{Frame, TrackingContext};

/// Unique identifier for a tracking registration.
///
/// Uses an atomic counter so IDs are unique across threads and graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl RegistrationId {
    /// Generate a new unique registration ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RegistrationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Passed to a registration body on every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingRun {
    /// Zero for the initial run, then one more per rerun.
    pub run: usize,

    /// The first node that changed in the episode that caused this run.
    /// `None` on the initial run.
    pub trigger: Option<NodeId>,
}

type Body = Box<dyn Fn(&TrackingRun) + Send + Sync>;

/// Shared state of a registration.
pub(crate) struct RegistrationInner {
    id: RegistrationId,
    graph: Weak<GraphInner>,
    body: Body,

    /// Nodes read during the last run.
    watched: Mutex<IndexSet<NodeKey>>,

    /// Set from the first change of an episode until its rerun starts.
    invalidated: AtomicBool,
    cancelled: AtomicBool,
    trigger: Mutex<Option<NodeId>>,
    runs: AtomicUsize,

    /// Serialises reruns when the scheduler runs jobs in parallel.
    running: Mutex<()>,
}

impl RegistrationInner {
    fn new(graph: Weak<GraphInner>, body: Body) -> Self {
        Self {
            id: RegistrationId::new(),
            graph,
            body,
            watched: Mutex::new(IndexSet::new()),
            invalidated: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            trigger: Mutex::new(None),
            runs: AtomicUsize::new(0),
            running: Mutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> RegistrationId {
        self.id
    }

    pub(crate) fn watch(&self, key: NodeKey) {
        self.watched.lock().insert(key);
    }

    pub(crate) fn forget(&self, key: NodeKey) {
        self.watched.lock().shift_remove(&key);
    }

    /// Note a change. Schedules a rerun unless one is already pending.
    pub(crate) fn invalidate(self: &Arc<Self>, graph: &Graph, trigger: NodeId) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.invalidated.swap(true, Ordering::AcqRel) {
            trace!(registration = ?self.id, %trigger, "coalesced change");
            return;
        }

        *self.trigger.lock() = Some(trigger);
        let run = ScheduledRun {
            registration: Some(Arc::clone(self)),
        };
        graph.scheduler().schedule(Box::new(move || run.run()));
    }

    fn run_scheduled(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let Some(inner) = self.graph.upgrade() else {
            return;
        };
        let graph = Graph::from_inner(inner);

        // Take the trigger before reopening the episode so a change landing
        // after the reset belongs to the next episode.
        let trigger = self.trigger.lock().take();
        self.invalidated.store(false, Ordering::Release);
        self.execute(&graph, trigger);
    }

    /// Run the body in a fresh frame, rebuilding the watched set.
    fn execute(&self, graph: &Graph, trigger: Option<NodeId>) {
        let _running = self.running.lock();
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }

        self.unwatch_all(graph);

        let run = TrackingRun {
            run: self.runs.fetch_add(1, Ordering::AcqRel),
            trigger,
        };
        trace!(registration = ?self.id, run = run.run, "running registration");

        let _ctx = TrackingContext::enter(Frame::Registration {
            graph: graph.id(),
            id: self.id,
        });
        (self.body)(&run);
    }

    fn unwatch_all(&self, graph: &Graph) {
        let keys = std::mem::take(&mut *self.watched.lock());
        for key in keys {
            if let Some(cell) = graph.cell(key) {
                cell.state.lock().registrations.shift_remove(&self.id);
            }
        }
    }
}

/// A rerun handed to the scheduler.
///
/// If the scheduler drops the job without running it, the episode is closed
/// so the next change schedules again.
struct ScheduledRun {
    registration: Option<Arc<RegistrationInner>>,
}

impl ScheduledRun {
    fn run(mut self) {
        if let Some(registration) = self.registration.take() {
            registration.run_scheduled();
        }
    }
}

impl Drop for ScheduledRun {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.trigger.lock().take();
            registration.invalidated.store(false, Ordering::Release);
            trace!(registration = ?registration.id, "scheduled rerun dropped");
        }
    }
}

/// Handle to a tracking registration.
///
/// Dropping the handle cancels the registration.
pub struct Registration {
    inner: Arc<RegistrationInner>,
    graph: Graph,
}

impl Registration {
    pub fn id(&self) -> RegistrationId {
        self.inner.id
    }

    /// Number of times the body has run, including the initial run.
    pub fn run_count(&self) -> usize {
        self.inner.runs.load(Ordering::Acquire)
    }

    /// Nodes read during the last run.
    pub fn watched(&self) -> Vec<NodeId> {
        self.inner
            .watched
            .lock()
            .iter()
            .map(|key| NodeId::new(self.graph.id(), *key))
            .collect()
    }

    /// Whether a rerun is pending.
    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Stop observing. Safe to call more than once and concurrently with a
    /// scheduled rerun; a rerun that has not started yet will not run.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.unwatch_all(&self.graph);
        self.graph.remove_registration(self.inner.id);
        debug!(registration = ?self.inner.id, "cancelled registration");
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("watched", &self.inner.watched.lock().len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Graph {
    /// Register `body` as an observer of every node it reads.
    ///
    /// The body runs once right away. After that it reruns, through the
    /// graph's scheduler, once per batch of changes to what it read.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let name = graph.stored("name", String::from("ada"));
    /// let reader = name.clone();
    /// let registration = graph.track(move |run| {
    ///     println!("run {}: {}", run.run, reader.read());
    /// });
    ///
    /// name.write("grace".into());
    /// name.write("hopper".into());
    /// graph.flush(); // prints once: "run 1: hopper"
    /// ```
    pub fn track<F>(&self, body: F) -> Registration
    where
        F: Fn(&TrackingRun) + Send + Sync + 'static,
    {
        let inner = Arc::new(RegistrationInner::new(self.downgrade(), Box::new(body)));
        self.add_registration(Arc::clone(&inner));
        inner.execute(self, None);
        Registration {
            inner,
            graph: self.clone(),
        }
    }
}
