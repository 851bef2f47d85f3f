//! Dependency Graph
//!
//! This module implements the storage side of the computation graph: the
//! arena of nodes, the edges between them, and the [`Graph`] handle that
//! owns both.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are stored sources or computed derivations
//! - Edges point from a node to each node that read it while computing
//!
//! Both endpoints hold the same edge, so dependencies and dependents can be
//! walked without a global index. The algorithms that move values through
//! the graph (reads, writes, recomputation) live in [`crate::reactive`].
//!
//! # Locking
//!
//! Every node has its own lock. Operations that touch two nodes at once
//! (attaching or detaching an edge) take both locks in arena-index order, so
//! two threads can never wait on each other. No lock is held while user code
//! runs.

mod arena;
mod edge;
mod node;

pub use arena::NodeKey;
pub use edge::Edge;
pub use node::{ErasedValue, GraphId, NodeId};

pub(crate) use arena::Arena;
pub(crate) use edge::EdgeList;
pub(crate) use node::{NodeCell, NodeKind, NodeState};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{MutexGuard, RwLock};
use tracing::{debug, trace};

use crate::config::GraphConfig;
use crate::reactive::channel::ChangeEmitter;
use crate::reactive::scheduler::{QueueScheduler, Scheduler, TokioScheduler};
use crate::reactive::tracking::RegistrationInner;
use crate::reactive::RegistrationId;

/// Shared state behind a [`Graph`].
pub(crate) struct GraphInner {
    id: GraphId,
    config: GraphConfig,
    arena: RwLock<Arena>,
    registrations: DashMap<RegistrationId, Arc<RegistrationInner>>,
    scheduler: Arc<dyn Scheduler>,

    /// Advanced after every change that can flag a node. Starts at 1 so a
    /// fresh node's zero stamp is never current.
    epoch: AtomicU64,
}

/// Handle to a computation graph.
///
/// Cloning is cheap and every clone refers to the same graph. Nodes are
/// created through the graph and keep it alive for as long as they exist.
///
/// # Example
///
/// ```rust,ignore
/// let graph = Graph::new();
/// let a = graph.stored("a", 1);
/// let a_in_rule = a.clone();
/// let b = graph.computed("b", move || a_in_rule.read() * 2);
///
/// assert_eq!(b.read(), 2);
/// a.write(5);
/// assert_eq!(b.read(), 10);
/// ```
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

/// Counts describing the current shape of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub registrations: usize,
}

impl Graph {
    /// Create a graph with the default config.
    ///
    /// Registration callbacks are spawned on the current tokio runtime when
    /// there is one. Otherwise they queue until [`Graph::flush`] is called.
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    /// Create a graph with the given config and the default scheduler.
    pub fn with_config(config: GraphConfig) -> Self {
        let scheduler: Arc<dyn Scheduler> = match TokioScheduler::current() {
            Some(tokio) => Arc::new(tokio),
            None => Arc::new(QueueScheduler::new()),
        };
        Self::with_scheduler(config, scheduler)
    }

    /// Create a graph that dispatches registration callbacks through
    /// `scheduler`.
    pub fn with_scheduler(config: GraphConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        debug!(graph = %config.name, "creating graph");
        Self {
            inner: Arc::new(GraphInner {
                id: GraphId::new(),
                config,
                arena: RwLock::new(Arena::new()),
                registrations: DashMap::new(),
                scheduler,
                epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Get the graph's unique ID.
    pub fn id(&self) -> GraphId {
        self.inner.id
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    /// Run queued registration callbacks on this thread.
    ///
    /// Only does anything when the graph uses a queueing scheduler. Returns
    /// the number of callbacks run.
    pub fn flush(&self) -> usize {
        self.inner.scheduler.run_pending()
    }

    /// Current node, edge and registration counts.
    pub fn stats(&self) -> GraphStats {
        let arena = self.inner.arena.read();
        let edges = arena
            .cells()
            .map(|cell| cell.state.lock().incoming.len())
            .sum();
        GraphStats {
            nodes: arena.len(),
            edges,
            registrations: self.inner.registrations.len(),
        }
    }

    /// Debug name of a live node.
    pub fn node_name(&self, id: NodeId) -> Option<String> {
        self.cell(id.key()).map(|cell| cell.name().to_string())
    }

    /// Nodes that `id` read during its last computation.
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbours(id, |state| &state.incoming, Edge::source)
    }

    /// Nodes that read `id` during their last computation.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbours(id, |state| &state.outgoing, Edge::target)
    }

    fn neighbours(
        &self,
        id: NodeId,
        list: impl Fn(&NodeState) -> &EdgeList,
        endpoint: impl Fn(&Edge) -> NodeKey,
    ) -> Vec<NodeId> {
        let Some(cell) = self.cell(id.key()) else {
            return Vec::new();
        };
        let state = cell.state.lock();
        list(&state)
            .iter()
            .map(|edge| NodeId::new(self.id(), endpoint(edge)))
            .collect()
    }

    /// Remove a node now, regardless of outstanding handles.
    ///
    /// Remaining handles fail with [`crate::GraphError::NodeReleased`].
    /// Returns false if the node was already gone.
    pub fn remove(&self, id: NodeId) -> bool {
        id.graph() == self.id() && self.release(id.key())
    }

    // ------------------------------------------------------------------------
    // Crate-internal plumbing
    // ------------------------------------------------------------------------

    /// Current change epoch.
    pub(crate) fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Start a new epoch. Called after the flags for a change are set, so a
    /// reader that sees the new epoch also sees the flags.
    pub(crate) fn advance_epoch(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn downgrade(&self) -> Weak<GraphInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<GraphInner>) -> Self {
        Self { inner }
    }

    /// Allocate a node and return its cell.
    pub(crate) fn insert(
        &self,
        name: &str,
        kind: NodeKind,
        channel: Arc<dyn ChangeEmitter>,
    ) -> Arc<NodeCell> {
        let mut arena = self.inner.arena.write();
        let key = arena.reserve();
        let cell = Arc::new(NodeCell::new(self.id(), key, name, kind, channel));
        arena.fill(key, Arc::clone(&cell));
        trace!(node = name, index = key.index(), "inserted node");
        cell
    }

    /// Resolve a key to its cell, if the node still exists.
    pub(crate) fn cell(&self, key: NodeKey) -> Option<Arc<NodeCell>> {
        self.inner.arena.read().get(key).cloned()
    }

    /// Tear a node out of the graph.
    ///
    /// Edges are removed from the neighbours explicitly; dependents are
    /// forced to rerun since one of their inputs disappeared. Streams on the
    /// node end.
    pub(crate) fn release(&self, key: NodeKey) -> bool {
        // Take the cell out first and drop the arena lock: dropping the cell
        // may drop rule closures that release further nodes.
        let Some(cell) = self.inner.arena.write().remove(key) else {
            return false;
        };

        cell.channel.close();

        let (incoming, outgoing, registrations) = {
            let mut state = cell.state.lock();
            (
                std::mem::take(&mut state.incoming),
                std::mem::take(&mut state.outgoing),
                std::mem::take(&mut state.registrations),
            )
        };

        for edge in &incoming {
            if let Some(from) = self.cell(edge.source()) {
                edge::remove_edge(&mut from.state.lock().outgoing, edge);
            }
        }

        for edge in &outgoing {
            if let Some(to) = self.cell(edge.target()) {
                let mut state = to.state.lock();
                edge::remove_edge(&mut state.incoming, edge);
                if let NodeKind::Computed { rerun, .. } = &mut state.kind {
                    *rerun = true;
                }
                drop(state);
                to.mark_dirty();
            }
        }

        self.advance_epoch();

        for id in registrations {
            if let Some(registration) = self.registration(id) {
                registration.forget(key);
            }
        }

        debug!(node = cell.name(), "released node");
        true
    }

    /// Record that `to` read `from`. Reading the same node twice in one
    /// computation keeps a single edge.
    pub(crate) fn attach(&self, from: &NodeCell, to: &NodeCell) {
        let (mut from_state, mut to_state) = lock_pair(from, to);
        if edge::has_edge_from(&to_state.incoming, from.key()) {
            return;
        }
        let edge = Edge::new(from.key(), to.key());
        from_state.outgoing.push(Arc::clone(&edge));
        to_state.incoming.push(edge);
        trace!(from = from.name(), to = to.name(), "attached edge");
    }

    /// Remove `edge` from both of its endpoints. `to` is the edge's reader.
    pub(crate) fn detach(&self, edge: &Arc<Edge>, to: &NodeCell) {
        match self.cell(edge.source()).filter(|from| from.key() != to.key()) {
            Some(from) => {
                let (mut from_state, mut to_state) = lock_pair(&from, to);
                edge::remove_edge(&mut from_state.outgoing, edge);
                edge::remove_edge(&mut to_state.incoming, edge);
            }
            None => edge::remove_edge(&mut to.state.lock().incoming, edge),
        }
        trace!(to = to.name(), "detached edge");
    }

    pub(crate) fn registration(&self, id: RegistrationId) -> Option<Arc<RegistrationInner>> {
        self.inner
            .registrations
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn add_registration(&self, registration: Arc<RegistrationInner>) {
        self.inner
            .registrations
            .insert(registration.id(), registration);
    }

    pub(crate) fn remove_registration(&self, id: RegistrationId) {
        self.inner.registrations.remove(&id);
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Lock two distinct nodes, lower arena index first.
///
/// The guards come back in argument order.
pub(crate) fn lock_pair<'a>(
    a: &'a NodeCell,
    b: &'a NodeCell,
) -> (MutexGuard<'a, NodeState>, MutexGuard<'a, NodeState>) {
    debug_assert_ne!(a.key(), b.key(), "lock_pair called with one node");
    if a.key() < b.key() {
        let first = a.state.lock();
        let second = b.state.lock();
        (first, second)
    } else {
        let second = b.state.lock();
        let first = a.state.lock();
        (first, second)
    }
}
