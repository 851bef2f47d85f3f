//! Graph Nodes
//!
//! This module defines the node cells that live in the arena.
//!
//! A node is either a stored source or a computed derivation. The set of
//! kinds is closed, so it is a plain enum rather than a trait object; the
//! typed handles in [`crate::reactive`] are the only place values get their
//! concrete type back.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};

use super::arena::NodeKey;
use super::edge::EdgeList;
use crate::observe::AccessHooks;
use crate::reactive::channel::ChangeEmitter;
use crate::reactive::RegistrationId;

/// A value stored in the graph with its type erased.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// A computed node's rule with its output type erased.
pub(crate) type Rule = Arc<dyn Fn() -> ErasedValue + Send + Sync>;

/// Unique identifier for a graph instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

impl GraphId {
    /// Generate a new unique graph ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a node.
///
/// Two handles are the same node iff their IDs are equal; values never take
/// part in equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    graph: GraphId,
    key: NodeKey,
}

impl NodeId {
    pub(crate) fn new(graph: GraphId, key: NodeKey) -> Self {
        Self { graph, key }
    }

    /// The graph this node belongs to.
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    /// The arena key of this node.
    pub fn key(&self) -> NodeKey {
        self.key
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.key.index(), self.key.generation())
    }
}

/// Variant-specific node state.
pub(crate) enum NodeKind {
    /// A source node. Written from outside the graph, never recomputed.
    Stored { value: ErasedValue },

    /// A derived node with a lazily filled cache.
    Computed {
        cache: Option<ErasedValue>,
        rule: Rule,
        /// Set when a rule invocation unwound; forces the next check to rerun.
        rerun: bool,
    },
}

impl NodeKind {
    pub(crate) fn stored(value: ErasedValue) -> Self {
        Self::Stored { value }
    }

    pub(crate) fn computed(rule: Rule) -> Self {
        Self::Computed {
            cache: None,
            rule,
            rerun: false,
        }
    }

    pub(crate) fn is_computed(&self) -> bool {
        matches!(self, Self::Computed { .. })
    }

    /// The value a read would return, if there is one yet.
    pub(crate) fn current(&self) -> Option<&ErasedValue> {
        match self {
            Self::Stored { value } => Some(value),
            Self::Computed { cache, .. } => cache.as_ref(),
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stored { .. } => f.write_str("Stored"),
            Self::Computed { cache, rerun, .. } => f
                .debug_struct("Computed")
                .field("has_value", &cache.is_some())
                .field("rerun", rerun)
                .finish(),
        }
    }
}

/// Mutable state of a node, guarded by the node's lock.
#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) kind: NodeKind,

    /// Edges to nodes that read this node while computing (dependents).
    pub(crate) outgoing: EdgeList,

    /// Edges from nodes this node read during its last computation.
    /// Always empty for stored nodes.
    pub(crate) incoming: EdgeList,

    /// Registrations watching this node.
    pub(crate) registrations: IndexSet<RegistrationId>,

    /// Number of rule invocations so far.
    pub(crate) recompute_count: usize,
}

/// A node in the arena.
pub(crate) struct NodeCell {
    id: NodeId,
    name: Arc<str>,

    /// Set when a dependency may have changed since the last computation.
    /// Kept outside the state lock so writers can flag dependents without
    /// taking a second node lock.
    dirty: AtomicBool,

    /// Graph epoch at which this node was last found up to date.
    verified: AtomicU64,

    pub(crate) state: Mutex<NodeState>,

    /// Held for the duration of one evaluation so concurrent readers of the
    /// same node compute it once.
    pub(crate) eval: Mutex<()>,

    pub(crate) channel: Arc<dyn ChangeEmitter>,
    hooks: RwLock<Option<Arc<dyn AccessHooks>>>,
}

impl NodeCell {
    pub(crate) fn new(
        graph: GraphId,
        key: NodeKey,
        name: &str,
        kind: NodeKind,
        channel: Arc<dyn ChangeEmitter>,
    ) -> Self {
        Self {
            id: NodeId::new(graph, key),
            name: Arc::from(name),
            dirty: AtomicBool::new(false),
            verified: AtomicU64::new(0),
            state: Mutex::new(NodeState {
                kind,
                outgoing: EdgeList::new(),
                incoming: EdgeList::new(),
                registrations: IndexSet::new(),
                recompute_count: 0,
            }),
            eval: Mutex::new(()),
            channel,
            hooks: RwLock::new(None),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn key(&self) -> NodeKey {
        self.id.key
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning whether it was set.
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn verified_at(&self) -> u64 {
        self.verified.load(Ordering::Acquire)
    }

    pub(crate) fn mark_verified(&self, epoch: u64) {
        self.verified.store(epoch, Ordering::Release);
    }

    pub(crate) fn hooks(&self) -> Option<Arc<dyn AccessHooks>> {
        self.hooks.read().clone()
    }

    pub(crate) fn set_hooks(&self, hooks: Option<Arc<dyn AccessHooks>>) {
        *self.hooks.write() = hooks;
    }
}

impl fmt::Debug for NodeCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
