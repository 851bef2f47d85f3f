//! Graph Edges
//!
//! An edge records that `to` read `from` while computing. The same `Arc<Edge>`
//! sits in `from.outgoing` and in `to.incoming`, so the pending flag is shared
//! by both endpoints without a second lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use super::arena::NodeKey;

/// Edge list stored on each node. Most nodes have few neighbours.
pub(crate) type EdgeList = SmallVec<[Arc<Edge>; 4]>;

/// A dependency link from a node to one of its readers.
#[derive(Debug)]
pub struct Edge {
    from: NodeKey,
    to: NodeKey,

    /// True when `from` changed after this edge was created and `to` has not
    /// re-read it since.
    pending: AtomicBool,
}

impl Edge {
    pub(crate) fn new(from: NodeKey, to: NodeKey) -> Arc<Self> {
        Arc::new(Self {
            from,
            to,
            pending: AtomicBool::new(false),
        })
    }

    /// The node that was read.
    pub fn source(&self) -> NodeKey {
        self.from
    }

    /// The node that did the reading.
    pub fn target(&self) -> NodeKey {
        self.to
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn mark_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }
}

/// Remove `edge` from `list` by identity.
pub(crate) fn remove_edge(list: &mut EdgeList, edge: &Arc<Edge>) {
    list.retain(|e| !Arc::ptr_eq(e, edge));
}

/// Whether `list` already has an edge coming from `from`.
pub(crate) fn has_edge_from(list: &EdgeList, from: NodeKey) -> bool {
    list.iter().any(|e| e.from == from)
}
