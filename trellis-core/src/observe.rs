//! Access Hooks
//!
//! UI frameworks that run their own observation protocol can wrap a node's
//! accesses with these hooks. They are a pass-through: the graph calls them
//! and otherwise ignores them.

use crate::graph::NodeId;

/// Callbacks announcing reads and writes of a node.
///
/// All methods default to doing nothing. Hooks run on the reading or
/// writing thread with no graph locks held.
pub trait AccessHooks: Send + Sync {
    /// The node's value is about to be returned from a read.
    fn will_access(&self, _node: NodeId) {}

    /// A write to the node is about to be applied.
    fn will_change(&self, _node: NodeId) {}

    /// A write to the node has been applied and propagated.
    fn did_change(&self, _node: NodeId) {}
}
