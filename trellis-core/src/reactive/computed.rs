//! Computed Nodes
//!
//! A computed node is a cached derived value that re-evaluates only when
//! something it read has changed.
//!
//! # How Computed Nodes Work
//!
//! 1. Creating a computed node does not run its rule. The first read does,
//!    and every node the rule reads becomes a dependency.
//!
//! 2. Reading again with nothing upstream changed returns the cache.
//!
//! 3. When a dependency changes, the edge from it is flagged. The node
//!    learns about it on its next read.
//!
//! 4. On that read, dependencies are brought up to date first. The rule
//!    reruns only if one of them actually produced a new value.
//!
//! # Why This Matters
//!
//! This lazy approach avoids unnecessary recomputation:
//!
//! - A stored node changes
//! - 10 computed nodes depend on it
//! - Only the computed nodes actually read will recompute
//! - The ones never read stay flagged (no wasted work)
//!
//! # Thread Safety
//!
//! Computed nodes can be read from any thread. At most one thread runs a
//! given node's rule at a time; other readers wait and then use its result.
//! No graph lock is held while the rule runs.

use std::fmt;
use std::sync::Arc;

use crate::error::GraphError;
use crate::graph::{ErasedValue, Graph, NodeId, NodeKind};
use crate::observe::AccessHooks;

use super::channel::{ChangeChannel, ChangeEmitter, HandlerId};
use super::context::untracked;
use super::runtime::NodeHandle;
use super::stream::ChangeStream;

/// A cached value derived from other nodes.
///
/// Cloning shares the node. The node is released when the last clone drops.
pub struct Computed<T> {
    node: Arc<NodeHandle>,
    channel: Arc<ChangeChannel<T>>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Get the node's identity.
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// Get the graph this node lives in.
    pub fn graph(&self) -> &Graph {
        &self.node.graph
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// This is the main entry point for reading a computed node.
    ///
    /// # Panics
    ///
    /// Panics if evaluation finds a cycle or exceeds the configured depth,
    /// or if the node was removed. Use [`Computed::try_read`] to get these
    /// as errors.
    pub fn read(&self) -> T {
        self.try_read().unwrap_or_else(|err| panic!("{err}"))
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// Only errors detected at this read are returned. A cycle found inside
    /// a nested rule still panics out of that rule.
    pub fn try_read(&self) -> Result<T, GraphError> {
        self.node.graph.read_value(self.node.id)
    }

    /// Get the current value without recording a dependency.
    pub fn peek(&self) -> T {
        untracked(|| self.read())
    }

    /// How many times the rule has run.
    pub fn recompute_count(&self) -> usize {
        self.node
            .graph
            .resolve(self.node.id)
            .map(|cell| cell.state.lock().recompute_count)
            .unwrap_or(0)
    }

    /// Check if the node has a cached value.
    pub fn has_value(&self) -> bool {
        self.node
            .graph
            .resolve(self.node.id)
            .map(|cell| cell.state.lock().kind.current().is_some())
            .unwrap_or(false)
    }

    /// Whether the next read has to look upstream before answering.
    pub fn is_potentially_dirty(&self) -> bool {
        match self.node.graph.resolve(self.node.id) {
            Ok(cell) => self.node.graph.is_potentially_dirty(&cell),
            Err(_) => false,
        }
    }

    /// Nodes read during the last computation.
    pub fn dependencies(&self) -> Vec<NodeId> {
        self.node.graph.dependencies(self.node.id)
    }

    /// Nodes that read this node during their last computation.
    pub fn dependents(&self) -> Vec<NodeId> {
        self.node.graph.dependents(self.node.id)
    }

    /// Install a handler called each time a recomputation replaces an
    /// earlier value. The first computation is not announced.
    pub fn on_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.channel.subscribe(handler)
    }

    /// Remove a handler installed with [`Computed::on_change`].
    pub fn off_change(&self, id: HandlerId) -> bool {
        self.channel.unsubscribe(id)
    }

    /// Stream of recomputed values from now on.
    ///
    /// Computed nodes are lazy: a value only shows up here after something
    /// reads the node.
    pub fn changes(&self) -> ChangeStream<T> {
        ChangeStream::new(self.channel.receiver())
    }

    /// End all change streams on this node. Handlers keep working.
    pub fn close_changes(&self) {
        self.channel.close();
    }

    /// Wrap reads of this node with `hooks`.
    pub fn set_hooks(&self, hooks: Arc<dyn AccessHooks>) {
        if let Ok(cell) = self.node.graph.resolve(self.node.id) {
            cell.set_hooks(Some(hooks));
        }
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<T> fmt::Debug for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.node.id)
            .field("has_value", &self.has_value())
            .field("recompute_count", &self.recompute_count())
            .field("dependent_count", &self.dependents().len())
            .finish()
    }
}

impl Graph {
    /// Create a computed node from a rule.
    ///
    /// The rule is not run immediately. It runs on first read.
    pub fn computed<T, F>(&self, name: &str, rule: F) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let channel = Arc::new(ChangeChannel::<T>::new(self.config().stream_capacity));
        let erased = Arc::new(move || Arc::new(rule()) as ErasedValue);
        let cell = self.insert(name, NodeKind::computed(erased), channel.clone());

        Computed {
            node: Arc::new(NodeHandle {
                graph: self.clone(),
                id: cell.id(),
            }),
            channel,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::testing::RecordingHooks;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn computes_on_first_access() {
        let graph = Graph::new();
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let node = graph.computed("answer", move || {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            42
        });

        // Not computed yet
        assert!(!node.has_value());
        assert!(node.is_potentially_dirty());
        assert_eq!(call_count.load(Ordering::SeqCst), 0);

        // First access triggers computation
        assert_eq!(node.read(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert!(node.has_value());
        assert!(!node.is_potentially_dirty());
    }

    #[test]
    fn caches_value_when_clean() {
        let graph = Graph::new();
        let node = graph.computed("answer", || 42);

        assert_eq!(node.read(), 42);
        assert_eq!(node.read(), 42);
        assert_eq!(node.read(), 42);
        assert_eq!(node.recompute_count(), 1);
    }

    #[test]
    fn recomputes_after_dependency_write() {
        let graph = Graph::new();
        let source = graph.stored("source", 1);
        let reader = source.clone();
        let doubled = graph.computed("doubled", move || reader.read() * 2);

        assert_eq!(doubled.read(), 2);
        assert_eq!(doubled.dependencies(), vec![source.id()]);
        assert_eq!(source.dependents(), vec![doubled.id()]);

        source.write(5);
        assert!(doubled.is_potentially_dirty());
        assert_eq!(doubled.read(), 10);
        assert_eq!(doubled.recompute_count(), 2);
    }

    #[test]
    fn peek_records_no_dependency() {
        let graph = Graph::new();
        let source = graph.stored("source", 1);
        let reader = source.clone();
        let node = graph.computed("peeking", move || reader.peek() + 1);

        assert_eq!(node.read(), 2);
        assert!(node.dependencies().is_empty());

        source.write(10);
        assert_eq!(node.read(), 2);
        assert_eq!(node.recompute_count(), 1);
    }

    #[test]
    fn first_computation_is_not_announced() {
        let graph = Graph::new();
        let source = graph.stored("source", 1);
        let reader = source.clone();
        let node = graph.computed("plus_one", move || reader.read() + 1);

        let seen = Arc::new(AtomicI32::new(0));
        let seen_clone = seen.clone();
        node.on_change(move |v| {
            seen_clone.store(*v, Ordering::SeqCst);
        });

        node.read();
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        source.write(4);
        node.read();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn clone_shares_state() {
        let graph = Graph::new();
        let first = graph.computed("answer", || 42);
        assert_eq!(first.read(), 42);

        let second = first.clone();
        assert_eq!(first.id(), second.id());
        assert!(second.has_value());
        assert_eq!(second.read(), 42);
        assert_eq!(second.recompute_count(), 1);
    }

    #[test]
    fn removed_node_reports_released() {
        let graph = Graph::new();
        let node = graph.computed("answer", || 42);
        node.read();

        assert!(graph.remove(node.id()));
        assert!(!node.has_value());
        assert_eq!(node.recompute_count(), 0);
        assert!(matches!(
            node.try_read(),
            Err(GraphError::NodeReleased { .. })
        ));
    }

    #[test]
    fn rule_panic_leaves_node_rerunnable() {
        let graph = Graph::new();
        let source = graph.stored("source", 0);
        let reader = source.clone();
        let node = graph.computed("fragile", move || {
            let value = reader.read();
            assert!(value != 1, "boom");
            value
        });

        assert_eq!(node.read(), 0);
        source.write(1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| node.read()));
        assert!(result.is_err());
        assert!(node.is_potentially_dirty());

        source.write(2);
        assert_eq!(node.read(), 2);
    }

    #[test]
    fn hooks_see_reads_of_computed_node() {
        let graph = Graph::new();
        let source = graph.stored("source", 1);
        let reader = source.clone();
        let node = graph.computed("double", move || reader.read() * 2);
        node.read();

        let hooks = Arc::new(RecordingHooks::default());
        node.set_hooks(hooks.clone());
        source.write(2);
        assert_eq!(node.read(), 4);
        assert_eq!(node.peek(), 4);

        assert_eq!(
            *hooks.calls.lock(),
            vec![("will_access", node.id()), ("will_access", node.id())]
        );
    }
}
