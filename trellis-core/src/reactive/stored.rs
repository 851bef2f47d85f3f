//! Stored Nodes
//!
//! A stored node is a source of truth: it holds a value that only changes
//! when written from outside the graph.
//!
//! # How Stored Nodes Work
//!
//! 1. When read while a computed node is running its rule, the read adds an
//!    edge from this node to that computed node.
//!
//! 2. When written, the edges to direct dependents are flagged and the
//!    dependents are marked potentially dirty. Nodes further downstream are
//!    left alone until something reads them.
//!
//! 3. After propagating, the node's change channel fires once and watching
//!    registrations are invalidated.
//!
//! # Persistence
//!
//! A node built with a [`Backend`] is seeded from `load` and calls `save`
//! after each write. Backend failures are logged; the in-memory value is
//! always the one the graph sees.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::warn;

use crate::error::GraphError;
use crate::graph::{ErasedValue, Graph, NodeId, NodeKind};
use crate::observe::AccessHooks;
use crate::persist::Backend;

use super::channel::{ChangeChannel, ChangeEmitter, HandlerId};
use super::context::untracked;
use super::runtime::NodeHandle;
use super::stream::ChangeStream;

/// A mutable source node holding a value of type `T`.
///
/// Cloning shares the node. The node is released when the last clone drops.
///
/// # Example
///
/// ```rust,ignore
/// let count = graph.stored("count", 0);
///
/// // Read the value
/// let value = count.read();
///
/// // Update the value (flags dependents, notifies observers)
/// count.write(5);
/// ```
pub struct Stored<T> {
    node: Arc<NodeHandle>,
    channel: Arc<ChangeChannel<T>>,
    backend: Option<Arc<dyn Backend<T>>>,
}

impl<T> Stored<T>
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

    /// Get the current value, recording a dependency if a frame is active.
    ///
    /// # Panics
    ///
    /// Panics if the node was removed with [`Graph::remove`]. Use
    /// [`Stored::try_read`] to handle that case.
    pub fn read(&self) -> T {
        self.try_read().unwrap_or_else(|err| panic!("{err}"))
    }

    /// Get the current value, recording a dependency if a frame is active.
    pub fn try_read(&self) -> Result<T, GraphError> {
        self.node.graph.read_value(self.node.id)
    }

    /// Get the current value without recording a dependency.
    pub fn peek(&self) -> T {
        untracked(|| self.read())
    }

    /// Set a new value.
    ///
    /// Writes are always accepted. A write to a removed node is logged and
    /// dropped.
    pub fn write(&self, value: T) {
        let graph = &self.node.graph;
        let cell = match graph.resolve(self.node.id) {
            Ok(cell) => cell,
            Err(err) => {
                warn!(%err, "write ignored");
                return;
            }
        };

        let hooks = cell.hooks();
        if let Some(hooks) = &hooks {
            hooks.will_change(self.node.id);
        }

        let typed = Arc::new(value);
        let erased: ErasedValue = typed.clone();
        graph.replace_stored(&cell, Arc::clone(&erased));

        if let Some(backend) = &self.backend {
            if let Err(err) = backend.save(&typed) {
                warn!(node = cell.name(), %err, "failed to persist value");
            }
        }

        graph.propagate_change(&cell, &erased);

        if let Some(hooks) = &hooks {
            hooks.did_change(self.node.id);
        }
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.peek());
        self.write(next);
    }

    /// Install a handler called after every write.
    pub fn on_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.channel.subscribe(handler)
    }

    /// Remove a handler installed with [`Stored::on_change`].
    pub fn off_change(&self, id: HandlerId) -> bool {
        self.channel.unsubscribe(id)
    }

    /// Stream of values written from now on.
    pub fn changes(&self) -> ChangeStream<T> {
        ChangeStream::new(self.channel.receiver())
    }

    /// End all change streams on this node. Handlers keep working.
    pub fn close_changes(&self) {
        self.channel.close();
    }

    /// Nodes that read this node during their last computation.
    pub fn dependents(&self) -> Vec<NodeId> {
        self.node.graph.dependents(self.node.id)
    }

    /// Wrap reads and writes of this node with `hooks`.
    pub fn set_hooks(&self, hooks: Arc<dyn AccessHooks>) {
        if let Ok(cell) = self.node.graph.resolve(self.node.id) {
            cell.set_hooks(Some(hooks));
        }
    }
}

impl<T> Clone for Stored<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            channel: Arc::clone(&self.channel),
            backend: self.backend.clone(),
        }
    }
}

impl<T> fmt::Debug for Stored<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stored")
            .field("id", &self.node.id)
            .field("value", &self.try_peek())
            .field("dependent_count", &self.dependents().len())
            .finish()
    }
}

impl<T> Stored<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn try_peek(&self) -> Result<T, GraphError> {
        untracked(|| self.try_read())
    }
}

/// Builder for stored nodes with optional persistence and access hooks.
///
/// This is the construction surface generated accessors target.
pub struct StoredBuilder<T> {
    graph: Graph,
    name: String,
    backend: Option<Arc<dyn Backend<T>>>,
    hooks: Option<Arc<dyn AccessHooks>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StoredBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Persist the node through `backend`.
    pub fn backend<B>(mut self, backend: B) -> Self
    where
        B: Backend<T> + 'static,
    {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Wrap accesses with `hooks`.
    pub fn hooks(mut self, hooks: Arc<dyn AccessHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Create the node. With a backend, the persisted value wins over
    /// `default` when there is one.
    pub fn build(self, default: T) -> Stored<T> {
        let initial = match &self.backend {
            Some(backend) => match backend.load() {
                Ok(Some(value)) => value,
                Ok(None) => default,
                Err(err) => {
                    warn!(node = %self.name, %err, "failed to load persisted value");
                    default
                }
            },
            None => default,
        };

        let channel = Arc::new(ChangeChannel::<T>::new(
            self.graph.config().stream_capacity,
        ));
        let cell = self.graph.insert(
            &self.name,
            NodeKind::stored(Arc::new(initial)),
            channel.clone(),
        );
        cell.set_hooks(self.hooks);

        Stored {
            node: Arc::new(NodeHandle {
                graph: self.graph,
                id: cell.id(),
            }),
            channel,
            backend: self.backend,
        }
    }
}

impl Graph {
    /// Create a stored node with an initial value and a debug name.
    pub fn stored<T>(&self, name: &str, initial: T) -> Stored<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.build_stored(name).build(initial)
    }

    /// Start building a stored node.
    pub fn build_stored<T>(&self, name: &str) -> StoredBuilder<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        StoredBuilder {
            graph: self.clone(),
            name: name.to_string(),
            backend: None,
            hooks: None,
            _marker: PhantomData,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
