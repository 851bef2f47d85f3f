//! Reactive Runtime
//!
//! The runtime is the algorithm that moves values through the graph. It is
//! written as methods on [`Graph`]; the typed handles call into it.
//!
//! # How It Works
//!
//! 1. Reading a node while a frame is active attributes the read to that
//!    frame: a computed node gains an edge from the node it read, a
//!    registration starts watching it.
//!
//! 2. Writing a stored node flags each outgoing edge as pending and marks
//!    each direct dependent potentially dirty. Nothing further downstream is
//!    touched. The node's change channel fires, then every registration
//!    watching the node or anything downstream of it is invalidated.
//!
//! 3. Reading a computed node first checks the node itself: its own flag,
//!    a pending incoming edge, and whether it was verified in the current
//!    epoch. Every change that flags a node starts a new epoch. If the node
//!    is not verified, dependencies are brought up to date bottom-up, and the
//!    rule reruns only if an incoming edge turned out to be pending. The
//!    nodes visited are stamped with the epoch, so the next clean read stops
//!    right there.
//!
//! 4. A rerun throws away the node's incoming edges and rebuilds them from
//!    the reads the rule makes. Dependents of a node that recomputed (other
//!    than the first time) get their edges flagged in turn.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::GraphError;
use crate::graph::{ErasedValue, Graph, NodeCell, NodeId, NodeKey, NodeKind};

use super::context::{EvalGuard, Frame, TrackingContext};

/// Owner of a node. Releases the node when the last handle clone drops.
pub(crate) struct NodeHandle {
    pub(crate) graph: Graph,
    pub(crate) id: NodeId,
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.graph.release(self.id.key());
    }
}

/// Marks a node for rerun if its rule unwinds.
struct RerunOnUnwind<'a> {
    cell: &'a NodeCell,
    armed: bool,
}

impl Drop for RerunOnUnwind<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let NodeKind::Computed { rerun, .. } = &mut self.cell.state.lock().kind {
            *rerun = true;
        }
        self.cell.mark_dirty();
    }
}

impl Graph {
    /// Resolve a handle's node.
    pub(crate) fn resolve(&self, id: NodeId) -> Result<Arc<NodeCell>, GraphError> {
        self.cell(id.key())
            .ok_or(GraphError::NodeReleased { node: id })
    }

    /// Read a node's value as `T`, bringing it up to date first.
    pub(crate) fn read_value<T>(&self, id: NodeId) -> Result<T, GraphError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let cell = self.resolve(id)?;
        self.ensure_fresh(&cell)?;
        self.record_read(&cell);

        if let Some(hooks) = cell.hooks() {
            hooks.will_access(id);
        }

        let value = cell
            .state
            .lock()
            .kind
            .current()
            .cloned()
            .ok_or_else(|| GraphError::NoValue {
                node: cell.name().to_string(),
            })?;

        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| GraphError::TypeMismatch {
                node: cell.name().to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Attribute a read of `cell` to the innermost frame.
    pub(crate) fn record_read(&self, cell: &Arc<NodeCell>) {
        match TrackingContext::current() {
            None | Some(Frame::Untracked) => {}
            Some(Frame::Node { graph, key }) => {
                if graph != self.id() {
                    warn!(node = cell.name(), "read from another graph is not tracked");
                    return;
                }
                // A node reading itself is a cycle and was reported by
                // `ensure_fresh`; there is no edge to record.
                if key == cell.key() {
                    return;
                }
                if let Some(reader) = self.cell(key) {
                    self.attach(cell, &reader);
                }
            }
            Some(Frame::Registration { graph, id }) => {
                if graph != self.id() {
                    warn!(node = cell.name(), "read from another graph is not tracked");
                    return;
                }
                if let Some(registration) = self.registration(id) {
                    cell.state.lock().registrations.insert(id);
                    registration.watch(cell.key());
                }
            }
        }
    }

    /// Replace a stored node's value in place. Does not notify anyone.
    pub(crate) fn replace_stored(&self, cell: &NodeCell, new_value: ErasedValue) {
        match &mut cell.state.lock().kind {
            NodeKind::Stored { value } => *value = new_value,
            NodeKind::Computed { .. } => {
                warn!(node = cell.name(), "ignoring direct write to a computed node");
            }
        }
    }

    /// Announce that a stored node changed.
    ///
    /// Direct dependents are flagged synchronously; deeper nodes find out when
    /// they are next read.
    pub(crate) fn propagate_change(&self, cell: &NodeCell, value: &ErasedValue) {
        self.flag_dependents(cell);
        cell.channel.emit(value);
        self.notify_registrations(cell);
    }

    /// Mark every outgoing edge pending and every direct dependent dirty,
    /// then start a new epoch.
    fn flag_dependents(&self, cell: &NodeCell) {
        let outgoing = cell.state.lock().outgoing.clone();
        if outgoing.is_empty() {
            return;
        }
        for edge in &outgoing {
            edge.mark_pending();
            if let Some(dependent) = self.cell(edge.target()) {
                dependent.mark_dirty();
            }
        }
        self.advance_epoch();
    }

    /// Invalidate registrations on `cell` and on every node downstream of it.
    ///
    /// This walk only notifies. It marks nothing dirty and recomputes
    /// nothing; registrations re-read what they need when they run.
    fn notify_registrations(&self, cell: &NodeCell) {
        let trigger = cell.id();
        let mut visited = HashSet::new();
        let mut pending = vec![cell.key()];

        while let Some(key) = pending.pop() {
            if !visited.insert(key) {
                continue;
            }
            let Some(node) = self.cell(key) else {
                continue;
            };

            let (registrations, next): (Vec<_>, Vec<_>) = {
                let state = node.state.lock();
                (
                    state.registrations.iter().copied().collect(),
                    state.outgoing.iter().map(|edge| edge.target()).collect(),
                )
            };

            for id in registrations {
                if let Some(registration) = self.registration(id) {
                    registration.invalidate(self, trigger);
                }
            }
            pending.extend(next);
        }
    }

    /// Whether `cell` itself shows a reason to rerun: its flag, a missing
    /// cache, a forced rerun, or a pending incoming edge.
    fn is_locally_dirty(cell: &NodeCell) -> bool {
        if cell.is_dirty() {
            return true;
        }
        let state = cell.state.lock();
        match &state.kind {
            NodeKind::Stored { .. } => false,
            NodeKind::Computed { cache, rerun, .. } => {
                cache.is_none() || *rerun || state.incoming.iter().any(|edge| edge.is_pending())
            }
        }
    }

    /// Up to date as of `epoch`, with nothing flagged since.
    fn is_verified(cell: &NodeCell, epoch: u64) -> bool {
        cell.verified_at() == epoch && !Self::is_locally_dirty(cell)
    }

    /// Whether a read of `cell` has to look at its dependencies.
    ///
    /// The walk stops at nodes verified in the current epoch.
    pub(crate) fn is_potentially_dirty(&self, cell: &Arc<NodeCell>) -> bool {
        let epoch = self.epoch();
        let mut visited: HashSet<NodeKey> = HashSet::new();
        let mut pending = vec![Arc::clone(cell)];

        while let Some(node) = pending.pop() {
            if !visited.insert(node.key()) {
                continue;
            }
            if Self::is_locally_dirty(&node) {
                return true;
            }
            if node.verified_at() == epoch {
                continue;
            }

            let dependencies: Vec<NodeKey> = node
                .state
                .lock()
                .incoming
                .iter()
                .map(|edge| edge.source())
                .collect();
            pending.extend(dependencies.into_iter().filter_map(|key| self.cell(key)));
        }

        false
    }

    /// Bring a computed node up to date. Stored nodes are always current.
    pub(crate) fn ensure_fresh(&self, cell: &Arc<NodeCell>) -> Result<(), GraphError> {
        let epoch = self.epoch();
        self.refresh(cell, epoch)
    }

    /// Verify `cell` against the snapshot `epoch`, recomputing what changed.
    ///
    /// Every node reached is stamped with `epoch`, so a diamond visits its
    /// shared dependencies once and a later clean read stops at the first
    /// stamped node.
    fn refresh(&self, cell: &Arc<NodeCell>, epoch: u64) -> Result<(), GraphError> {
        if !cell.state.lock().kind.is_computed() {
            return Ok(());
        }

        // Fast path: verified in this epoch and nothing flagged since.
        if Self::is_verified(cell, epoch) {
            return Ok(());
        }

        let _eval = EvalGuard::enter(cell.id(), cell.name(), self.config().max_depth)?;
        let _exclusive = cell.eval.lock();

        // Another thread may have verified the node while we waited for the
        // evaluation lock.
        if Self::is_verified(cell, epoch) {
            return Ok(());
        }

        // Dependencies first, so the pending check below sees their final
        // state.
        let dependencies: Vec<NodeKey> = cell
            .state
            .lock()
            .incoming
            .iter()
            .map(|edge| edge.source())
            .collect();
        for key in dependencies {
            let Some(dependency) = self.cell(key) else {
                continue;
            };
            // A node running its rule further up this stack has already
            // dropped its edges; the edge seen here predates that run. A rule
            // that really reads it again fails in `EvalGuard::enter`.
            if EvalGuard::is_evaluating(dependency.id()) {
                continue;
            }
            self.refresh(&dependency, epoch)?;
        }

        let needs_rerun = {
            let state = cell.state.lock();
            match &state.kind {
                NodeKind::Computed { cache, rerun, .. } => {
                    cache.is_none()
                        || *rerun
                        || state.incoming.iter().any(|edge| edge.is_pending())
                }
                NodeKind::Stored { .. } => false,
            }
        };

        if needs_rerun {
            self.recompute(cell);
        }

        // Pending edges stay authoritative, so clearing the flag here cannot
        // hide a write that raced with this evaluation.
        cell.take_dirty();
        cell.mark_verified(epoch);
        Ok(())
    }

    /// Run a computed node's rule and store the result.
    fn recompute(&self, cell: &Arc<NodeCell>) {
        let (rule, had_value, old_edges) = {
            let state = cell.state.lock();
            match &state.kind {
                NodeKind::Computed { rule, cache, .. } => {
                    (Arc::clone(rule), cache.is_some(), state.incoming.clone())
                }
                NodeKind::Stored { .. } => return,
            }
        };

        for edge in &old_edges {
            self.detach(edge, cell);
        }

        let mut guard = RerunOnUnwind {
            cell: cell.as_ref(),
            armed: true,
        };
        let value = {
            let _ctx = TrackingContext::enter(Frame::Node {
                graph: self.id(),
                key: cell.key(),
            });
            rule()
        };
        guard.armed = false;

        let count = {
            let mut state = cell.state.lock();
            if let NodeKind::Computed { cache, rerun, .. } = &mut state.kind {
                *cache = Some(Arc::clone(&value));
                *rerun = false;
            }
            state.recompute_count += 1;
            state.recompute_count
        };
        debug!(node = cell.name(), count, "recomputed");

        if had_value {
            self.flag_dependents(cell);
            cell.channel.emit(&value);
        }
    }
}
