//! Tracking Context
//!
//! The tracking context records who is currently reading. When a node is read
//! while a frame is active, the read is attributed to that frame: a computed
//! node gets a new dependency edge, a registration starts watching the node.
//!
//! # Implementation
//!
//! Each thread keeps its own stack of frames. Rules and registration bodies
//! are synchronous, so a thread-local stack is exactly as wide as the logical
//! call stack, and concurrent computations on other threads never see each
//! other's frames.
//!
//! A second stack holds the nodes currently being evaluated. It exists for
//! cycle detection: reaching a node that is already on it means the graph
//! is not acyclic.

use std::cell::RefCell;

use crate::error::GraphError;
use crate::graph::{GraphId, NodeId, NodeKey};

use super::RegistrationId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static EVAL_STACK: RefCell<Vec<EvalEntry>> = const { RefCell::new(Vec::new()) };
}

/// The reader a read gets attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A computed node is running its rule.
    Node { graph: GraphId, key: NodeKey },

    /// A tracking registration is running its body.
    Registration { graph: GraphId, id: RegistrationId },

    /// Reads inside this frame record nothing.
    Untracked,
}

#[derive(Debug)]
struct EvalEntry {
    id: NodeId,
    name: String,
}

/// Guard that pops its frame when dropped.
///
/// Dropping during unwind keeps the stack balanced when a rule panics.
pub struct TrackingContext {
    frame: Frame,
}

impl TrackingContext {
    /// Push a frame. Reads are attributed to it until the guard drops.
    pub fn enter(frame: Frame) -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(frame));
        Self { frame }
    }

    /// Check if any frame is active.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// The innermost frame, if any.
    pub fn current() -> Option<Frame> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().copied())
    }
}

impl Drop for TrackingContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(
                popped,
                Some(self.frame),
                "TrackingContext mismatch: expected {:?}, got {:?}",
                self.frame,
                popped
            );
        });
    }
}

/// Run `f` without attributing its reads to the current frame.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = TrackingContext::enter(Frame::Untracked);
    f()
}

/// Marks a node as under evaluation on this thread.
pub(crate) struct EvalGuard {
    id: NodeId,
}

impl EvalGuard {
    /// Push `id`, failing if it is already being evaluated on this thread or
    /// the stack is already `max_depth` deep.
    pub(crate) fn enter(id: NodeId, name: &str, max_depth: usize) -> Result<Self, GraphError> {
        EVAL_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();

            if let Some(start) = stack.iter().position(|entry| entry.id == id) {
                let mut path: Vec<String> =
                    stack[start..].iter().map(|entry| entry.name.clone()).collect();
                path.push(name.to_string());
                return Err(GraphError::CycleDetected { path });
            }

            if stack.len() >= max_depth {
                return Err(GraphError::DepthExceeded {
                    depth: max_depth,
                    node: name.to_string(),
                });
            }

            stack.push(EvalEntry {
                id,
                name: name.to_string(),
            });
            Ok(Self { id })
        })
    }

    /// Whether `id` is running its rule further up this thread's stack.
    pub(crate) fn is_evaluating(id: NodeId) -> bool {
        EVAL_STACK.with(|stack| stack.borrow().iter().any(|entry| entry.id == id))
    }
}

impl Drop for EvalGuard {
    fn drop(&mut self) {
        EVAL_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped.map(|entry| entry.id), Some(self.id));
        });
    }
}
