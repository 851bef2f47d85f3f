//! Error types.

use thiserror::Error;

use crate::graph::NodeId;

/// Errors surfaced by graph reads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A node was reached again while it was still being evaluated.
    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected {
        /// Node names along the cycle, first and last are the same node.
        path: Vec<String>,
    },

    /// Evaluation nested deeper than the configured limit.
    #[error("evaluation depth {depth} exceeded at node `{node}`")]
    DepthExceeded { depth: usize, node: String },

    /// The node behind a handle no longer exists.
    #[error("node {node} has been released")]
    NodeReleased { node: NodeId },

    /// A computed node has no cached value after evaluation.
    #[error("node `{node}` has no value")]
    NoValue { node: String },

    /// A node held a value of a different type than its handle expects.
    #[error("node `{node}` does not hold a value of type {expected}")]
    TypeMismatch { node: String, expected: &'static str },
}

/// Errors raised by persistence backends.
///
/// These never cross [`crate::Stored::write`]; they are logged at that
/// boundary.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to encode value: {0}")]
    Encode(String),

    #[error("failed to decode value: {0}")]
    Decode(String),

    #[error("store error: {0}")]
    Store(String),
}

impl From<rmp_serde::encode::Error> for BackendError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BackendError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Errors raised while loading a [`crate::GraphConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
