//! Trellis Core
//!
//! This crate provides the core runtime for the Trellis incremental
//! computation engine. It implements:
//!
//! - Stored and computed nodes in a dependency graph
//! - Automatic dependency tracking and lazy recomputation
//! - Change notification through handlers, async streams, and coalesced
//!   tracking registrations
//! - Persistence and access-hook seams for code generated on top of it
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Node storage, edges, and the [`Graph`] handle
//! - `reactive`: Typed node handles, dependency tracking, and the runtime
//! - `persist`: Backends that seed and save stored nodes
//! - `observe`: Access hooks for external observation protocols
//! - `config`: Graph configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::Graph;
//!
//! let graph = Graph::new();
//!
//! // Create a stored node
//! let count = graph.stored("count", 0);
//!
//! // Create a derived value
//! let c = count.clone();
//! let doubled = graph.computed("doubled", move || c.read() * 2);
//!
//! // Observe it
//! let d = doubled.clone();
//! let _registration = graph.track(move |_| {
//!     println!("Doubled: {}", d.read());
//! });
//!
//! // Update the stored node
//! count.write(5);
//! graph.flush();
//! // Registration runs again, prints: "Doubled: 10"
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod observe;
pub mod persist;
pub mod reactive;

pub use config::GraphConfig;
pub use error::{BackendError, ConfigError, GraphError};
pub use graph::{Graph, GraphId, GraphStats, NodeId, NodeKey};
pub use observe::AccessHooks;
pub use persist::{Backend, Codec, KeyValueStore, KeyedBackend, MemoryStore};
pub use reactive::{
    untracked, ChangeStream, Computed, HandlerId, ObservedStream, Registration, Stored,
    StoredBuilder, TrackingRun,
};
