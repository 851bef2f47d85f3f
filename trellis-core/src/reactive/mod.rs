//! Reactive Primitives
//!
//! This module implements the reactive side of the graph: stored nodes,
//! computed nodes, and tracking registrations. Together they form the
//! foundation of Trellis's incremental recomputation.
//!
//! # Concepts
//!
//! ## Stored Nodes
//!
//! A [`Stored`] node is a container for mutable state. When it is read while
//! a computed node runs its rule, an edge records the dependency. When it is
//! written, its direct dependents are flagged.
//!
//! ## Computed Nodes
//!
//! A [`Computed`] node is a derived value that caches its result. It
//! re-evaluates only when something it read has changed, and only when it is
//! read.
//!
//! ## Registrations
//!
//! A [`Registration`] is an external observer. Its body reruns, through a
//! [`Scheduler`], once per batch of changes to the nodes it read. Async code
//! can use [`Graph::observe`](crate::Graph::observe) and
//! [`ChangeStream`] instead.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to detect
//! dependencies automatically. When a node is read, the innermost frame (a
//! computed node's rule or a registration body) is credited with the read.
//!
//! Push-based invalidation with pull-based recomputation is the approach
//! taken by SolidJS, Vue 3, and Leptos.

pub(crate) mod channel;
mod computed;
mod context;
pub(crate) mod runtime;
pub(crate) mod scheduler;
mod stored;
mod stream;
pub(crate) mod tracking;

pub use channel::{ChangeChannel, HandlerId};
pub use computed::Computed;
pub use context::{untracked, Frame, TrackingContext};
pub use scheduler::{Job, QueueScheduler, Scheduler, TokioScheduler};
pub use stored::{Stored, StoredBuilder};
pub use stream::{ChangeStream, ObservedStream};
pub use tracking::{Registration, RegistrationId, TrackingRun};
