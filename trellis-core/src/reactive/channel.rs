//! Change Notification Channel
//!
//! Every node owns one channel. A change is delivered to push-style handlers
//! first, then to the broadcast sender that feeds pull-style streams.
//!
//! The graph core moves values around type-erased; [`ChangeEmitter`] is the
//! seam where the typed channel gets its value back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

use crate::graph::ErasedValue;

/// Identifier for a change handler installed with `on_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Type-erased view of a [`ChangeChannel`].
pub(crate) trait ChangeEmitter: Send + Sync {
    /// Deliver a changed value to handlers and streams.
    fn emit(&self, value: &ErasedValue);

    /// Drop the broadcast sender so open streams end.
    fn close(&self);
}

/// Per-node change channel for values of type `T`.
pub struct ChangeChannel<T> {
    handlers: RwLock<Vec<(HandlerId, Handler<T>)>>,
    sender: Mutex<Option<broadcast::Sender<T>>>,
}

impl<T> ChangeChannel<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a channel whose streams buffer up to `capacity` values.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Install a handler called with every new value.
    pub fn subscribe<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = HandlerId::new();
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not installed.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Open a receiver for the pull side. `None` once the channel is closed.
    pub fn receiver(&self) -> Option<broadcast::Receiver<T>> {
        self.sender.lock().as_ref().map(|sender| sender.subscribe())
    }

    /// Number of installed handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Deliver `value` to handlers, then to stream receivers.
    pub fn send(&self, value: &T) {
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler<T>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(value);
        }

        if let Some(sender) = self.sender.lock().as_ref() {
            // An error only means nobody is listening right now.
            let _ = sender.send(value.clone());
        }
    }
}

impl<T> ChangeEmitter for ChangeChannel<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn emit(&self, value: &ErasedValue) {
        match value.downcast_ref::<T>() {
            Some(value) => self.send(value),
            None => warn!(
                expected = std::any::type_name::<T>(),
                "change channel received a value of the wrong type"
            ),
        }
    }

    fn close(&self) {
        self.sender.lock().take();
    }
}
