//! Async Streams
//!
//! Pull-style views over the push notifications.
//!
//! - [`ChangeStream`] yields every value a single node announces on its
//!   change channel.
//! - [`ObservedStream`] wraps a tracking registration and yields a freshly
//!   computed value after each coalesced episode.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::warn;

use crate::graph::Graph;

use super::tracking::Registration;

/// Stream of a node's changes.
///
/// Ends when the node is released or its channel is closed. A consumer that
/// falls more than the configured capacity behind skips ahead to the values
/// still buffered.
pub struct ChangeStream<T> {
    inner: Option<BroadcastStream<T>>,
}

impl<T> ChangeStream<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(receiver: Option<broadcast::Receiver<T>>) -> Self {
        Self {
            inner: receiver.map(BroadcastStream::new),
        }
    }
}

impl<T> Stream for ChangeStream<T>
where
    T: Clone + Send + 'static,
{
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        loop {
            let Some(inner) = self.inner.as_mut() else {
                return Poll::Ready(None);
            };
            match Pin::new(inner).poll_next(cx) {
                Poll::Ready(Some(Ok(value))) => return Poll::Ready(Some(value)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, "change stream lagged");
                }
                Poll::Ready(None) => {
                    self.inner = None;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> fmt::Debug for ChangeStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("open", &self.inner.is_some())
            .finish()
    }
}

/// Stream of values recomputed whenever what they read changes.
///
/// Only the latest value is kept between polls, so a burst of changes is
/// seen as one item. Dropping the stream cancels its registration.
pub struct ObservedStream<T> {
    inner: WatchStream<Option<T>>,
    registration: Registration,
}

impl<T> ObservedStream<T> {
    /// The registration driving this stream.
    pub fn registration(&self) -> &Registration {
        &self.registration
    }
}

impl<T> Stream for ObservedStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Some(value))) => return Poll::Ready(Some(value)),
                // Placeholder from before the first run.
                Poll::Ready(Some(None)) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> fmt::Debug for ObservedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedStream")
            .field("registration", &self.registration)
            .finish()
    }
}

impl Graph {
    /// Observe `f` as an async stream.
    ///
    /// `f` runs now inside a tracking registration; the first item is that
    /// result. Each later item is `f` rerun after a batch of changes to what
    /// it read.
    pub fn observe<T, F>(&self, f: F) -> ObservedStream<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let (sender, receiver) = watch::channel(None);
        let registration = self.track(move |_| {
            sender.send_replace(Some(f()));
        });
        ObservedStream {
            inner: WatchStream::new(receiver),
            registration,
        }
    }
}
