//! Completion handles: the path by which an item's result reaches its consumer.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::ItemError;

pub type ItemResult<V> = Result<V, ItemError>;

/// One-shot handle that delivers the outcome of a single item.
///
/// `complete` consumes the handle, so a result is delivered at most once. A
/// handle dropped without being completed delivers `ItemError::Abandoned`, so
/// the consumer always observes exactly one outcome.
#[derive(Debug)]
pub struct Completion<V> {
    sender: Option<oneshot::Sender<ItemResult<V>>>,
}

impl<V> Completion<V> {
    /// Create a handle together with the future that resolves to its outcome
    pub fn channel() -> (Self, Pending<V>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Some(sender),
            },
            Pending { receiver },
        )
    }

    pub fn complete(mut self, result: ItemResult<V>) {
        if let Some(sender) = self.sender.take() {
            // the consumer may have gone away; nothing left to notify
            let _ = sender.send(result);
        }
    }

    pub fn succeed(self, value: V) {
        self.complete(Ok(value));
    }

    pub fn fail(self, err: ItemError) {
        self.complete(Err(err));
    }
}

impl<V> Drop for Completion<V> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(ItemError::Abandoned));
        }
    }
}

/// Future resolving to the outcome delivered through a [`Completion`].
#[derive(Debug)]
pub struct Pending<V> {
    receiver: oneshot::Receiver<ItemResult<V>>,
}

impl<V> Pending<V> {
    /// Outcome if one has been delivered, without waiting
    pub fn try_result(&mut self) -> Option<ItemResult<V>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ItemError::Abandoned)),
        }
    }
}

impl<V> Future for Pending<V> {
    type Output = ItemResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ItemError::Abandoned)))
    }
}
