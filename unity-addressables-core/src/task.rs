//! Completion futures
//!
//! [`OperationTask`] resolves once the operation's completion callbacks have
//! been dispatched. It is fed through the ordinary completion-callback path,
//! so someone still has to tick the manager for it to make progress.

use futures::channel::oneshot;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::OperationException;

/// Outcome delivered by an [`OperationTask`]
pub type TaskResult<T> = std::result::Result<T, OperationException>;

/// Future resolving to an operation's result or failure.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct OperationTask<T> {
    receiver: oneshot::Receiver<TaskResult<T>>,
}

impl<T> OperationTask<T> {
    pub(crate) fn channel() -> (oneshot::Sender<TaskResult<T>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }
}

impl<T> Future for OperationTask<T> {
    type Output = TaskResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(OperationException::new(
                    "Operation was released before it completed",
                ))
            })
        })
    }
}
