use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::{Error, Result};

/// A handle to a spawned background task, resolving to an `Err` if the task panicked rather
/// than completing normally.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T> {
    inner: tokio::task::JoinHandle<T>,
}

impl<T> AsyncJoinHandle<T> {
    pub(super) fn new(inner: tokio::task::JoinHandle<T>) -> Self {
        Self { inner }
    }

    /// Aborts the underlying task.
    pub(crate) fn abort(&self) {
        self.inner.abort();
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        inner
            .poll(cx)
            .map(|result| result.map_err(|e| Error::internal(e.to_string())))
    }
}
