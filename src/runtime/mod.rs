//! A thin wrapper over the tokio runtime, kept as its own module so the SDAM loops depend on a
//! small seam rather than reaching for `tokio::` directly throughout.

mod join_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::join_handle::AsyncJoinHandle;

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F>(fut: F) -> AsyncJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    AsyncJoinHandle::new(tokio::task::spawn(fut))
}

/// Sleep for the given duration.
pub(crate) async fn delay_for(duration: Duration) {
    tokio::time::sleep(duration).await;
}
