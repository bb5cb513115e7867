// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    task::{Context, Poll},
};

use futures::FutureExt as _;
use thiserror::Error;
use tracing::Instrument as _;

/// Wrapper around an async runtime handle.
///
/// All tasks the replicator runs are spawned through one of these, so that a
/// teardown sequence can assert on [`Stats`] draining to zero.
#[derive(Clone)]
pub struct Spawner {
    inner: tokio::runtime::Handle,
    stats: Arc<StatsMut>,
}

impl Spawner {
    /// Try to create a [`Spawner`] from the ambient async context.
    ///
    /// Returns `None` if the current thread is not running within an async
    /// runtime.
    pub fn from_current() -> Option<Self> {
        tokio::runtime::Handle::try_current().map(Self::tokio).ok()
    }

    pub fn tokio(inner: tokio::runtime::Handle) -> Self {
        Self {
            inner,
            stats: Arc::new(StatsMut {
                spawned: AtomicUsize::new(0),
                blocking: AtomicUsize::new(0),
            }),
        }
    }

    /// Spawn an asynchronous task, returning a handle to it.
    ///
    /// The task is run in the [`tracing::Span`] active at the call site.
    ///
    /// # Cancellation
    ///
    /// Dropping the returned [`Task`] aborts the task. Call [`Task::detach`]
    /// to let it run to completion in the background instead.
    pub fn spawn<T>(&self, task: T) -> Task<T::Output>
    where
        T: Future + Send + 'static,
        T::Output: Send + 'static,
    {
        let stats = Arc::clone(&self.stats);
        stats.spawned.fetch_add(1, Relaxed);
        Task {
            inner: self.inner.spawn(
                async move {
                    let out = task.await;
                    stats.spawned.fetch_sub(1, Relaxed);
                    out
                }
                .in_current_span(),
            ),
            abort_on_drop: true,
        }
    }

    /// Run a blocking function without stalling the async runtime's workers.
    ///
    /// # Cancellation
    ///
    /// Blocking tasks can not be cancelled; dropping the future does not stop
    /// the function once it started running.
    pub async fn blocking<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let stats = Arc::clone(&self.stats);
        let span = tracing::Span::current();
        stats.blocking.fetch_add(1, Relaxed);
        let res = self
            .inner
            .spawn_blocking(move || {
                let _guard = span.enter();
                f()
            })
            .await;
        stats.blocking.fetch_sub(1, Relaxed);
        match res {
            Ok(t) => t,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            spawned: self.stats.spawned.load(Relaxed),
            blocking: self.stats.blocking.load(Relaxed),
        }
    }
}

struct StatsMut {
    spawned: AtomicUsize,
    blocking: AtomicUsize,
}

/// Snapshot of the tasks currently in flight on a [`Spawner`].
#[derive(Clone, Copy, Debug)]
pub struct Stats {
    /// Tasks spawned via [`Spawner::spawn`] whose futures have not resolved
    /// yet, including detached ones.
    pub spawned: usize,
    /// Functions submitted via [`Spawner::blocking`] which have not returned
    /// yet.
    pub blocking: usize,
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("task cancelled")]
    Cancelled,

    #[error("task panicked")]
    Panicked(#[source] PanicSource),
}

/// Opaque carrier for a panic payload, so [`JoinError`] can be a
/// `std::error::Error`.
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct PanicSource {
    msg: String,
}

/// A handle to a task spawned via [`Spawner::spawn`].
///
/// Dropping a [`Task`] aborts it, ie. `spawner.spawn(fut);` is a no-op.
#[must_use = "spawned tasks must be awaited or detached"]
pub struct Task<T> {
    inner: tokio::task::JoinHandle<T>,
    abort_on_drop: bool,
}

impl<T> Task<T> {
    /// Abort the task.
    ///
    /// The task is dropped at the next yield point, so it is not guaranteed
    /// to be gone when this returns.
    pub fn abort(&self) {
        self.inner.abort()
    }

    /// Keep running the task in the background, discarding its output.
    pub fn detach(mut self) {
        self.abort_on_drop = false;
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if self.abort_on_drop {
            self.inner.abort()
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx).map_err(|e| {
            if e.is_cancelled() {
                JoinError::Cancelled
            } else {
                JoinError::Panicked(PanicSource { msg: e.to_string() })
            }
        })
    }
}
