//! Result handles returned by every handler
//!
//! A [`ResultHandle`] is the caller's view of a single eventual result. It is
//! returned synchronously from `invoke` and never fails at construction; all
//! failures, including the handler's own rejections, arrive through the
//! handle. A [`StreamHandle`] plays the same role for multi-valued work.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{FtError, FtResult};

//==============================================================================
// Single Result
//==============================================================================

enum HandleState<T> {
    Ready(Option<FtResult<T>>),
    Pending(BoxFuture<'static, FtResult<T>>),
    Channel(oneshot::Receiver<FtResult<T>>),
}

/// Eventual result of a single invocation
///
/// Await it from async code, or call [`ResultHandle::wait`] from a thread
/// that is not driving a runtime.
#[must_use = "a result handle does nothing unless awaited"]
pub struct ResultHandle<T> {
    state: HandleState<T>,
}

// The value is only ever moved out of the handle, never pinned in place.
impl<T> Unpin for ResultHandle<T> {}

impl<T> ResultHandle<T> {
    /// Handle that is already complete
    pub fn ready(result: FtResult<T>) -> Self {
        Self { state: HandleState::Ready(Some(result)) }
    }

    /// Handle backed by a lazily polled future
    pub fn from_future<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = FtResult<T>> + Send + 'static,
    {
        Self { state: HandleState::Pending(Box::pin(future)) }
    }

    /// Handle completed from elsewhere through the returned [`Completer`]
    ///
    /// Dropping the completer without completing it resolves the handle to
    /// [`FtError::Cancelled`].
    pub fn channel() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (Completer { tx }, Self { state: HandleState::Channel(rx) })
    }

    /// Whether the result is already available without polling
    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandleState::Ready(Some(_)))
    }

    /// Block the current thread until the result is available
    ///
    /// Must not be called from inside an async task: the runtime thread would
    /// be blocked for the duration of the wait.
    pub fn wait(self) -> FtResult<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for ResultHandle<T> {
    type Output = FtResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Ready(slot) => Poll::Ready(slot.take().unwrap_or(Err(FtError::Cancelled))),
            HandleState::Pending(future) => future.as_mut().poll(cx),
            HandleState::Channel(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or_else(|_| Err(FtError::Cancelled))),
        }
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            HandleState::Ready(Some(Ok(_))) => "ready(ok)",
            HandleState::Ready(Some(Err(_))) => "ready(err)",
            HandleState::Ready(None) => "consumed",
            HandleState::Pending(_) => "pending",
            HandleState::Channel(_) => "awaiting completion",
        };
        f.debug_struct("ResultHandle").field("state", &state).finish()
    }
}

/// Write side of a channel-backed [`ResultHandle`]
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<FtResult<T>>,
}

impl<T> Completer<T> {
    /// Complete the handle; a handle that was already dropped is ignored
    pub fn complete(self, result: FtResult<T>) {
        if self.tx.send(result).is_err() {
            debug!("result handle dropped before completion");
        }
    }

    /// Whether the receiving handle has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

//==============================================================================
// Stream of Results
//==============================================================================

/// Eventual sequence of results from multi-valued work
///
/// A failure is delivered as an `Err` item; handlers end the stream after
/// delivering their own terminal error.
#[must_use = "a stream handle does nothing unless polled"]
pub struct StreamHandle<T> {
    inner: BoxStream<'static, FtResult<T>>,
}

impl<T: Send + 'static> StreamHandle<T> {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = FtResult<T>> + Send + 'static,
    {
        Self { inner: stream.boxed() }
    }

    /// Stream that yields a single error and ends
    pub fn failed(error: FtError) -> Self {
        Self::from_stream(stream::iter(Some(Err(error))))
    }

    /// Stream fed through the returned sender; it ends once every sender is
    /// dropped
    pub fn channel(capacity: usize) -> (mpsc::Sender<FtResult<T>>, Self) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        (tx, Self::from_stream(stream::poll_fn(move |cx| rx.poll_recv(cx))))
    }
}

impl<T> Stream for StreamHandle<T> {
    type Item = FtResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> fmt::Debug for StreamHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}
