//! One attempt of deferred work
//!
//! A [`DelayedTask`] bundles the work for a single attempt with the completer
//! of the [`ResultHandle`] that reports it. The retry engine builds one per
//! attempt and either runs it right away or hands it to the scheduler.
//!
//! For streaming work the task forwards elements into a channel and records
//! in a [`DataFlag`] whether anything was emitted, which decides whether a
//! failed stream attempt may be retried.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{FtError, FtResult};
use crate::executor::{Scheduler, TimerHandle};
use crate::handle::{Completer, ResultHandle};

type Supplier<T> = Box<dyn FnOnce() -> BoxFuture<'static, FtResult<T>> + Send>;

/// Shared record of whether a streaming attempt emitted any element
#[derive(Debug, Clone, Default)]
pub struct DataFlag {
    seen: Arc<AtomicBool>,
}

impl DataFlag {
    pub fn had_data(&self) -> bool {
        self.seen.load(Ordering::Acquire)
    }

    fn mark(&self) {
        self.seen.store(true, Ordering::Release);
    }
}

/// Work for one attempt, paired with the handle that reports its outcome
pub struct DelayedTask<T> {
    supplier: Supplier<T>,
    completer: Completer<T>,
    data: DataFlag,
}

impl<T> fmt::Debug for DelayedTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedTask").field("had_data", &self.data.had_data()).finish()
    }
}

impl<T: Send + 'static> DelayedTask<T> {
    /// Wrap single-valued work; the work is not started until the task runs
    pub fn new<F, Fut, E>(work: F) -> (Self, ResultHandle<T>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FtError>,
    {
        let supplier: Supplier<T> =
            Box::new(move || work().map(|result| result.map_err(Into::<FtError>::into)).boxed());
        Self::from_supplier(supplier, DataFlag::default())
    }

    fn from_supplier(supplier: Supplier<T>, data: DataFlag) -> (Self, ResultHandle<T>) {
        let (completer, handle) = ResultHandle::channel();
        (Self { supplier, completer, data }, handle)
    }

    /// Whether the attempt emitted at least one element so far
    pub fn had_data(&self) -> bool {
        self.data.had_data()
    }

    /// Flag that stays readable after the task has been consumed
    pub fn data_flag(&self) -> DataFlag {
        self.data.clone()
    }

    /// Run the work now and complete the handle with its outcome
    pub async fn execute(self) {
        let Self { supplier, completer, .. } = self;
        if completer.is_closed() {
            debug!("result handle dropped, skipping attempt");
            return;
        }
        completer.complete(supplier().await);
    }

    /// Run the work on `scheduler` after `delay`
    pub fn schedule(self, scheduler: &Scheduler, delay: Duration) -> TimerHandle {
        scheduler.schedule_async(delay, self.execute())
    }
}

impl DelayedTask<()> {
    /// Wrap streaming work whose elements are forwarded into `sink`
    ///
    /// The task completes with `Ok(())` when the stream ends, or with the
    /// first element error. The data flag is set before each element is
    /// forwarded.
    pub fn forwarding<F, S, U, E>(work: F, sink: mpsc::Sender<FtResult<U>>) -> (Self, ResultHandle<()>)
    where
        F: FnOnce() -> S + Send + 'static,
        S: Stream<Item = Result<U, E>> + Send + 'static,
        U: Send + 'static,
        E: Into<FtError> + Send + 'static,
    {
        let data = DataFlag::default();
        let marker = data.clone();
        let supplier: Supplier<()> = Box::new(move || {
            async move {
                let mut stream = Box::pin(work());
                while let Some(item) = stream.next().await {
                    let value = match item {
                        Ok(value) => value,
                        Err(error) => return Err(error.into()),
                    };
                    marker.mark();
                    if sink.send(Ok(value)).await.is_err() {
                        debug!("stream consumer went away, stopping attempt");
                        return Ok(());
                    }
                }
                Ok::<(), FtError>(())
            }
            .boxed()
        });
        Self::from_supplier(supplier, data)
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::testing::CallCounter;

    /// Validates `DelayedTask::execute` behavior for the immediate execution
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms the work runs once and its value reaches the handle.
    #[tokio::test]
    async fn test_execute_completes_handle() {
        let counter = CallCounter::new();
        let calls = counter.clone();
        let (task, handle) = DelayedTask::new(move || async move {
            calls.hit();
            Ok::<_, FtError>("value")
        });

        assert_eq!(counter.count(), 0);
        task.execute().await;

        assert_eq!(handle.await.unwrap(), "value");
        assert_eq!(counter.count(), 1);
    }

    /// Validates `DelayedTask::schedule` behavior for the delayed execution
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures the work has not run before the delay.
    /// - Confirms the handle completes after the delay.
    #[tokio::test]
    async fn test_schedule_runs_after_delay() {
        let scheduler = Scheduler::current().unwrap();
        let counter = CallCounter::new();
        let calls = counter.clone();
        let (task, handle) = DelayedTask::new(move || async move {
            calls.hit();
            Err::<(), _>(FtError::from("attempt failed"))
        });

        let _timer = task.schedule(&scheduler, Duration::from_millis(30));
        assert_eq!(counter.count(), 0);

        let result = handle.await;
        assert_eq!(result.unwrap_err().to_string(), "attempt failed");
        assert_eq!(counter.count(), 1);
    }

    /// Validates `DelayedTask::forwarding` behavior for the emitted data
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms elements before the error are forwarded.
    /// - Confirms the flag records that data was emitted.
    /// - Confirms the element error completes the handle.
    #[tokio::test]
    async fn test_forwarding_tracks_emitted_data() {
        let (sink, mut received) = mpsc::channel(8);
        let (task, handle) = DelayedTask::forwarding(
            || stream::iter(vec![Ok(1), Ok(2), Err(FtError::from("broken"))]),
            sink,
        );
        let flag = task.data_flag();
        assert!(!task.had_data());

        task.execute().await;

        assert!(flag.had_data());
        assert_eq!(handle.await.unwrap_err().to_string(), "broken");
        assert_eq!(received.recv().await.unwrap().unwrap(), 1);
        assert_eq!(received.recv().await.unwrap().unwrap(), 2);
    }

    /// Validates `DelayedTask::forwarding` behavior for the failure before
    /// data scenario.
    ///
    /// Assertions:
    /// - Ensures the flag stays clear when the stream fails immediately.
    #[tokio::test]
    async fn test_forwarding_without_data() {
        let (sink, _received) = mpsc::channel::<FtResult<u8>>(1);
        let (task, handle) =
            DelayedTask::forwarding(|| stream::iter(vec![Err::<u8, _>(FtError::Cancelled)]), sink);
        let flag = task.data_flag();

        task.execute().await;

        assert!(!flag.had_data());
        assert!(matches!(handle.await, Err(FtError::Cancelled)));
    }
}
