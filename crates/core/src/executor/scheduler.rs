//! Cancelable one-shot timers on a shared runtime

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};

static SCHEDULER_RUNTIME: OnceCell<Runtime> = OnceCell::new();

//==============================================================================
// Timer Handle
//==============================================================================

/// A handle that can be used to cancel a scheduled callback
///
/// Dropping the handle does not cancel the timer; see
/// [`TimerHandle::cancel_on_drop`] for that.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl TimerHandle {
    fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), task: None }
    }

    /// Cancel the timer
    ///
    /// Returns `true` for the call that actually cancelled it. A callback
    /// that already started runs to completion.
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
        first
    }

    /// Check if the timer has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the timer task has finished, by firing or by cancellation
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, AbortHandle::is_finished)
    }

    /// Cancel the timer when the returned guard is dropped
    pub fn cancel_on_drop(self) -> TimerGuard {
        TimerGuard { handle: self }
    }
}

/// Cancels its timer on drop
#[derive(Debug)]
pub struct TimerGuard {
    handle: TimerHandle,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

//==============================================================================
// Scheduler
//==============================================================================

/// Runs callbacks after a delay
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("runtime", &self.handle.runtime_flavor()).finish()
    }
}

impl Scheduler {
    /// Process-wide scheduler, created on first use
    pub fn global() -> ConfigResult<Self> {
        let runtime = SCHEDULER_RUNTIME
            .get_or_try_init(|| {
                info!("starting shared scheduler runtime");
                Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("faultline-scheduler")
                    .enable_all()
                    .build()
            })
            .map_err(|source| ConfigError::Runtime { component: "scheduler", source })?;
        Ok(Self { handle: runtime.handle().clone() })
    }

    /// Scheduler running on a caller-owned runtime
    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime driving the current task, if any
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::from_handle)
    }

    /// Run `callback` once after `delay` unless cancelled first
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_async(delay, async move { callback() })
    }

    /// Run `future` to completion after `delay` unless cancelled first
    pub fn schedule_async<Fut>(&self, delay: Duration, future: Fut) -> TimerHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timer = TimerHandle::new();
        let cancelled = Arc::clone(&timer.cancelled);
        let task = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if cancelled.load(Ordering::SeqCst) {
                debug!("timer cancelled before firing");
                return;
            }
            future.await;
        });
        timer.task = Some(task.abort_handle());
        timer
    }

    /// Run `future` on the scheduler runtime right away
    pub fn spawn<Fut>(&self, future: Fut) -> TimerHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule_async(Duration::ZERO, future)
    }

    /// Future that resolves once `delay` has passed on this scheduler
    ///
    /// The returned future can be awaited on any executor; dropping it
    /// cancels the underlying timer.
    pub fn delay(&self, delay: Duration) -> Delay {
        let (tx, rx) = oneshot::channel();
        let timer = self.schedule(delay, move || {
            let _fired = tx.send(());
        });
        Delay { rx, timer }
    }
}

/// Timer future produced by [`Scheduler::delay`]
#[derive(Debug)]
#[must_use = "a delay does nothing unless awaited"]
pub struct Delay {
    rx: oneshot::Receiver<()>,
    timer: TimerHandle,
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|_| ())
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    use super::*;

    /// Validates `Scheduler::schedule` behavior for the timer fires scenario.
    ///
    /// Assertions:
    /// - Confirms the callback runs once after the delay.
    #[tokio::test]
    async fn test_schedule_fires_once() {
        let scheduler = Scheduler::current().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);

        let handle = scheduler.schedule(Duration::from_millis(10), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!handle.is_cancelled());
        assert!(handle.is_finished());
    }

    /// Validates `TimerHandle::cancel` behavior for the cancelled timer
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures a cancelled callback never runs.
    /// - Confirms only the first cancel reports success.
    #[tokio::test]
    async fn test_cancelled_timer_does_not_fire() {
        let scheduler = Scheduler::current().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);

        let handle = scheduler.schedule(Duration::from_millis(20), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }

    /// Validates `TimerHandle::cancel_on_drop` behavior for the guard
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures dropping the guard cancels the timer.
    #[tokio::test]
    async fn test_timer_guard_cancels_on_drop() {
        let scheduler = Scheduler::current().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);

        let guard = scheduler
            .schedule(Duration::from_millis(20), move || fired_clone.store(true, Ordering::SeqCst))
            .cancel_on_drop();
        drop(guard);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    /// Validates `Scheduler::global` behavior for the delay from a foreign
    /// executor scenario.
    ///
    /// Assertions:
    /// - Confirms a delay from the global scheduler resolves under a plain
    ///   `block_on` with no tokio runtime on the calling thread.
    #[test]
    fn test_global_delay_outside_runtime() {
        let scheduler = Scheduler::global().unwrap();
        let started = Instant::now();

        futures::executor::block_on(scheduler.delay(Duration::from_millis(20)));

        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
