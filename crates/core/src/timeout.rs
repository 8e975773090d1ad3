//! Timeout guard
//!
//! Bounds how long work may take. The deadline is a timer on the shared
//! [`Scheduler`], started when `invoke` is called.
//!
//! - Async mode (default): the work's future is raced against the timer and
//!   dropped if the timer wins.
//! - Sync mode: `invoke` drives the race on the calling thread and returns a
//!   completed handle.
//! - [`TimeoutGuard::invoke_sync`] runs a blocking closure on the calling
//!   thread and interrupts it cooperatively through an [`Interruption`]
//!   token when the deadline passes.
//!
//! On expiry the outcome is always [`FtError::Timeout`], never the work's own
//! error.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use futures::future::{self, Either};
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, FtError, FtResult};
use crate::executor::{Delay, Scheduler};
use crate::handle::{ResultHandle, StreamHandle};

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for timeout behavior
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TimeoutConfig {
    /// Name used in logs
    pub name: String,
    #[cfg_attr(feature = "serde", serde(with = "crate::serde_util::duration_millis"))]
    pub timeout: Duration,
    /// Race futures asynchronously (`true`) or block the caller (`false`)
    pub is_async: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { name: "timeout".to_string(), timeout: Duration::from_secs(10), is_async: true }
    }
}

impl TimeoutConfig {
    pub fn builder() -> TimeoutConfigBuilder {
        TimeoutConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for TimeoutConfig
#[derive(Debug, Default)]
pub struct TimeoutConfigBuilder {
    config: TimeoutConfig,
}

impl TimeoutConfigBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guard name used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the deadline applied to each invocation
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Race the work on the scheduler (`true`) or bound a blocking wait (`false`)
    pub fn is_async(mut self, is_async: bool) -> Self {
        self.config.is_async = is_async;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> ConfigResult<TimeoutConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Interruption
//==============================================================================

/// Returned by [`Interruption`] helpers once the deadline has passed
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Thread was interrupted by a timeout")]
pub struct Interrupted;

impl From<Interrupted> for FtError {
    fn from(error: Interrupted) -> Self {
        FtError::failed(error)
    }
}

/// Cooperative interruption token handed to blocking work
///
/// Blocking work should call [`Interruption::sleep`] instead of
/// `std::thread::sleep`, or poll [`Interruption::check`] between steps.
#[derive(Debug)]
pub struct Interruption {
    thread: Thread,
    interrupted: AtomicBool,
    interrupts: AtomicU32,
}

impl Interruption {
    fn for_current_thread() -> Self {
        Self {
            thread: thread::current(),
            interrupted: AtomicBool::new(false),
            interrupts: AtomicU32::new(0),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// How many times the thread was interrupted
    pub fn interrupt_count(&self) -> u32 {
        self.interrupts.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early on interruption
    ///
    /// Must be called from the thread that runs the guarded work.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::park_timeout(deadline - now);
        }
    }

    fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::AcqRel);
        self.interrupted.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

//==============================================================================
// Timeout Guard
//==============================================================================

/// Fails work that does not finish within the configured timeout
#[derive(Debug, Clone)]
pub struct TimeoutGuard {
    config: TimeoutConfig,
    scheduler: Scheduler,
}

impl TimeoutGuard {
    /// Create a guard whose timers run on the shared scheduler
    pub fn new(config: TimeoutConfig) -> ConfigResult<Self> {
        Self::with_scheduler(config, Scheduler::global()?)
    }

    pub fn with_scheduler(config: TimeoutConfig, scheduler: Scheduler) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, scheduler })
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Run async work under the deadline
    ///
    /// `work` is called right away. In sync mode this blocks the calling
    /// thread until the work or the deadline finishes; do not use sync mode
    /// from a thread that also drives the work's runtime.
    #[instrument(skip(self, work), fields(timeout = %self.config.name, is_async = self.config.is_async))]
    pub fn invoke<F, Fut, T, E>(&self, work: F) -> ResultHandle<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError>,
    {
        let timeout = self.config.timeout;
        let deadline = self.scheduler.delay(timeout);
        let work = work().map(|result| result.map_err(Into::<FtError>::into));
        let race = async move {
            match future::select(Box::pin(work), deadline).await {
                Either::Left((result, _)) => result,
                Either::Right(((), _)) => {
                    debug!(?timeout, "work did not finish before the deadline");
                    Err(FtError::Timeout { timeout })
                }
            }
        };

        if self.config.is_async {
            ResultHandle::from_future(race)
        } else {
            ResultHandle::ready(futures::executor::block_on(race))
        }
    }

    /// Run streaming work under a deadline covering the whole stream
    ///
    /// Not available in sync mode.
    pub fn invoke_multi<F, S, T, E>(&self, work: F) -> StreamHandle<T>
    where
        F: FnOnce() -> S,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError>,
    {
        if !self.config.is_async {
            return StreamHandle::failed(FtError::Unsupported {
                operation: "invoke_multi on a synchronous timeout",
            });
        }
        let timeout = self.config.timeout;
        StreamHandle::from_stream(DeadlineStream {
            inner: work().map(|item| item.map_err(Into::<FtError>::into)).boxed(),
            deadline: Some(self.scheduler.delay(timeout)),
            timeout,
            done: false,
        })
    }

    /// Run blocking work on the calling thread under the deadline
    ///
    /// When the deadline passes first, the token handed to `work` is
    /// interrupted exactly once and the handle completes with
    /// [`FtError::Timeout`] regardless of what `work` returns.
    #[instrument(skip(self, work), fields(timeout = %self.config.name))]
    pub fn invoke_sync<F, T, E>(&self, work: F) -> ResultHandle<T>
    where
        F: FnOnce(&Interruption) -> Result<T, E>,
        E: Into<FtError>,
    {
        let timeout = self.config.timeout;
        let interruption = Arc::new(Interruption::for_current_thread());
        let settled = Arc::new(AtomicBool::new(false));

        let timer = {
            let interruption = Arc::clone(&interruption);
            let settled = Arc::clone(&settled);
            self.scheduler.schedule(timeout, move || {
                if settled.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
                {
                    warn!(?timeout, "deadline passed, interrupting blocked thread");
                    interruption.interrupt();
                }
            })
        };

        let result = work(&interruption).map_err(Into::<FtError>::into);

        if settled.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            timer.cancel();
            ResultHandle::ready(result)
        } else {
            ResultHandle::ready(Err(FtError::Timeout { timeout }))
        }
    }
}

/// Stream that fails with a timeout once its deadline passes
struct DeadlineStream<T> {
    inner: BoxStream<'static, FtResult<T>>,
    deadline: Option<Delay>,
    timeout: Duration,
    done: bool,
}

impl<T> Stream for DeadlineStream<T> {
    type Item = FtResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if Pin::new(deadline).poll(cx).is_ready() {
                this.done = true;
                this.deadline = None;
                debug!(timeout = ?this.timeout, "stream did not finish before the deadline");
                return Poll::Ready(Some(Err(FtError::Timeout { timeout: this.timeout })));
            }
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.done = true;
                this.deadline = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
