//! Retry engine
//!
//! Re-runs failed work according to a [`BackoffPolicy`]. The first call runs
//! with no delay; before every later call the engine asks the policy for a
//! delay, checks the overall timeout and schedules the attempt on the shared
//! scheduler.
//!
//! Failures are never discarded: when the engine gives up, the last failure
//! is reported with all earlier ones attached (see [`FtError::Suppressing`]).
//!
//! Streaming work gets one extra rule: once an attempt has emitted an
//! element, its failure is final, so consumers never see duplicated
//! elements from a replayed stream.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

pub use crate::backoff::{BackoffPolicy, ExponentialBackoff, FixedDelay, Jitter, JitterPolicy};
use crate::classify::{ErrorChecker, ErrorMatcher};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ErrorKind, FtError, FtResult};
use crate::executor::{Scheduler, TimerGuard};
use crate::handle::{ResultHandle, StreamHandle};
use crate::task::DelayedTask;

/// Elements buffered between a streaming attempt and its consumer
const STREAM_BUFFER: usize = 32;

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for retry behavior
#[derive(Clone)]
pub struct RetryConfig {
    /// Name used in logs
    pub name: String,
    /// Upper bound on time spent retrying, checked before each retry
    pub overall_timeout: Duration,
    pub policy: Arc<dyn BackoffPolicy>,
    /// Failures that end retrying immediately
    pub checker: ErrorChecker,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("name", &self.name)
            .field("overall_timeout", &self.overall_timeout)
            .field("checker", &self.checker)
            .finish_non_exhaustive()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            name: "retry".to_string(),
            overall_timeout: Duration::from_secs(1),
            policy: Arc::new(JitterPolicy::default()),
            checker: ErrorChecker::default(),
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.overall_timeout.is_zero() {
            return Err(ConfigError::invalid("overall_timeout must be greater than 0"));
        }
        self.policy.validate()
    }
}

/// Builder for RetryConfig
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine name used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the time budget across all calls
    pub fn overall_timeout(mut self, timeout: Duration) -> Self {
        self.config.overall_timeout = timeout;
        self
    }

    /// Use a custom backoff policy
    pub fn policy<P: BackoffPolicy + 'static>(mut self, policy: P) -> Self {
        self.config.policy = Arc::new(policy);
        self
    }

    /// Up to `calls` calls with the same delay between them
    pub fn fixed_delay(self, calls: u32, delay: Duration) -> Self {
        self.policy(FixedDelay::new(calls, delay))
    }

    /// Up to `calls` calls, each delay drawn from `delay ± jitter`
    pub fn jitter(self, calls: u32, delay: Duration, jitter: Duration) -> Self {
        self.policy(JitterPolicy::new(calls, delay, jitter))
    }

    /// Give up immediately on failures caused by `E`
    pub fn skip_on<E: std::error::Error + 'static>(self) -> Self {
        self.skip_on_matcher(ErrorMatcher::of::<E>())
    }

    /// Retry only failures caused by `E` (and other applied types)
    pub fn apply_on<E: std::error::Error + 'static>(self) -> Self {
        self.apply_on_matcher(ErrorMatcher::of::<E>())
    }

    /// Give up immediately on failures of `kind`
    pub fn skip_on_kind(self, kind: ErrorKind) -> Self {
        self.skip_on_matcher(ErrorMatcher::kind(kind))
    }

    /// Give up immediately on failures matched by `matcher`
    pub fn skip_on_matcher(mut self, matcher: ErrorMatcher) -> Self {
        self.config.checker.push_skip(matcher);
        self
    }

    /// Retry only failures matched by `matcher` (and other applied matchers)
    pub fn apply_on_matcher(mut self, matcher: ErrorMatcher) -> Self {
        self.config.checker.push_apply(matcher);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Retry Context
//==============================================================================

/// Bookkeeping for one `invoke` call
struct RetryContext {
    started_at: Instant,
    started_millis: u64,
    /// Calls started so far
    calls: u32,
    last_delay_millis: u64,
    errors: Vec<FtError>,
}

impl RetryContext {
    fn new(clock: &dyn Clock) -> Self {
        Self {
            started_at: clock.now(),
            started_millis: clock.epoch_millis(),
            calls: 0,
            last_delay_millis: 0,
            errors: Vec::new(),
        }
    }

    fn take_error(&mut self) -> FtError {
        FtError::chain(std::mem::take(&mut self.errors))
    }
}

//==============================================================================
// Retry Engine
//==============================================================================

struct RetryInner {
    config: RetryConfig,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    retry_counter: AtomicU64,
}

/// Retries failed work according to its configuration
///
/// Cloning is cheap and clones share the retry counter.
#[derive(Clone)]
pub struct RetryEngine {
    inner: Arc<RetryInner>,
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("config", &self.inner.config)
            .field("retry_counter", &self.retry_counter())
            .finish()
    }
}

impl RetryEngine {
    /// Create an engine whose delayed attempts run on the shared scheduler
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        Self::with_scheduler(config, Scheduler::global()?)
    }

    pub fn with_scheduler(config: RetryConfig, scheduler: Scheduler) -> ConfigResult<Self> {
        Self::with_clock(config, scheduler, SystemClock)
    }

    /// Create an engine with a custom clock (useful for testing)
    pub fn with_clock<C: Clock>(
        config: RetryConfig,
        scheduler: Scheduler,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RetryInner {
                config,
                scheduler,
                clock: Arc::new(clock),
                retry_counter: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    /// Number of calls made beyond the first, across all invocations
    pub fn retry_counter(&self) -> u64 {
        self.inner.retry_counter.load(Ordering::Relaxed)
    }

    /// Run async work, retrying failures
    ///
    /// `work` is called once per attempt. Nothing runs until the handle is
    /// first polled.
    pub fn invoke<F, Fut, T, E>(&self, work: F) -> ResultHandle<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError> + 'static,
    {
        ResultHandle::from_future(Arc::clone(&self.inner).run_single(work))
    }

    /// Run streaming work, retrying failed attempts that emitted nothing
    ///
    /// The attempts are driven on the scheduler; elements are forwarded to
    /// the returned stream as they arrive.
    pub fn invoke_multi<F, S, T, E>(&self, work: F) -> StreamHandle<T>
    where
        F: FnMut() -> S + Send + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError> + Send + 'static,
    {
        let (sink, stream) = StreamHandle::channel(STREAM_BUFFER);
        let inner = Arc::clone(&self.inner);
        self.inner.scheduler.spawn(async move {
            if let Err(error) = inner.run_multi(work, sink.clone()).await {
                if sink.send(Err(error)).await.is_err() {
                    debug!("stream consumer went away before the failure was delivered");
                }
            }
        });
        stream
    }
}

impl RetryInner {
    #[instrument(skip_all, fields(retry = %self.config.name))]
    async fn run_single<F, Fut, T, E>(self: Arc<Self>, work: F) -> FtResult<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError>,
    {
        let work = Arc::new(Mutex::new(work));
        let mut context = RetryContext::new(self.clock.as_ref());

        loop {
            let delay = self.next_delay(&mut context)?;
            let attempt_work = Arc::clone(&work);
            let (task, handle) = DelayedTask::new(move || {
                let mut work = attempt_work.lock();
                (*work)()
            });
            let _timer = self.start(task, delay).await;

            match handle.await {
                Ok(value) => {
                    if context.calls > 1 {
                        debug!(calls = context.calls, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let terminal = self.config.checker.should_skip(&error);
                    debug!(call = context.calls, %error, terminal, "attempt failed");
                    context.errors.push(error);
                    if terminal {
                        return Err(context.take_error());
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(retry = %self.config.name))]
    async fn run_multi<F, S, T, E>(
        self: Arc<Self>,
        work: F,
        sink: mpsc::Sender<FtResult<T>>,
    ) -> FtResult<()>
    where
        F: FnMut() -> S + Send + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError> + Send + 'static,
    {
        let work = Arc::new(Mutex::new(work));
        let mut context = RetryContext::new(self.clock.as_ref());

        loop {
            if sink.is_closed() {
                debug!(calls = context.calls, "stream consumer went away, retrying stopped");
                return Ok(());
            }
            let delay = self.next_delay(&mut context)?;
            let attempt_work = Arc::clone(&work);
            let (task, handle) = DelayedTask::forwarding(
                move || {
                    let mut work = attempt_work.lock();
                    (*work)()
                },
                sink.clone(),
            );
            let data = task.data_flag();
            let _timer = self.start(task, delay).await;

            match handle.await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    let terminal = data.had_data() || self.config.checker.should_skip(&error);
                    debug!(call = context.calls, %error, terminal, "stream attempt failed");
                    context.errors.push(error);
                    if terminal {
                        return Err(context.take_error());
                    }
                }
            }
        }
    }

    /// Run `task` now when there is no delay, otherwise on the scheduler
    ///
    /// The guard cancels a still pending attempt if the caller goes away.
    async fn start<T: Send + 'static>(
        &self,
        task: DelayedTask<T>,
        delay: Duration,
    ) -> Option<TimerGuard> {
        if delay.is_zero() {
            task.execute().await;
            None
        } else {
            Some(task.schedule(&self.scheduler, delay).cancel_on_drop())
        }
    }

    /// Delay before the next call, or the error that ends retrying
    fn next_delay(&self, context: &mut RetryContext) -> FtResult<Duration> {
        let call_index = context.calls;
        context.calls += 1;
        if call_index == 0 {
            return Ok(Duration::ZERO);
        }

        let Some(delay_millis) = self.config.policy.next_delay_millis(
            context.started_millis,
            context.last_delay_millis,
            call_index,
        ) else {
            debug!(calls = call_index, "retry policy exhausted");
            return Err(context.take_error());
        };

        let elapsed = self.clock.now().saturating_duration_since(context.started_at);
        let limit = self.config.overall_timeout;
        if elapsed > limit {
            warn!(?elapsed, ?limit, calls = call_index, "overall retry timeout exceeded");
            return Err(FtError::RetryTimeout {
                elapsed,
                limit,
                source: Box::new(context.take_error()),
            });
        }

        context.last_delay_millis = delay_millis;
        self.retry_counter.fetch_add(1, Ordering::Relaxed);
        debug!(call = call_index, delay_ms = delay_millis, "scheduling retry");
        Ok(Duration::from_millis(delay_millis))
    }
}
