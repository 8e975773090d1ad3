//! Bulkhead
//!
//! Caps how many invocations run at the same time. Calls beyond
//! `max_concurrent` wait in a bounded queue; once `max_queue` calls are
//! waiting, new calls are rejected right away. A queued call that is not
//! admitted within `acquire_timeout` is rejected as well. Rejected work never
//! runs and fails with [`FtError::Rejected`].
//!
//! A free slot is taken when `invoke` is called. A queued call holds its
//! queue place until it is admitted or its handle is dropped.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, Either};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, FtError, FtResult};
use crate::executor::Scheduler;
use crate::handle::ResultHandle;

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for bulkhead behavior
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BulkheadConfig {
    /// Name used in logs
    pub name: String,
    /// Maximum number of invocations running at once
    pub max_concurrent: usize,
    /// Maximum number of invocations waiting for a slot
    pub max_queue: usize,
    /// How long a queued invocation waits; `None` waits until a slot frees
    #[cfg_attr(feature = "serde", serde(with = "crate::serde_util::option_duration_millis"))]
    pub acquire_timeout: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { name: "bulkhead".to_string(), max_concurrent: 10, max_queue: 10, acquire_timeout: None }
    }
}

impl BulkheadConfig {
    /// Create a configuration builder
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent must be greater than 0"));
        }
        if self.acquire_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid("acquire_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for BulkheadConfig
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bulkhead name used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set how many invocations may run at once
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    /// Set how many invocations may wait for a slot
    pub fn max_queue(mut self, max: usize) -> Self {
        self.config.max_queue = max;
        self
    }

    /// Reject queued invocations not admitted within `timeout`
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = Some(timeout);
        self
    }

    /// Let queued invocations wait for as long as it takes
    pub fn no_timeout(mut self) -> Self {
        self.config.acquire_timeout = None;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Bulkhead
//==============================================================================

/// Point-in-time view of a bulkhead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadSnapshot {
    /// Invocations currently holding a slot
    pub in_flight: usize,
    /// Invocations waiting for a slot
    pub queued: usize,
    /// Invocations rejected since creation
    pub rejected: u64,
}

/// Limits concurrent invocations of the work passed through it
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<BulkheadInner>,
}

struct BulkheadInner {
    config: BulkheadConfig,
    scheduler: Scheduler,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
    rejected: AtomicU64,
}

enum Admission {
    Running(OwnedSemaphorePermit),
    Queued(QueuePlace),
}

/// Place in the wait queue, given back on drop
struct QueuePlace {
    inner: Arc<BulkheadInner>,
}

impl Drop for QueuePlace {
    fn drop(&mut self) {
        self.inner.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    /// Create a bulkhead whose queue timers run on the shared scheduler
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        Self::with_scheduler(config, Scheduler::global()?)
    }

    pub fn with_scheduler(config: BulkheadConfig, scheduler: Scheduler) -> ConfigResult<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self {
            inner: Arc::new(BulkheadInner {
                config,
                scheduler,
                permits,
                queued: AtomicUsize::new(0),
                rejected: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> BulkheadSnapshot {
        let inner = &self.inner;
        BulkheadSnapshot {
            in_flight: inner.config.max_concurrent.saturating_sub(inner.permits.available_permits()),
            queued: inner.queued.load(Ordering::Acquire),
            rejected: inner.rejected.load(Ordering::Acquire),
        }
    }

    /// Run async work once it holds a slot
    ///
    /// `work` is called after admission, so rejected work never starts. The
    /// slot is released when the work's future completes or is dropped.
    #[instrument(skip(self, work), fields(bulkhead = %self.inner.config.name))]
    pub fn invoke<F, Fut, T, E>(&self, work: F) -> ResultHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError>,
    {
        let admission = match self.inner.admit() {
            Ok(admission) => admission,
            Err(error) => return ResultHandle::ready(Err(error)),
        };
        let inner = Arc::clone(&self.inner);
        ResultHandle::from_future(async move {
            let _permit = match admission {
                Admission::Running(permit) => permit,
                Admission::Queued(place) => inner.wait_for_slot(place).await?,
            };
            work().await.map_err(Into::<FtError>::into)
        })
    }
}

impl BulkheadInner {
    fn admit(self: &Arc<Self>) -> FtResult<Admission> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(Admission::Running(permit));
        }

        let max_queue = self.config.max_queue;
        let joined = self.queued.fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
            (waiting < max_queue).then_some(waiting + 1)
        });
        match joined {
            Ok(ahead) => {
                debug!(ahead, "all slots busy, call queued");
                Ok(Admission::Queued(QueuePlace { inner: Arc::clone(self) }))
            }
            Err(_) => Err(self.reject(format!(
                "bulkhead full: {} running, {} queued",
                self.config.max_concurrent, max_queue
            ))),
        }
    }

    async fn wait_for_slot(&self, place: QueuePlace) -> FtResult<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let acquired = match self.config.acquire_timeout {
            None => acquire.await,
            Some(timeout) => {
                match future::select(Box::pin(acquire), self.scheduler.delay(timeout)).await {
                    Either::Left((acquired, _)) => acquired,
                    Either::Right(((), _)) => {
                        drop(place);
                        return Err(self.reject(format!("no bulkhead slot within {timeout:?}")));
                    }
                }
            }
        };
        drop(place);
        acquired.map_err(|_| self.reject("bulkhead closed".to_string()))
    }

    fn reject(&self, reason: String) -> FtError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(bulkhead = %self.config.name, %reason, "call rejected");
        FtError::rejected(reason)
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.inner.config.name)
            .field("max_concurrent", &self.inner.config.max_concurrent)
            .field("max_queue", &self.inner.config.max_queue)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use tokio::sync::Notify;

    use super::*;

    fn bulkhead(max_concurrent: usize, max_queue: usize) -> BulkheadConfigBuilder {
        BulkheadConfig::builder().max_concurrent(max_concurrent).max_queue(max_queue)
    }

    fn build(config: BulkheadConfigBuilder) -> Bulkhead {
        Bulkhead::with_scheduler(config.build().unwrap(), Scheduler::current().unwrap()).unwrap()
    }

    /// Work that waits for `gate` before succeeding
    fn gated(gate: Arc<Notify>) -> impl FnOnce() -> BoxFuture<'static, FtResult<()>> {
        move || {
            async move {
                gate.notified().await;
                Ok(())
            }
            .boxed()
        }
    }

    /// Validates `BulkheadConfigBuilder::build` behavior for the invalid
    /// values scenario.
    ///
    /// Assertions:
    /// - Ensures a zero concurrency limit is rejected.
    /// - Ensures a zero acquire timeout is rejected.
    /// - Confirms the defaults are valid.
    #[test]
    fn test_config_validation() {
        assert!(BulkheadConfig::builder().max_concurrent(0).build().is_err());
        assert!(BulkheadConfig::builder().acquire_timeout(Duration::ZERO).build().is_err());
        assert!(BulkheadConfig::default().validate().is_ok());
        assert_eq!(BulkheadConfig::default().acquire_timeout, None);
    }

    /// Validates `Bulkhead::invoke` behavior for the free slot scenario.
    ///
    /// Assertions:
    /// - Confirms the work's value and error pass through.
    /// - Confirms the slot is released afterwards.
    #[tokio::test]
    async fn test_runs_within_limit() {
        let bulkhead = build(bulkhead(2, 0));

        assert_eq!(bulkhead.invoke(|| async { Ok::<_, FtError>(5) }).await.unwrap(), 5);
        let error = bulkhead.invoke(|| async { Err::<(), _>(FtError::from("boom")) }).await;
        assert_eq!(error.unwrap_err().to_string(), "boom");

        assert_eq!(bulkhead.snapshot(), BulkheadSnapshot { in_flight: 0, queued: 0, rejected: 0 });
    }

    /// Validates `Bulkhead::invoke` behavior for the full bulkhead scenario.
    ///
    /// Assertions:
    /// - Ensures a call beyond the limit with no queue is rejected at once.
    /// - Ensures the rejected work never runs.
    /// - Confirms a slot is available again after the running call ends.
    #[tokio::test]
    async fn test_full_bulkhead_rejects() {
        let bulkhead = build(bulkhead(1, 0));
        let gate = Arc::new(Notify::new());
        let running = bulkhead.invoke(gated(Arc::clone(&gate)));

        let ran = Arc::new(AtomicUsize::new(0));
        let marker = Arc::clone(&ran);
        let rejected = bulkhead.invoke(move || {
            marker.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, FtError>(()) }
        });
        match rejected.await {
            Err(FtError::Rejected { reason }) => assert!(reason.contains("full")),
            other => panic!("Expected Rejected, got {other:?}"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(bulkhead.snapshot().in_flight, 1);
        assert_eq!(bulkhead.snapshot().rejected, 1);

        gate.notify_one();
        running.await.unwrap();
        bulkhead.invoke(|| async { Ok::<_, FtError>(()) }).await.unwrap();
    }

    /// Validates `Bulkhead::invoke` behavior for the queued call scenario.
    ///
    /// Assertions:
    /// - Confirms a call beyond the limit waits in the queue.
    /// - Ensures a call beyond the queue is rejected.
    /// - Confirms the queued call runs once the slot frees.
    #[tokio::test]
    async fn test_queued_call_runs_after_slot_frees() {
        let bulkhead = build(bulkhead(1, 1));
        let gate = Arc::new(Notify::new());
        let running = tokio::spawn(bulkhead.invoke(gated(Arc::clone(&gate))));

        let queued = bulkhead.invoke(|| async { Ok::<_, FtError>("queued") });
        assert_eq!(bulkhead.snapshot().queued, 1);

        let overflow = bulkhead.invoke(|| async { Ok::<_, FtError>("overflow") }).await;
        assert!(matches!(overflow, Err(FtError::Rejected { .. })));

        gate.notify_one();
        assert_eq!(queued.await.unwrap(), "queued");
        running.await.unwrap().unwrap();
        assert_eq!(bulkhead.snapshot(), BulkheadSnapshot { in_flight: 0, queued: 0, rejected: 1 });
    }

    /// Validates `BulkheadConfig::acquire_timeout` behavior for the slow
    /// slot scenario.
    ///
    /// Assertions:
    /// - Ensures a queued call is rejected once the wait exceeds the timeout.
    /// - Confirms it gives its queue place back.
    #[tokio::test]
    async fn test_acquire_timeout_rejects() {
        let bulkhead = build(bulkhead(1, 1).acquire_timeout(Duration::from_millis(20)));
        let gate = Arc::new(Notify::new());
        let running = bulkhead.invoke(gated(Arc::clone(&gate)));

        match bulkhead.invoke(|| async { Ok::<_, FtError>(()) }).await {
            Err(FtError::Rejected { reason }) => assert!(reason.contains("within")),
            other => panic!("Expected Rejected, got {other:?}"),
        }
        assert_eq!(bulkhead.snapshot().queued, 0);

        gate.notify_one();
        running.await.unwrap();
    }

    /// Validates `Bulkhead::invoke` behavior for the dropped queued handle
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms dropping an unpolled queued handle frees its queue place.
    #[tokio::test]
    async fn test_dropped_queued_handle_leaves_queue() {
        let bulkhead = build(bulkhead(1, 1));
        let _running = bulkhead.invoke(gated(Arc::new(Notify::new())));

        let queued = bulkhead.invoke(|| async { Ok::<_, FtError>(()) });
        assert_eq!(bulkhead.snapshot().queued, 1);
        drop(queued);
        assert_eq!(bulkhead.snapshot().queued, 0);
    }

    /// Validates `Bulkhead::invoke` behavior for the concurrent callers
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures no more than `max_concurrent` calls ever run together.
    /// - Confirms every queued call eventually completes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_limit() {
        let bulkhead = build(bulkhead(2, 16));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(bulkhead.invoke(move || async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, FtError>(())
            })));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(bulkhead.snapshot().rejected, 0);
    }
}
