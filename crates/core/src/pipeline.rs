//! Handler pipeline
//!
//! Composes the fault-tolerance handlers around one unit of work:
//!
//! ```rust,ignore
//! let pipeline = FaultTolerance::builder()
//!     .add_timeout(timeout)   // innermost: bounds each attempt
//!     .add_breaker(breaker)   // records every attempt
//!     .add_retry(retry)       // outermost: re-runs the whole stack below
//!     .build();
//! let value = pipeline.invoke(|| fetch()).await?;
//! ```
//!
//! Handlers wrap in the order they are added, so the first one added sits
//! closest to the work. A pipeline produces one result type, which lets a
//! typed [`Fallback`] sit among the other stages.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::async_executor::AsyncExecutor;
use crate::breaker::CircuitBreaker;
use crate::bulkhead::Bulkhead;
use crate::error::{FtError, FtResult};
use crate::fallback::Fallback;
use crate::handle::ResultHandle;
use crate::retry::RetryEngine;
use crate::timeout::TimeoutGuard;

/// Work that can be started any number of times
type SharedWork<T> = Arc<dyn Fn() -> BoxFuture<'static, FtResult<T>> + Send + Sync>;

/// One stage of a [`Pipeline`] producing `T`
pub enum Handler<T> {
    Breaker(CircuitBreaker),
    Retry(RetryEngine),
    Timeout(TimeoutGuard),
    Async(AsyncExecutor),
    Bulkhead(Bulkhead),
    Fallback(Fallback<T>),
}

impl<T> Handler<T> {
    fn label(&self) -> &'static str {
        match self {
            Self::Breaker(_) => "breaker",
            Self::Retry(_) => "retry",
            Self::Timeout(_) => "timeout",
            Self::Async(_) => "async",
            Self::Bulkhead(_) => "bulkhead",
            Self::Fallback(_) => "fallback",
        }
    }
}

impl<T: Send + 'static> Handler<T> {
    fn wrap(&self, inner: SharedWork<T>) -> SharedWork<T> {
        match self.clone() {
            Self::Breaker(breaker) => Arc::new(move || {
                let inner = Arc::clone(&inner);
                breaker.invoke(move || (*inner)()).boxed()
            }),
            Self::Retry(retry) => Arc::new(move || {
                let inner = Arc::clone(&inner);
                retry.invoke(move || (*inner)()).boxed()
            }),
            Self::Timeout(guard) => Arc::new(move || {
                let inner = Arc::clone(&inner);
                guard.invoke(move || (*inner)()).boxed()
            }),
            Self::Async(executor) => Arc::new(move || {
                let inner = Arc::clone(&inner);
                executor.invoke(move || (*inner)()).boxed()
            }),
            Self::Bulkhead(bulkhead) => Arc::new(move || {
                let inner = Arc::clone(&inner);
                bulkhead.invoke(move || (*inner)()).boxed()
            }),
            Self::Fallback(fallback) => Arc::new(move || {
                let inner = Arc::clone(&inner);
                fallback.invoke(move || (*inner)()).boxed()
            }),
        }
    }
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Breaker(breaker) => Self::Breaker(breaker.clone()),
            Self::Retry(retry) => Self::Retry(retry.clone()),
            Self::Timeout(guard) => Self::Timeout(guard.clone()),
            Self::Async(executor) => Self::Async(executor.clone()),
            Self::Bulkhead(bulkhead) => Self::Bulkhead(bulkhead.clone()),
            Self::Fallback(fallback) => Self::Fallback(fallback.clone()),
        }
    }
}

impl<T> fmt::Debug for Handler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Breaker(breaker) => f.debug_tuple("Breaker").field(breaker).finish(),
            Self::Retry(retry) => f.debug_tuple("Retry").field(retry).finish(),
            Self::Timeout(guard) => f.debug_tuple("Timeout").field(guard).finish(),
            Self::Async(executor) => f.debug_tuple("Async").field(executor).finish(),
            Self::Bulkhead(bulkhead) => f.debug_tuple("Bulkhead").field(bulkhead).finish(),
            Self::Fallback(fallback) => f.debug_tuple("Fallback").field(fallback).finish(),
        }
    }
}

impl<T> From<CircuitBreaker> for Handler<T> {
    fn from(breaker: CircuitBreaker) -> Self {
        Self::Breaker(breaker)
    }
}

impl<T> From<RetryEngine> for Handler<T> {
    fn from(retry: RetryEngine) -> Self {
        Self::Retry(retry)
    }
}

impl<T> From<TimeoutGuard> for Handler<T> {
    fn from(guard: TimeoutGuard) -> Self {
        Self::Timeout(guard)
    }
}

impl<T> From<AsyncExecutor> for Handler<T> {
    fn from(executor: AsyncExecutor) -> Self {
        Self::Async(executor)
    }
}

impl<T> From<Bulkhead> for Handler<T> {
    fn from(bulkhead: Bulkhead) -> Self {
        Self::Bulkhead(bulkhead)
    }
}

impl<T> From<Fallback<T>> for Handler<T> {
    fn from(fallback: Fallback<T>) -> Self {
        Self::Fallback(fallback)
    }
}

/// Entry point for building a [`Pipeline`]
#[derive(Debug, Clone, Copy)]
pub struct FaultTolerance;

impl FaultTolerance {
    /// Start an empty pipeline producing `T`
    pub fn builder<T: Send + 'static>() -> PipelineBuilder<T> {
        PipelineBuilder { handlers: Vec::new() }
    }
}

#[derive(Debug)]
pub struct PipelineBuilder<T> {
    handlers: Vec<Handler<T>>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Add a handler outside the ones already added
    pub fn add(mut self, handler: impl Into<Handler<T>>) -> Self {
        self.handlers.push(handler.into());
        self
    }

    /// Add a circuit breaker stage
    pub fn add_breaker(self, breaker: CircuitBreaker) -> Self {
        self.add(breaker)
    }

    /// Add a retry stage
    pub fn add_retry(self, retry: RetryEngine) -> Self {
        self.add(retry)
    }

    /// Add a timeout stage
    pub fn add_timeout(self, guard: TimeoutGuard) -> Self {
        self.add(guard)
    }

    /// Add a stage that hands the work to a worker pool
    pub fn add_async(self, executor: AsyncExecutor) -> Self {
        self.add(executor)
    }

    /// Add a stage that limits concurrent invocations
    pub fn add_bulkhead(self, bulkhead: Bulkhead) -> Self {
        self.add(bulkhead)
    }

    /// Add a stage that replaces eligible failures
    pub fn add_fallback(self, fallback: Fallback<T>) -> Self {
        self.add(fallback)
    }

    /// Freeze the stages into a pipeline
    pub fn build(self) -> Pipeline<T> {
        Pipeline { handlers: self.handlers.into() }
    }
}

/// Ordered stack of handlers applied to each invocation
pub struct Pipeline<T> {
    handlers: Arc<[Handler<T>]>,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self { handlers: Arc::clone(&self.handlers) }
    }
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<_> = self.handlers.iter().map(Handler::label).collect();
        f.debug_struct("Pipeline").field("stages", &stages).finish()
    }
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn handlers(&self) -> &[Handler<T>] {
        &self.handlers
    }

    /// Run `work` through every handler
    ///
    /// `work` may be called more than once when a retry handler is present.
    pub fn invoke<F, Fut, E>(&self, work: F) -> ResultHandle<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FtError>,
    {
        let base: SharedWork<T> =
            Arc::new(move || work().map(|result| result.map_err(Into::<FtError>::into)).boxed());
        let composed = self.handlers.iter().fold(base, |inner, handler| handler.wrap(inner));
        debug!(stages = self.handlers.len(), "invoking pipeline");
        ResultHandle::from_future((*composed)())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoff::FixedDelay;
    use crate::breaker::{CircuitBreakerConfig, CircuitState};
    use crate::bulkhead::BulkheadConfig;
    use crate::error::ErrorKind;
    use crate::executor::{Scheduler, WorkerPool};
    use crate::retry::RetryConfig;
    use crate::testing::CallCounter;
    use crate::timeout::TimeoutConfig;

    fn retry(calls: u32) -> RetryEngine {
        let config = RetryConfig::builder()
            .policy(FixedDelay::new(calls, Duration::from_millis(1)))
            .overall_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        RetryEngine::with_scheduler(config, Scheduler::current().unwrap()).unwrap()
    }

    /// Validates `Pipeline::invoke` behavior for the empty pipeline scenario.
    ///
    /// Assertions:
    /// - Confirms work runs once and its value passes through.
    #[tokio::test]
    async fn test_empty_pipeline_passes_through() {
        let counter = CallCounter::new();
        let hits = counter.clone();
        let pipeline = FaultTolerance::builder().build();

        let result = pipeline
            .invoke(move || {
                hits.hit();
                async { Ok::<_, FtError>("plain") }
            })
            .await;

        assert_eq!(result.unwrap(), "plain");
        assert_eq!(counter.count(), 1);
        assert!(pipeline.handlers().is_empty());
    }

    /// Validates `Pipeline::invoke` behavior for the retry around breaker
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms every attempt passes through the breaker window.
    /// - Confirms the retry recovers from two failures.
    #[tokio::test]
    async fn test_retry_wraps_breaker() {
        let breaker = CircuitBreaker::with_scheduler(
            CircuitBreakerConfig::default(),
            Scheduler::current().unwrap(),
        )
        .unwrap();
        let retry = retry(3);
        let pipeline =
            FaultTolerance::builder().add_breaker(breaker.clone()).add_retry(retry.clone()).build();

        let counter = CallCounter::new();
        let hits = counter.clone();
        let result = pipeline
            .invoke(move || {
                let call = hits.hit();
                async move {
                    if call < 2 {
                        Err(FtError::from("flaky"))
                    } else {
                        Ok(call)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(retry.retry_counter(), 2);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.window_len, 3);
        assert_eq!(snapshot.window_failures, 2);
    }

    /// Validates `Pipeline::invoke` behavior for the per-attempt timeout
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms each attempt is bounded and the final error classifies as a
    ///   timeout.
    #[tokio::test]
    async fn test_timeout_inside_retry() {
        let config = TimeoutConfig::builder().timeout(Duration::from_millis(20)).build().unwrap();
        let guard = TimeoutGuard::with_scheduler(config, Scheduler::current().unwrap()).unwrap();
        let pipeline = FaultTolerance::builder().add_timeout(guard).add_retry(retry(3)).build();

        let counter = CallCounter::new();
        let hits = counter.clone();
        let result = pipeline
            .invoke(move || {
                hits.hit();
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, FtError>(())
                }
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(error.suppressed().len(), 2);
        assert_eq!(counter.count(), 3);
    }

    /// Validates `Pipeline::invoke` behavior for the open breaker scenario.
    ///
    /// Assertions:
    /// - Ensures a retry that skips circuit-open errors stops once the
    ///   breaker opens.
    #[tokio::test]
    async fn test_open_breaker_stops_retry() {
        let breaker = CircuitBreaker::with_scheduler(
            CircuitBreakerConfig::builder()
                .volume(1)
                .ratio(100)
                .delay(Duration::from_secs(30))
                .build()
                .unwrap(),
            Scheduler::current().unwrap(),
        )
        .unwrap();
        let retry = RetryEngine::with_scheduler(
            RetryConfig::builder()
                .fixed_delay(5, Duration::from_millis(1))
                .skip_on_kind(ErrorKind::CircuitOpen)
                .build()
                .unwrap(),
            Scheduler::current().unwrap(),
        )
        .unwrap();
        let pipeline = FaultTolerance::builder().add_breaker(breaker.clone()).add_retry(retry).build();

        let counter = CallCounter::new();
        let hits = counter.clone();
        let result = pipeline
            .invoke(move || {
                hits.hit();
                async { Err::<(), _>(FtError::from("down")) }
            })
            .await;

        let error = result.unwrap_err();
        assert!(error.is_circuit_open());
        assert_eq!(error.suppressed().len(), 1);
        assert_eq!(counter.count(), 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    /// Validates `Pipeline::invoke` behavior for the async outermost
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms work dispatched through the executor completes.
    #[tokio::test]
    async fn test_async_outermost() {
        let executor = AsyncExecutor::with_pool(WorkerPool::current().unwrap());
        let pipeline = FaultTolerance::builder().add_retry(retry(1)).add_async(executor).build();

        let result = pipeline.invoke(|| async { Ok::<_, FtError>(7_u8) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(format!("{pipeline:?}"), r#"Pipeline { stages: ["retry", "async"] }"#);
    }

    /// Validates `Pipeline::invoke` behavior for the fallback around retry
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms the fallback sees the retry's final error.
    /// - Confirms its value replaces the failure after every call was made.
    #[tokio::test]
    async fn test_fallback_after_exhausted_retry() {
        let fallback = Fallback::new(|error: FtError| async move {
            Ok(format!("default after {} suppressed", error.suppressed().len()))
        });
        let pipeline = FaultTolerance::builder().add_retry(retry(3)).add_fallback(fallback).build();

        let counter = CallCounter::new();
        let hits = counter.clone();
        let result = pipeline
            .invoke(move || {
                hits.hit();
                async { Err::<String, _>(FtError::from("unavailable")) }
            })
            .await;

        assert_eq!(result.unwrap(), "default after 2 suppressed");
        assert_eq!(counter.count(), 3);
        assert_eq!(format!("{pipeline:?}"), r#"Pipeline { stages: ["retry", "fallback"] }"#);
    }

    /// Validates `Pipeline::invoke` behavior for the fallback on open circuit
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms an open breaker's rejection is replaced by the fallback.
    /// - Ensures work failures outside the apply list pass through.
    #[tokio::test]
    async fn test_fallback_applies_to_open_circuit_only() {
        let breaker = CircuitBreaker::with_scheduler(
            CircuitBreakerConfig::default(),
            Scheduler::current().unwrap(),
        )
        .unwrap();
        let fallback = Fallback::builder(|_error| async { Ok("cached") })
            .apply_on_kind(ErrorKind::CircuitOpen)
            .build();
        let pipeline =
            FaultTolerance::builder().add_breaker(breaker.clone()).add_fallback(fallback).build();

        let error = pipeline.invoke(|| async { Err::<&str, _>(FtError::from("bad request")) }).await;
        assert_eq!(error.unwrap_err().to_string(), "bad request");

        breaker.set_state(CircuitState::Open);
        let counter = CallCounter::new();
        let hits = counter.clone();
        let value = pipeline
            .invoke(move || {
                hits.hit();
                async { Ok::<_, FtError>("live") }
            })
            .await;

        assert_eq!(value.unwrap(), "cached");
        assert_eq!(counter.count(), 0);
    }

    /// Validates `Pipeline::invoke` behavior for the saturated bulkhead
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures work is not started while the bulkhead is full.
    /// - Confirms a fallback on rejections answers instead.
    #[tokio::test]
    async fn test_full_bulkhead_in_pipeline() {
        let bulkhead = Bulkhead::with_scheduler(
            BulkheadConfig::builder().max_concurrent(1).max_queue(0).build().unwrap(),
            Scheduler::current().unwrap(),
        )
        .unwrap();
        let fallback = Fallback::builder(|_error| async { Ok("busy") })
            .apply_on_kind(ErrorKind::Rejected)
            .build();
        let pipeline =
            FaultTolerance::builder().add_bulkhead(bulkhead.clone()).add_fallback(fallback).build();

        let holder = bulkhead.invoke(|| async { Ok::<_, FtError>(()) });
        let counter = CallCounter::new();
        let hits = counter.clone();
        let value = pipeline
            .invoke(move || {
                hits.hit();
                async { Ok::<_, FtError>("served") }
            })
            .await;

        assert_eq!(value.unwrap(), "busy");
        assert_eq!(counter.count(), 0);
        assert_eq!(bulkhead.snapshot().rejected, 1);

        holder.await.unwrap();
        assert_eq!(pipeline.invoke(|| async { Ok::<_, FtError>("served") }).await.unwrap(), "served");
        assert_eq!(format!("{pipeline:?}"), r#"Pipeline { stages: ["bulkhead", "fallback"] }"#);
    }
}
