//! Fault-tolerance handlers for async and blocking Rust services.
//!
//! `faultline-core` wraps caller-supplied work (futures, streams or plain
//! closures) with one of four handlers:
//!
//! - [`breaker::CircuitBreaker`]: stops calling a failing dependency once the
//!   recent failure ratio crosses a threshold, then tries it again after a
//!   delay.
//! - [`retry::RetryEngine`]: re-runs failed work according to a
//!   [`backoff::BackoffPolicy`] bounded by an overall timeout.
//! - [`timeout::TimeoutGuard`]: fails work that does not complete in time.
//! - [`async_executor::AsyncExecutor`]: moves work onto a worker pool.
//!
//! Two more stages are meant for composition through
//! [`pipeline::FaultTolerance`]: [`bulkhead::Bulkhead`] caps concurrent
//! invocations and [`fallback::Fallback`] replaces eligible failures.
//!
//! # Feature Tiers
//!
//! - `foundation`: errors, error classification, result windows, backoff math
//! - `runtime` (default): the handlers, the shared scheduler and worker pool
//! - `serde`: (de)serialization for plain configuration types
//! - `test-utils`: helpers for tests of code built on top of the handlers

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Testing utilities (macro scope: keep first)
// --------------------------------------------------------------------
#[cfg(any(feature = "runtime", feature = "test-utils", test))]
#[macro_use]
pub mod testing;

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod backoff;
#[cfg(feature = "foundation")]
pub mod classify;
#[cfg(feature = "foundation")]
pub mod clock;
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod window;

#[cfg(feature = "serde")]
pub mod serde_util;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod async_executor;
#[cfg(feature = "runtime")]
pub mod breaker;
#[cfg(feature = "runtime")]
pub mod bulkhead;
#[cfg(feature = "runtime")]
pub mod executor;
#[cfg(feature = "runtime")]
pub mod fallback;
#[cfg(feature = "runtime")]
pub mod handle;
#[cfg(feature = "runtime")]
pub mod pipeline;
#[cfg(feature = "runtime")]
pub mod retry;
#[cfg(feature = "runtime")]
pub mod task;
#[cfg(feature = "runtime")]
pub mod timeout;

// Re-exports
// --------------------------------------------------------------------
#[cfg(feature = "foundation")]
pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedDelay, Jitter, JitterPolicy};
#[cfg(feature = "foundation")]
pub use classify::{ErrorChecker, ErrorMatcher};
#[cfg(feature = "foundation")]
pub use clock::{Clock, MockClock, SystemClock};
#[cfg(feature = "foundation")]
pub use error::{BoxedError, ConfigError, ConfigResult, ErrorKind, FtError, FtResult};
#[cfg(feature = "foundation")]
pub use window::{Outcome, ResultWindow};

#[cfg(feature = "runtime")]
pub use async_executor::{AsyncConfig, AsyncExecutor};
#[cfg(feature = "runtime")]
pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
#[cfg(feature = "runtime")]
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadSnapshot};
#[cfg(feature = "runtime")]
pub use executor::{Scheduler, TimerHandle, WorkerPool};
#[cfg(feature = "runtime")]
pub use fallback::Fallback;
#[cfg(feature = "runtime")]
pub use handle::{Completer, ResultHandle, StreamHandle};
#[cfg(feature = "runtime")]
pub use pipeline::{FaultTolerance, Handler, Pipeline, PipelineBuilder};
#[cfg(feature = "runtime")]
pub use retry::{RetryConfig, RetryEngine};
#[cfg(feature = "runtime")]
pub use task::{DataFlag, DelayedTask};
#[cfg(feature = "runtime")]
pub use timeout::{Interrupted, Interruption, TimeoutConfig, TimeoutGuard};
