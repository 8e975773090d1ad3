//! Shared execution facilities
//!
//! Two separate services back every handler:
//!
//! - [`Scheduler`]: a timer service that runs callbacks after a delay
//!   (retry backoff, breaker reopen timers, timeout deadlines).
//! - [`WorkerPool`]: a bounded pool that runs submitted work for the
//!   [`AsyncExecutor`](crate::async_executor::AsyncExecutor).
//!
//! Both offer a lazily created, process-wide default backed by a dedicated
//! tokio runtime, and both can be built from a caller-owned runtime handle
//! instead.

pub mod pool;
pub mod scheduler;

pub use pool::WorkerPool;
pub use scheduler::{Delay, Scheduler, TimerGuard, TimerHandle};
