//! Bounded worker pool for the async executor
//!
//! Admission is a `tokio::sync::Semaphore`: every submitted task holds one
//! permit until it finishes. When no permit is free the task is rejected
//! instead of queued, so a saturated pool pushes back on callers right away.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use once_cell::sync::OnceCell;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult, FtError, FtResult};
use crate::handle::ResultHandle;

/// Default bound on tasks in flight in a single pool
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

static WORKER_RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Runs submitted work on a tokio runtime, bounded by a permit count
#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_in_flight", &self.max_in_flight)
            .field("in_flight", &self.in_flight())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl WorkerPool {
    /// Process-wide pool, created on first use
    pub fn global() -> ConfigResult<Self> {
        let runtime = WORKER_RUNTIME
            .get_or_try_init(|| {
                info!("starting shared worker runtime");
                Builder::new_multi_thread().thread_name("faultline-worker").enable_all().build()
            })
            .map_err(|source| ConfigError::Runtime { component: "worker pool", source })?;
        Ok(Self::from_handle(runtime.handle().clone()))
    }

    /// Pool running on a caller-owned runtime
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Pool on the runtime driving the current task, if any
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::from_handle)
    }

    /// Replace the in-flight bound; the pool gets a fresh permit set
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> ConfigResult<Self> {
        if max_in_flight == 0 || max_in_flight > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(format!(
                "max_in_flight must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        self.permits = Arc::new(Semaphore::new(max_in_flight));
        self.max_in_flight = max_in_flight;
        Ok(self)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Number of submitted tasks that have not finished yet
    pub fn in_flight(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.max_in_flight.saturating_sub(self.permits.available_permits())
    }

    /// Stop accepting work; tasks already running finish normally
    pub fn shutdown(&self) {
        if !self.permits.is_closed() {
            info!(in_flight = self.in_flight(), "worker pool shutting down");
        }
        self.permits.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }

    fn try_acquire(&self) -> FtResult<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().map_err(|error| match error {
            TryAcquireError::Closed => FtError::rejected("worker pool is shut down"),
            TryAcquireError::NoPermits => {
                warn!(max_in_flight = self.max_in_flight, "worker pool saturated");
                FtError::rejected(format!(
                    "worker pool saturated: {} tasks in flight",
                    self.max_in_flight
                ))
            }
        })
    }

    /// Run `future` on the pool
    ///
    /// Rejection and panics are reported through the handle.
    pub fn submit<Fut, T>(&self, future: Fut) -> ResultHandle<T>
    where
        Fut: Future<Output = FtResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(error) => return ResultHandle::ready(Err(error)),
        };
        let (completer, handle) = ResultHandle::channel();
        self.handle.spawn(async move {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(FtError::from_panic(payload)));
            // Free the slot before the caller can observe completion
            drop(permit);
            completer.complete(result);
        });
        debug!("task submitted to worker pool");
        handle
    }

    /// Run a blocking closure on the pool's blocking threads
    pub fn submit_blocking<F, T>(&self, work: F) -> ResultHandle<T>
    where
        F: FnOnce() -> FtResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(error) => return ResultHandle::ready(Err(error)),
        };
        let (completer, handle) = ResultHandle::channel();
        self.handle.spawn_blocking(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|payload| Err(FtError::from_panic(payload)));
            drop(permit);
            completer.complete(result);
        });
        debug!("blocking task submitted to worker pool");
        handle
    }
}
