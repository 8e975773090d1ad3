//! Async executor
//!
//! Dispatches work onto a [`WorkerPool`] and hands back a [`ResultHandle`].
//! The pool is resolved lazily on first use, either from the configured
//! supplier or the process-wide default.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, FtError};
use crate::executor::WorkerPool;
use crate::handle::ResultHandle;

/// Supplies the worker pool an executor submits to
pub type PoolSupplier = Arc<dyn Fn() -> ConfigResult<WorkerPool> + Send + Sync>;

/// Configuration for [`AsyncExecutor`]
#[derive(Clone)]
pub struct AsyncConfig {
    pub name: String,
    /// Pool supplier; `None` uses [`WorkerPool::global`]
    pub executor: Option<PoolSupplier>,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self { name: "async".to_string(), executor: None }
    }
}

impl fmt::Debug for AsyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncConfig")
            .field("name", &self.name)
            .field("executor", &self.executor.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl AsyncConfig {
    pub fn builder() -> AsyncConfigBuilder {
        AsyncConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct AsyncConfigBuilder {
    config: AsyncConfig,
}

impl AsyncConfigBuilder {
    /// Set the executor name used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Resolve the pool through `supplier` on first use
    pub fn executor<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> ConfigResult<WorkerPool> + Send + Sync + 'static,
    {
        self.config.executor = Some(Arc::new(supplier));
        self
    }

    /// Always submit to `pool`
    pub fn pool(self, pool: WorkerPool) -> Self {
        self.executor(move || Ok(pool.clone()))
    }

    /// Validate and build the configuration
    pub fn build(self) -> ConfigResult<AsyncConfig> {
        Ok(self.config)
    }
}

/// Runs work on a worker pool
#[derive(Clone)]
pub struct AsyncExecutor {
    name: Arc<str>,
    pool: Arc<OnceCell<WorkerPool>>,
    supplier: PoolSupplier,
}

impl fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("name", &self.name)
            .field("pool", &self.pool.get())
            .finish_non_exhaustive()
    }
}

impl AsyncExecutor {
    pub fn new(config: AsyncConfig) -> Self {
        let supplier: PoolSupplier = match config.executor {
            Some(supplier) => supplier,
            None => Arc::new(WorkerPool::global),
        };
        Self { name: config.name.into(), pool: Arc::new(OnceCell::new()), supplier }
    }

    /// Executor on the process-wide default pool
    pub fn global() -> Self {
        Self::new(AsyncConfig::default())
    }

    pub fn with_pool(pool: WorkerPool) -> Self {
        let cell = OnceCell::new();
        let _set = cell.set(pool.clone());
        Self {
            name: "async".into(),
            pool: Arc::new(cell),
            supplier: Arc::new(move || Ok::<_, ConfigError>(pool.clone())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pool(&self) -> Result<&WorkerPool, FtError> {
        self.pool.get_or_try_init(|| (self.supplier)()).map_err(|error| {
            warn!(executor = %self.name, %error, "worker pool unavailable");
            FtError::rejected(format!("worker pool unavailable: {error}"))
        })
    }

    /// Submit async work to the pool
    ///
    /// Never fails directly: rejection is reported through the handle as
    /// [`FtError::Rejected`].
    #[instrument(skip(self, work), fields(executor = %self.name))]
    pub fn invoke<F, Fut, T, E>(&self, work: F) -> ResultHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError>,
    {
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(error) => return ResultHandle::ready(Err(error)),
        };
        debug!(in_flight = pool.in_flight(), "dispatching work");
        pool.submit(async move { work().await.map_err(Into::<FtError>::into) })
    }

    /// Submit a blocking closure to the pool's blocking threads
    #[instrument(skip(self, work), fields(executor = %self.name))]
    pub fn invoke_blocking<F, T, E>(&self, work: F) -> ResultHandle<T>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError>,
    {
        match self.pool() {
            Ok(pool) => pool.submit_blocking(move || work().map_err(Into::<FtError>::into)),
            Err(error) => ResultHandle::ready(Err(error)),
        }
    }
}
