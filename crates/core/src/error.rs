//! Error types shared by every fault-tolerance handler
//!
//! All handlers report failures through [`FtError`]. Work supplied by callers
//! may fail with any error type convertible into `FtError`; arbitrary errors
//! are boxed into [`FtError::Failed`] and stay reachable through
//! [`FtError::downcast_ref`].
//!
//! Configuration builders report problems through [`ConfigError`].

use std::any::Any;
use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

/// Boxed error type carried by [`FtError::Failed`]
pub type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type for fault-tolerant operations
pub type FtResult<T> = Result<T, FtError>;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

//==============================================================================
// Configuration Errors
//==============================================================================

/// Errors raised while validating configuration or starting shared runtimes
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// A shared runtime (scheduler or worker pool) failed to start
    #[error("Failed to start {component}: {source}")]
    Runtime {
        component: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

//==============================================================================
// Handler Errors
//==============================================================================

/// Coarse classification of an [`FtError`], used by error matchers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CircuitOpen,
    Timeout,
    RetryTimeout,
    Rejected,
    Failed,
    Cancelled,
    Panicked,
    Unsupported,
}

/// Errors produced by fault-tolerance handlers
#[derive(Debug, Error)]
pub enum FtError {
    /// Circuit breaker is open, rejecting calls
    #[error("Circuit breaker is open, rejecting calls")]
    CircuitOpen,

    /// Circuit breaker is half-open and another trial call holds the slot
    #[error("Circuit breaker is half-open and a trial call is already in progress")]
    TrialInProgress,

    /// Operation did not complete within its deadline
    #[error("Operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Retrying stopped because the overall timeout elapsed
    #[error("Retries exhausted the overall timeout: {elapsed:?} elapsed, limit {limit:?}")]
    RetryTimeout {
        elapsed: Duration,
        limit: Duration,
        #[source]
        source: Box<FtError>,
    },

    /// Worker pool or bulkhead refused the task
    #[error("Task rejected: {reason}")]
    Rejected { reason: String },

    /// The supplied work failed
    #[error(transparent)]
    Failed(BoxedError),

    /// Last failure of a retried operation, carrying the earlier failures
    #[error("{last} ({} earlier failures suppressed)", .suppressed.len())]
    Suppressing { last: Box<FtError>, suppressed: Vec<FtError> },

    /// The task producing the result went away without completing it
    #[error("Task was cancelled before producing a result")]
    Cancelled,

    /// The supplied work panicked
    #[error("Task panicked: {message}")]
    Panicked { message: String },

    /// The handler cannot run this kind of work in its current mode
    #[error("Operation not supported: {operation}")]
    Unsupported { operation: &'static str },
}

impl FtError {
    /// Wrap an arbitrary error as a work failure
    pub fn failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Failed(Box::new(error))
    }

    /// Build a rejection error
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected { reason: reason.into() }
    }

    /// Convert a panic payload caught by `catch_unwind`
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked { message }
    }

    /// Classify this error; suppressing chains classify by their last error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen | Self::TrialInProgress => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RetryTimeout { .. } => ErrorKind::RetryTimeout,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::Failed(_) => ErrorKind::Failed,
            Self::Suppressing { last, .. } => last.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Panicked { .. } => ErrorKind::Panicked,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind() == ErrorKind::CircuitOpen
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Whether the wrapped work error is of type `E`
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Borrow the wrapped work error as `E`
    ///
    /// Looks through [`FtError::Suppressing`] at the last failure.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Failed(inner) => inner.downcast_ref::<E>(),
            Self::Suppressing { last, .. } => last.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// The failure that ended the operation
    pub fn last(&self) -> &FtError {
        match self {
            Self::Suppressing { last, .. } => last,
            other => other,
        }
    }

    /// Earlier failures attached to this one, oldest first
    pub fn suppressed(&self) -> &[FtError] {
        match self {
            Self::Suppressing { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Collapse a list of failures into one error
    ///
    /// A single failure is returned as is; otherwise the last one is returned
    /// with the others attached as suppressed.
    pub fn chain(mut errors: Vec<FtError>) -> Self {
        match errors.pop() {
            None => Self::Cancelled,
            Some(last) if errors.is_empty() => last,
            Some(last) => Self::Suppressing { last: Box::new(last), suppressed: errors },
        }
    }
}

impl From<BoxedError> for FtError {
    fn from(error: BoxedError) -> Self {
        Self::Failed(error)
    }
}

impl From<std::io::Error> for FtError {
    fn from(error: std::io::Error) -> Self {
        Self::failed(error)
    }
}

impl From<String> for FtError {
    fn from(message: String) -> Self {
        Self::Failed(message.into())
    }
}

impl From<&str> for FtError {
    fn from(message: &str) -> Self {
        Self::Failed(message.into())
    }
}
