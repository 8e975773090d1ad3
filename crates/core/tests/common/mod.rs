//! Shared setup for integration tests

#![allow(dead_code)]

use std::sync::Once;

use faultline_core::FtError;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber once per binary (`RUST_LOG` controls the level)
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _installed =
            tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
    });
}

/// Error raised by test work
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("service error: {message}")]
pub struct ServiceError {
    pub message: String,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<ServiceError> for FtError {
    fn from(error: ServiceError) -> Self {
        Self::failed(error)
    }
}

/// Error that callers should never retry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid argument: {0}")]
pub struct InvalidArgument(pub &'static str);

impl From<InvalidArgument> for FtError {
    fn from(error: InvalidArgument) -> Self {
        Self::failed(error)
    }
}
