//! Fallback
//!
//! Replaces a failed result with one computed from the error. The skip and
//! apply lists decide which failures are eligible: a skipped failure is
//! returned unchanged and the fallback is not called.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, instrument};

use crate::classify::{ErrorChecker, ErrorMatcher};
use crate::error::{ErrorKind, FtError, FtResult};
use crate::handle::ResultHandle;

/// Computes a replacement result from a failure
pub type FallbackFn<T> = Arc<dyn Fn(FtError) -> BoxFuture<'static, FtResult<T>> + Send + Sync>;

/// Turns eligible failures into a fallback result
pub struct Fallback<T> {
    name: Arc<str>,
    checker: ErrorChecker,
    handler: FallbackFn<T>,
}

impl<T: Send + 'static> Fallback<T> {
    /// Fallback that applies to every failure
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(FtError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FtResult<T>> + Send + 'static,
    {
        Self::builder(handler).build()
    }

    /// Fallback that answers every failure with a clone of `value`
    pub fn value(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |_error| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    pub fn builder<F, Fut>(handler: F) -> FallbackBuilder<T>
    where
        F: Fn(FtError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FtResult<T>> + Send + 'static,
    {
        FallbackBuilder {
            name: "fallback".to_string(),
            checker: ErrorChecker::default(),
            handler: Arc::new(move |error| handler(error).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checker(&self) -> &ErrorChecker {
        &self.checker
    }

    /// Run async work, falling back when it fails with an eligible error
    ///
    /// `work` is called right away. The fallback's own result, success or
    /// failure, is what the handle resolves to.
    #[instrument(skip(self, work), fields(fallback = %self.name))]
    pub fn invoke<F, Fut, E>(&self, work: F) -> ResultHandle<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FtError>,
    {
        let attempt = work().map(|result| result.map_err(Into::<FtError>::into));
        let fallback = self.clone();
        ResultHandle::from_future(async move {
            match attempt.await {
                Ok(value) => Ok(value),
                Err(error) => fallback.recover(error).await,
            }
        })
    }

    async fn recover(self, error: FtError) -> FtResult<T> {
        if self.checker.should_skip(&error) {
            debug!(%error, "failure not eligible for fallback");
            return Err(error);
        }
        debug!(%error, "work failed, using fallback");
        (self.handler)(error).await
    }
}

impl<T> Clone for Fallback<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            checker: self.checker.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T> fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback")
            .field("name", &self.name)
            .field("checker", &self.checker)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Fallback`]
pub struct FallbackBuilder<T> {
    name: String,
    checker: ErrorChecker,
    handler: FallbackFn<T>,
}

impl<T: Send + 'static> FallbackBuilder<T> {
    /// Set the fallback name used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Return failures caused by `E` unchanged
    pub fn skip_on<E: std::error::Error + 'static>(self) -> Self {
        self.skip_on_matcher(ErrorMatcher::of::<E>())
    }

    /// Only fall back on failures caused by `E` (and other applied types)
    pub fn apply_on<E: std::error::Error + 'static>(self) -> Self {
        self.apply_on_matcher(ErrorMatcher::of::<E>())
    }

    /// Return failures of `kind` unchanged
    pub fn skip_on_kind(self, kind: ErrorKind) -> Self {
        self.skip_on_matcher(ErrorMatcher::kind(kind))
    }

    /// Only fall back on failures of `kind` (and other applied matchers)
    pub fn apply_on_kind(self, kind: ErrorKind) -> Self {
        self.apply_on_matcher(ErrorMatcher::kind(kind))
    }

    /// Return failures matched by `matcher` unchanged
    pub fn skip_on_matcher(mut self, matcher: ErrorMatcher) -> Self {
        self.checker.push_skip(matcher);
        self
    }

    /// Only fall back on failures matched by `matcher` (and other applied
    /// matchers)
    pub fn apply_on_matcher(mut self, matcher: ErrorMatcher) -> Self {
        self.checker.push_apply(matcher);
        self
    }

    pub fn build(self) -> Fallback<T> {
        Fallback { name: self.name.into(), checker: self.checker, handler: self.handler }
    }
}

impl<T> fmt::Debug for FallbackBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackBuilder")
            .field("name", &self.name)
            .field("checker", &self.checker)
            .finish_non_exhaustive()
    }
}
