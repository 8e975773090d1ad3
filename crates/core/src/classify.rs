//! Error classification for skip/apply lists
//!
//! Breakers and retry engines treat some failures as "not really failures":
//! a breaker counts them as successes and a retry engine gives up on them
//! immediately. Callers describe those failures with [`ErrorMatcher`]s and
//! the handler asks an [`ErrorChecker`] for the verdict.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorKind, FtError};

type MatchFn = dyn Fn(&FtError) -> bool + Send + Sync;

/// Predicate over [`FtError`] used in skip and apply lists
#[derive(Clone)]
pub struct ErrorMatcher {
    name: String,
    matches: Arc<MatchFn>,
}

impl ErrorMatcher {
    /// Match failures whose wrapped work error is of type `E`
    pub fn of<E: StdError + 'static>() -> Self {
        Self {
            name: std::any::type_name::<E>().to_string(),
            matches: Arc::new(|error: &FtError| error.is::<E>()),
        }
    }

    /// Match handler errors of the given kind
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            name: format!("{kind:?}"),
            matches: Arc::new(move |error: &FtError| error.kind() == kind),
        }
    }

    /// Match with an arbitrary predicate
    pub fn predicate<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&FtError) -> bool + Send + Sync + 'static,
    {
        Self { name: name.into(), matches: Arc::new(predicate) }
    }

    pub fn matches(&self, error: &FtError) -> bool {
        (self.matches)(error)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorMatcher").field(&self.name).finish()
    }
}

/// Decides whether a failure should bypass a handler's failure path
///
/// A failure is skipped when it matches the skip list, or when the apply list
/// is non-empty and the failure matches none of its entries.
#[derive(Debug, Clone, Default)]
pub struct ErrorChecker {
    skip_on: Vec<ErrorMatcher>,
    apply_on: Vec<ErrorMatcher>,
}

impl ErrorChecker {
    pub fn new(skip_on: Vec<ErrorMatcher>, apply_on: Vec<ErrorMatcher>) -> Self {
        Self { skip_on, apply_on }
    }

    pub fn should_skip(&self, error: &FtError) -> bool {
        if self.skip_on.iter().any(|matcher| matcher.matches(error)) {
            return true;
        }
        !self.apply_on.is_empty() && !self.apply_on.iter().any(|matcher| matcher.matches(error))
    }

    pub fn skip_on(&self) -> &[ErrorMatcher] {
        &self.skip_on
    }

    pub fn apply_on(&self) -> &[ErrorMatcher] {
        &self.apply_on
    }

    pub(crate) fn push_skip(&mut self, matcher: ErrorMatcher) {
        self.skip_on.push(matcher);
    }

    pub(crate) fn push_apply(&mut self, matcher: ErrorMatcher) {
        self.apply_on.push(matcher);
    }
}
