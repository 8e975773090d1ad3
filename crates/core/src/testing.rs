//! Test helpers for code built on the fault-tolerance handlers
//!
//! Provides a shared call counter for asserting how often work ran and an
//! `assert_eventually!` macro for state that settles asynchronously (a
//! breaker waiting for its half-open timer, for example).

// Test helpers are self-explanatory
#![allow(clippy::missing_panics_doc)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Assert that a condition becomes true within a timeout
///
/// Polls the condition every 10 ms on the current tokio runtime.
///
/// ```no_run
/// use std::time::Duration;
///
/// use faultline_core::{CircuitBreaker, CircuitState};
///
/// async fn wait_for_half_open(breaker: &CircuitBreaker) {
///     faultline_core::assert_eventually!(Duration::from_secs(1), {
///         breaker.state() == CircuitState::HalfOpen
///     });
/// }
/// ```
#[macro_export]
macro_rules! assert_eventually {
    ($timeout:expr, $cond:expr) => {{
        let timeout_duration = $timeout;
        let result = tokio::time::timeout(timeout_duration, async {
            loop {
                if $cond {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;

        assert!(result.is_ok(), "Condition did not become true within {:?}", timeout_duration);
    }};
}

/// Cloneable counter of how many times a piece of work ran
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<AtomicU32>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call and return the number of calls before it
    pub fn hit(&self) -> u32 {
        self.calls.fetch_add(1, Ordering::SeqCst)
    }

    pub fn count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}
