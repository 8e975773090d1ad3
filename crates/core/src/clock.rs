//! Time source for retry bookkeeping
//!
//! The retry engine reads two things per call: a monotonic start instant for
//! the overall timeout and epoch milliseconds handed to backoff policies.
//! Tests swap in [`MockClock`] so both move only when the test says so.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of the instants a retry run is measured against
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant used for elapsed-time checks
    fn now(&self) -> Instant;

    /// Milliseconds since the UNIX epoch, passed to backoff policies
    fn epoch_millis(&self) -> u64;
}

/// Clock backed by `Instant::now` and `SystemTime::now`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_millis(&self) -> u64 {
        let millis = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        u64::try_from(millis).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock
///
/// Every clone reads the same offset, so a clone given to a
/// [`RetryEngine`](crate::retry::RetryEngine) moves when the test advances
/// its own copy. Epoch milliseconds start at zero.
#[derive(Debug, Clone)]
pub struct MockClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self { origin: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Total time advanced so far
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn epoch_millis(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
