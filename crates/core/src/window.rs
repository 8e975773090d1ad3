//! Fixed-size window of recent call outcomes
//!
//! The circuit breaker records every CLOSED-state outcome here and asks the
//! window whether the failure ratio warrants opening. The window only
//! reports "should open" once it holds `volume` outcomes, so a handful of
//! early failures never trips a fresh breaker.
//!
//! # Thread Safety
//! - Updates and queries take a short `parking_lot::Mutex` critical section;
//!   concurrent callers never observe a half-applied eviction.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Outcome of a single call as seen by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn is_failure(self) -> bool {
        matches!(self, Self::Failure)
    }
}

/// Overwrite-on-full ring of outcomes
#[derive(Debug)]
struct OutcomeRing {
    buf: VecDeque<Outcome>,
    capacity: usize,
}

impl OutcomeRing {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { buf: VecDeque::with_capacity(capacity), capacity }
    }

    /// Push an outcome, returning the evicted one when the ring was full
    fn push(&mut self, outcome: Outcome) -> Option<Outcome> {
        let evicted = if self.is_full() { self.buf.pop_front() } else { None };
        self.buf.push_back(outcome);
        evicted
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

#[derive(Debug)]
struct WindowState {
    ring: OutcomeRing,
    failures: usize,
}

/// Sliding window of the last `volume` outcomes with a failure-ratio trigger
#[derive(Debug)]
pub struct ResultWindow {
    state: Mutex<WindowState>,
    volume: usize,
    ratio: u8,
}

impl ResultWindow {
    /// Create a window holding `volume` outcomes that trips at `ratio`
    /// percent failures
    ///
    /// A volume of zero is clamped to `1`; a ratio above 100 is clamped to
    /// 100.
    pub fn new(volume: usize, ratio: u8) -> Self {
        let volume = volume.max(1);
        Self {
            state: Mutex::new(WindowState { ring: OutcomeRing::new(volume), failures: 0 }),
            volume,
            ratio: ratio.min(100),
        }
    }

    /// Record an outcome, evicting the oldest when the window is full
    pub fn update(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        if let Some(evicted) = state.ring.push(outcome) {
            if evicted.is_failure() {
                state.failures -= 1;
            }
        }
        if outcome.is_failure() {
            state.failures += 1;
        }
    }

    /// Whether the window is full and its failure share reaches the ratio
    pub fn should_open(&self) -> bool {
        let state = self.state.lock();
        state.ring.is_full() && state.failures * 100 >= usize::from(self.ratio) * state.ring.len()
    }

    /// Drop all recorded outcomes
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.ring.clear();
        state.failures = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failures(&self) -> usize {
        self.state.lock().failures
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    pub fn ratio(&self) -> u8 {
        self.ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates `ResultWindow::should_open` behavior for the partially
    /// filled window scenario.
    ///
    /// Assertions:
    /// - Ensures a window that is not yet full never trips, even at 100%
    ///   failures.
    #[test]
    fn test_partial_window_never_opens() {
        let window = ResultWindow::new(4, 50);
        for _ in 0..3 {
            window.update(Outcome::Failure);
        }
        assert_eq!(window.failures(), 3);
        assert!(!window.should_open());
    }

    /// Validates `ResultWindow::should_open` behavior for the ratio boundary
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms 2 failures out of 4 trips a 50% window.
    /// - Confirms 1 failure out of 4 does not.
    #[test]
    fn test_ratio_boundary() {
        let window = ResultWindow::new(4, 50);
        window.update(Outcome::Success);
        window.update(Outcome::Success);
        window.update(Outcome::Success);
        window.update(Outcome::Failure);
        assert!(!window.should_open());

        window.update(Outcome::Failure);
        // window is now [S, S, F, F]
        assert_eq!(window.failures(), 2);
        assert!(window.should_open());
    }

    /// Validates `ResultWindow::update` behavior for the eviction scenario.
    ///
    /// Assertions:
    /// - Confirms evicted failures are subtracted from the failure count.
    /// - Confirms `len()` stays at the configured volume.
    #[test]
    fn test_eviction_keeps_counts_consistent() {
        let window = ResultWindow::new(3, 60);
        window.update(Outcome::Failure);
        window.update(Outcome::Failure);
        window.update(Outcome::Failure);
        assert_eq!(window.failures(), 3);

        window.update(Outcome::Success);
        window.update(Outcome::Success);
        assert_eq!(window.len(), 3);
        assert_eq!(window.failures(), 1);
        assert!(!window.should_open());
    }

    /// Validates `ResultWindow::reset` behavior for the reset scenario.
    ///
    /// Assertions:
    /// - Ensures the window is empty with zero failures after reset.
    #[test]
    fn test_reset_clears_window() {
        let window = ResultWindow::new(2, 100);
        window.update(Outcome::Failure);
        window.update(Outcome::Failure);
        assert!(window.should_open());

        window.reset();

        assert!(window.is_empty());
        assert_eq!(window.failures(), 0);
        assert!(!window.should_open());
    }

    /// Validates `ResultWindow::new` behavior for the clamping scenario.
    ///
    /// Assertions:
    /// - Confirms zero volume is clamped to one and ratio to 100.
    #[test]
    fn test_new_clamps_arguments() {
        let window = ResultWindow::new(0, 250);
        assert_eq!(window.volume(), 1);
        assert_eq!(window.ratio(), 100);

        window.update(Outcome::Failure);
        assert!(window.should_open());
    }
}
