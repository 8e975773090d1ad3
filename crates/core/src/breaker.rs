//! Circuit breaker
//!
//! The breaker sits in front of a dependency and tracks the outcome of recent
//! calls in a [`ResultWindow`]. Once the window is full and its failure share
//! reaches `ratio` percent, the breaker opens and rejects calls without
//! running them. After `delay` a scheduled timer moves it to half-open, where
//! a single trial call at a time decides between closing again and reopening.
//!
//! ```text
//!            window trips                  delay elapsed
//!  CLOSED ─────────────────▶ OPEN ─────────────────────────▶ HALF_OPEN
//!    ▲                        ▲                                  │
//!    │                        └──────── trial failed ────────────┤
//!    └──────────────── success_threshold trials passed ──────────┘
//! ```
//!
//! State lives in an atomic and moves by compare-and-set, so exactly one
//! caller performs the side effects of each transition. The pending reopen
//! timer sits in a single slot and is replaced on every reschedule.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::classify::{ErrorChecker, ErrorMatcher};
use crate::error::{ConfigError, ConfigResult, ErrorKind, FtError, FtResult};
use crate::executor::{Scheduler, TimerHandle};
use crate::handle::ResultHandle;
use crate::window::{Outcome, ResultWindow};

//==============================================================================
// State
//==============================================================================

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing one trial request at a time
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => CLOSED,
            Self::Open => OPEN,
            Self::HalfOpen => HALF_OPEN,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CircuitBreakerConfig {
    /// Name used in logs
    pub name: String,
    /// Time to wait before transitioning from open to half-open
    #[cfg_attr(feature = "serde", serde(with = "crate::serde_util::duration_millis"))]
    pub delay: Duration,
    /// Failure percentage (0 to 100) of a full window that opens the circuit
    pub ratio: u8,
    /// Number of recent outcomes the window holds
    pub volume: usize,
    /// Successful trials needed to close the circuit from half-open
    pub success_threshold: u32,
    /// Failures that count as successes
    #[cfg_attr(feature = "serde", serde(skip))]
    pub checker: ErrorChecker,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "circuit-breaker".to_string(),
            delay: Duration::from_secs(5),
            ratio: 60,
            volume: 10,
            success_threshold: 1,
            checker: ErrorChecker::default(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.ratio > 100 {
            return Err(ConfigError::invalid("ratio must be between 0 and 100"));
        }

        if self.volume == 0 {
            return Err(ConfigError::invalid("volume must be greater than 0"));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the breaker name used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set how long the breaker stays open before a trial
    pub fn delay(mut self, delay: Duration) -> Self {
        self.config.delay = delay;
        self
    }

    /// Set the failure percentage (0-100) that opens the breaker
    pub fn ratio(mut self, ratio: u8) -> Self {
        self.config.ratio = ratio;
        self
    }

    /// Set how many recent calls the failure ratio is computed over
    pub fn volume(mut self, volume: usize) -> Self {
        self.config.volume = volume;
        self
    }

    /// Set how many successful trials close a half-open breaker
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Count failures caused by `E` as successes
    pub fn skip_on<E: std::error::Error + 'static>(self) -> Self {
        self.skip_on_matcher(ErrorMatcher::of::<E>())
    }

    /// Only count failures caused by `E` (and other applied types) as
    /// failures
    pub fn apply_on<E: std::error::Error + 'static>(self) -> Self {
        self.apply_on_matcher(ErrorMatcher::of::<E>())
    }

    /// Count failures of `kind` as successes
    pub fn skip_on_kind(self, kind: ErrorKind) -> Self {
        self.skip_on_matcher(ErrorMatcher::kind(kind))
    }

    /// Count failures matched by `matcher` as successes
    pub fn skip_on_matcher(mut self, matcher: ErrorMatcher) -> Self {
        self.config.checker.push_skip(matcher);
        self
    }

    /// Only count failures matched by `matcher` (and other applied matchers)
    pub fn apply_on_matcher(mut self, matcher: ErrorMatcher) -> Self {
        self.config.checker.push_apply(matcher);
        self
    }

    /// Run reopen timers on `scheduler` and build a breaker directly
    pub fn scheduler(self, scheduler: Scheduler) -> CircuitBreakerBuilderWithScheduler {
        CircuitBreakerBuilderWithScheduler { config: self.config, scheduler }
    }

    /// Validate and build the configuration
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder with a custom scheduler that builds a CircuitBreaker directly
#[derive(Debug)]
pub struct CircuitBreakerBuilderWithScheduler {
    config: CircuitBreakerConfig,
    scheduler: Scheduler,
}

impl CircuitBreakerBuilderWithScheduler {
    /// Set how long the breaker stays open before a trial
    pub fn delay(mut self, delay: Duration) -> Self {
        self.config.delay = delay;
        self
    }

    /// Set how many successful trials close a half-open breaker
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Validate the configuration and build the breaker
    pub fn build(self) -> ConfigResult<CircuitBreaker> {
        CircuitBreaker::with_scheduler(self.config, self.scheduler)
    }
}

//==============================================================================
// Circuit Breaker
//==============================================================================

/// Point-in-time view of a breaker's internals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub window_len: usize,
    pub window_failures: usize,
    pub success_count: u32,
    pub trial_in_progress: bool,
    pub reopen_scheduled: bool,
}

struct BreakerInner {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    window: ResultWindow,
    success_counter: AtomicU32,
    trial_in_progress: AtomicBool,
    /// Bumped whenever the reopen slot changes owner; stale timers compare
    /// against it and back off.
    timer_epoch: AtomicU64,
    reopen_timer: Mutex<Option<TimerHandle>>,
    scheduler: Scheduler,
}

/// Circuit breaker guarding calls to a single dependency
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .field("window_len", &self.inner.window.len())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a circuit breaker whose timers run on the shared scheduler
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_scheduler(config, Scheduler::global()?)
    }

    /// Create a circuit breaker whose timers run on `scheduler`
    pub fn with_scheduler(config: CircuitBreakerConfig, scheduler: Scheduler) -> ConfigResult<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(BreakerInner {
                window: ResultWindow::new(config.volume, config.ratio),
                config,
                state: AtomicU8::new(CLOSED),
                success_counter: AtomicU32::new(0),
                trial_in_progress: AtomicBool::new(false),
                timer_epoch: AtomicU64::new(0),
                reopen_timer: Mutex::new(None),
                scheduler,
            }),
        })
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults() -> ConfigResult<Self> {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Current state; never blocks
    pub fn state(&self) -> CircuitState {
        self.inner.current_state()
    }

    /// Force the breaker into `state`
    ///
    /// - `Closed`: cancels the pending reopen timer, clears the window and
    ///   the success counter.
    /// - `Open`: cancels the pending reopen timer and clears counters. No new
    ///   timer is armed, so the breaker stays open until forced again.
    /// - `HalfOpen`: clears counters and drops the pending reopen timer.
    pub fn set_state(&self, state: CircuitState) {
        self.inner.force_state(state);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = &self.inner;
        BreakerSnapshot {
            state: inner.current_state(),
            window_len: inner.window.len(),
            window_failures: inner.window.failures(),
            success_count: inner.success_counter.load(Ordering::Acquire),
            trial_in_progress: inner.trial_in_progress.load(Ordering::Acquire),
            reopen_scheduled: inner.reopen_timer.lock().is_some(),
        }
    }

    /// Run async work through the breaker
    ///
    /// Admission is decided now: an open breaker (or a busy half-open one)
    /// returns an already failed handle and `work` is never called. Otherwise
    /// `work` is called right away and its future runs when the handle is
    /// polled. The work's own error is passed through unchanged.
    #[instrument(skip(self, work), fields(breaker = %self.inner.config.name, state = %self.state()))]
    pub fn invoke<F, Fut, T, E>(&self, work: F) -> ResultHandle<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<FtError>,
    {
        let ticket = match self.inner.admit() {
            Ok(ticket) => ticket,
            Err(error) => return ResultHandle::ready(Err(error)),
        };
        let future = work();
        ResultHandle::from_future(async move {
            let result = future.await.map_err(Into::<FtError>::into);
            ticket.record(&result);
            result
        })
    }

    /// Run a synchronous closure through the breaker on the calling thread
    #[instrument(skip(self, work), fields(breaker = %self.inner.config.name, state = %self.state()))]
    pub fn call<F, T, E>(&self, work: F) -> FtResult<T>
    where
        F: FnOnce() -> Result<T, E>,
        E: Into<FtError>,
    {
        let ticket = self.inner.admit()?;
        let result = work().map_err(Into::<FtError>::into);
        ticket.record(&result);
        result
    }
}

impl BreakerInner {
    fn current_state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn admit(self: &Arc<Self>) -> FtResult<Ticket> {
        match self.current_state() {
            CircuitState::Closed => Ok(Ticket::new(Arc::clone(self), Admission::Closed)),
            CircuitState::Open => {
                debug!(breaker = %self.config.name, "circuit open, rejecting call");
                Err(FtError::CircuitOpen)
            }
            CircuitState::HalfOpen => {
                if self
                    .trial_in_progress
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    debug!(breaker = %self.config.name, "admitting half-open trial call");
                    Ok(Ticket::new(Arc::clone(self), Admission::Trial))
                } else {
                    debug!(breaker = %self.config.name, "trial already in progress, rejecting call");
                    Err(FtError::TrialInProgress)
                }
            }
        }
    }

    fn is_success<T>(&self, result: &FtResult<T>) -> bool {
        match result {
            Ok(_) => true,
            Err(error) => self.config.checker.should_skip(error),
        }
    }

    fn record_closed<T>(self: &Arc<Self>, result: &FtResult<T>) {
        let outcome = if self.is_success(result) { Outcome::Success } else { Outcome::Failure };
        self.window.update(outcome);

        // Any call that fills the window can trip it, not only failures
        if self.window.should_open() && self.transition(CircuitState::Closed, CircuitState::Open) {
            self.window.reset();
            warn!(
                breaker = %self.config.name,
                delay = ?self.config.delay,
                "failure ratio reached, circuit opened"
            );
            self.schedule_half_open();
        }
    }

    fn record_trial<T>(self: &Arc<Self>, result: &FtResult<T>) {
        if self.is_success(result) {
            let successes = self.success_counter.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.success_counter.store(0, Ordering::Release);
                if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    self.window.reset();
                    info!(breaker = %self.config.name, "trial calls succeeded, circuit closed");
                }
            } else {
                debug!(breaker = %self.config.name, successes, "trial call succeeded");
            }
            self.trial_in_progress.store(false, Ordering::Release);
            return;
        }

        self.success_counter.store(0, Ordering::Release);
        let reopened = self.transition(CircuitState::HalfOpen, CircuitState::Open);
        if reopened {
            self.window.reset();
        }
        self.trial_in_progress.store(false, Ordering::Release);
        if reopened {
            warn!(breaker = %self.config.name, "trial call failed, circuit reopened");
            self.schedule_half_open();
        }
    }

    fn schedule_half_open(self: &Arc<Self>) {
        let mut slot = self.reopen_timer.lock();
        let epoch = self.timer_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let weak = Arc::downgrade(self);
        let timer = self.scheduler.schedule(self.config.delay, move || {
            Self::on_reopen_timer(&weak, epoch);
        });
        if let Some(previous) = slot.replace(timer) {
            previous.cancel();
        }
    }

    fn on_reopen_timer(weak: &Weak<Self>, epoch: u64) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut slot = inner.reopen_timer.lock();
        if inner.timer_epoch.load(Ordering::Acquire) != epoch {
            debug!(breaker = %inner.config.name, "stale reopen timer ignored");
            return;
        }
        slot.take();
        if inner.transition(CircuitState::Open, CircuitState::HalfOpen) {
            info!(breaker = %inner.config.name, "delay elapsed, circuit half-open");
        }
    }

    fn cancel_reopen_timer(&self) {
        let mut slot = self.reopen_timer.lock();
        self.timer_epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(timer) = slot.take() {
            timer.cancel();
        }
    }

    fn reset_counters(&self) {
        self.window.reset();
        self.success_counter.store(0, Ordering::Release);
    }

    fn force_state(&self, state: CircuitState) {
        match state {
            CircuitState::Closed => {
                self.cancel_reopen_timer();
                self.reset_counters();
                self.state.store(CLOSED, Ordering::Release);
            }
            CircuitState::Open => {
                self.cancel_reopen_timer();
                self.reset_counters();
                self.state.store(OPEN, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                self.cancel_reopen_timer();
                self.reset_counters();
                self.state.store(HALF_OPEN, Ordering::Release);
            }
        }
        info!(breaker = %self.config.name, %state, "circuit state forced");
    }
}

//==============================================================================
// Admission Tickets
//==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Closed,
    Trial,
}

/// Proof of admission; records the outcome exactly once
///
/// A trial ticket dropped without an outcome (the caller dropped the handle
/// before polling it) releases the half-open slot.
struct Ticket {
    inner: Arc<BreakerInner>,
    admission: Admission,
    recorded: bool,
}

impl Ticket {
    fn new(inner: Arc<BreakerInner>, admission: Admission) -> Self {
        Self { inner, admission, recorded: false }
    }

    fn record<T>(mut self, result: &FtResult<T>) {
        self.recorded = true;
        match self.admission {
            Admission::Closed => self.inner.record_closed(result),
            Admission::Trial => self.inner.record_trial(result),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.recorded && self.admission == Admission::Trial {
            debug!(breaker = %self.inner.config.name, "trial abandoned, releasing slot");
            self.inner.trial_in_progress.store(false, Ordering::Release);
        }
    }
}
