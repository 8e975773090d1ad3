//! Backoff policies for the retry engine
//!
//! A policy answers one question: given when retrying started, the previous
//! delay and the index of the call about to be made, how long should the
//! engine wait before it? `None` means the policy is exhausted and the engine
//! must stop.
//!
//! `call_index` is 1 for the first retry (the second call overall); the first
//! call never consults the policy.

use std::time::Duration;

use rand::Rng;

use crate::error::{ConfigError, ConfigResult};

/// Computes the delay before a retry
pub trait BackoffPolicy: Send + Sync {
    /// Delay in milliseconds before call number `call_index`, or `None` when
    /// no further calls are allowed
    fn next_delay_millis(
        &self,
        started_millis: u64,
        last_delay_millis: u64,
        call_index: u32,
    ) -> Option<u64>;

    /// Reject nonsensical parameters before the policy is used
    fn validate(&self) -> ConfigResult<()> {
        Ok(())
    }
}

impl<F> BackoffPolicy for F
where
    F: Fn(u64, u64, u32) -> Option<u64> + Send + Sync,
{
    fn next_delay_millis(
        &self,
        started_millis: u64,
        last_delay_millis: u64,
        call_index: u32,
    ) -> Option<u64> {
        self(started_millis, last_delay_millis, call_index)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn validate_calls(calls: u32) -> ConfigResult<()> {
    if calls == 0 {
        return Err(ConfigError::invalid("calls must be greater than 0"));
    }
    Ok(())
}

//==============================================================================
// Fixed Delay
//==============================================================================

/// Same delay before every retry
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FixedDelay {
    /// Total number of calls, including the first
    pub calls: u32,
    #[cfg_attr(feature = "serde", serde(with = "crate::serde_util::duration_millis"))]
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(calls: u32, delay: Duration) -> Self {
        Self { calls, delay }
    }
}

impl BackoffPolicy for FixedDelay {
    fn next_delay_millis(&self, _started: u64, _last_delay: u64, call_index: u32) -> Option<u64> {
        (call_index < self.calls).then(|| millis(self.delay))
    }

    fn validate(&self) -> ConfigResult<()> {
        validate_calls(self.calls)
    }
}

//==============================================================================
// Jitter Around a Base Delay
//==============================================================================

/// Base delay shifted by a uniform random offset in `[-jitter, jitter]`
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JitterPolicy {
    /// Total number of calls, including the first
    pub calls: u32,
    #[cfg_attr(feature = "serde", serde(with = "crate::serde_util::duration_millis"))]
    pub delay: Duration,
    #[cfg_attr(feature = "serde", serde(with = "crate::serde_util::duration_millis"))]
    pub jitter: Duration,
}

impl JitterPolicy {
    pub fn new(calls: u32, delay: Duration, jitter: Duration) -> Self {
        Self { calls, delay, jitter }
    }
}

impl Default for JitterPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_millis(50))
    }
}

impl BackoffPolicy for JitterPolicy {
    fn next_delay_millis(&self, _started: u64, _last_delay: u64, call_index: u32) -> Option<u64> {
        if call_index >= self.calls {
            return None;
        }
        let delay = i128::from(millis(self.delay));
        let jitter = i128::from(millis(self.jitter));
        let offset = if jitter == 0 { 0 } else { rand::thread_rng().gen_range(-jitter..=jitter) };
        Some(u64::try_from((delay + offset).max(0)).unwrap_or(u64::MAX))
    }

    fn validate(&self) -> ConfigResult<()> {
        validate_calls(self.calls)
    }
}

//==============================================================================
// Exponential Backoff
//==============================================================================

/// Randomization applied on top of an exponential delay
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Jitter {
    /// No jitter
    None,
    /// Full jitter: 0 to calculated delay
    Full,
    /// Equal jitter: calculated delay / 2 to calculated delay
    Equal,
    /// Decorrelated jitter: `base` to three times the previous delay
    Decorrelated {
        #[cfg_attr(feature = "serde", serde(with = "crate::serde_util::duration_millis"))]
        base: Duration,
    },
}

impl Jitter {
    /// Apply jitter to a delay in milliseconds
    pub fn apply(&self, delay_millis: u64, last_delay_millis: u64) -> u64 {
        let mut rng = rand::thread_rng();
        match self {
            Self::None => delay_millis,
            Self::Full => rng.gen_range(0..=delay_millis),
            Self::Equal => {
                let half = delay_millis / 2;
                half + rng.gen_range(0..=delay_millis - half)
            }
            Self::Decorrelated { base } => {
                let base = millis(*base);
                let upper = last_delay_millis.saturating_mul(3).max(base);
                rng.gen_range(base..=upper)
            }
        }
    }
}

/// Delay growing by `factor` on every retry, capped at `max_delay`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExponentialBackoff {
    /// Total number of calls, including the first
    pub calls: u32,
    #[cfg_attr(feature = "serde", serde(with = "crate::serde_util::duration_millis"))]
    pub delay: Duration,
    pub factor: f64,
    #[cfg_attr(feature = "serde", serde(with = "crate::serde_util::duration_millis"))]
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl ExponentialBackoff {
    pub fn new(calls: u32, delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self { calls, delay, factor, max_delay, jitter: Jitter::None }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), 2.0, Duration::from_secs(5))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn next_delay_millis(&self, _started: u64, last_delay: u64, call_index: u32) -> Option<u64> {
        if call_index >= self.calls {
            return None;
        }
        let cap = millis(self.max_delay);
        let base = if call_index <= 1 || last_delay == 0 {
            millis(self.delay)
        } else {
            (last_delay as f64 * self.factor).min(cap as f64) as u64
        };
        Some(self.jitter.apply(base.min(cap), last_delay).min(cap))
    }

    fn validate(&self) -> ConfigResult<()> {
        validate_calls(self.calls)?;
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ConfigError::invalid("factor must be a finite number >= 1.0"));
        }
        if self.max_delay < self.delay {
            return Err(ConfigError::invalid("max_delay must be >= delay"));
        }
        Ok(())
    }
}
