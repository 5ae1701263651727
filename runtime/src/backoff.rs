//! Backoff policies for scheduled-job retries.
//!
//! The job state machine only depends on [`BackoffPolicy`]; swap
//! [`FixedBackoff`] for [`ExponentialBackoff`] without other changes.
//!
//! # Example
//!
//! ```rust
//! use relay_core::jobs::BackoffPolicy;
//! use relay_runtime::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let policy = ExponentialBackoff::builder()
//!     .initial_delay(Duration::from_secs(30))
//!     .max_delay(Duration::from_secs(3600))
//!     .multiplier(2.0)
//!     .build();
//!
//! assert_eq!(policy.delay(1), Duration::from_secs(30));
//! assert_eq!(policy.delay(2), Duration::from_secs(60));
//! ```

use rand::Rng;
use relay_core::jobs::BackoffPolicy;
use std::time::Duration;

/// Same delay after every failed attempt.
///
/// # Default Values
///
/// - `delay`: 60 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Create a fixed backoff.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempts: u32) -> Duration {
        self.delay
    }
}

/// Exponential backoff: `initial_delay * multiplier^(attempts - 1)`, capped at
/// `max_delay`.
///
/// With jitter enabled the delay is drawn uniformly from `[d/2, d]`, spreading
/// retries of jobs that failed together.
///
/// # Default Values
///
/// - `initial_delay`: 60 seconds
/// - `max_delay`: 1 hour
/// - `multiplier`: 2.0
/// - `jitter`: off
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Randomize each delay within `[d/2, d]`
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ExponentialBackoff {
    /// Create a new policy builder.
    #[must_use]
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder {
            policy: Self::default(),
        }
    }

    /// Delay before jitter is applied.
    #[must_use]
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempts: u32) -> Duration {
        let delay = self.base_delay(attempts);
        if !self.jitter {
            return delay;
        }
        let half = delay / 2;
        let spread = rand::thread_rng().gen_range(0.0..=1.0);
        half + half.mul_f64(spread)
    }
}

/// Builder for [`ExponentialBackoff`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoffBuilder {
    policy: ExponentialBackoff,
}

impl ExponentialBackoffBuilder {
    /// Set delay after the first failed attempt.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential growth).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set multiplier for exponential growth.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Build the [`ExponentialBackoff`].
    #[must_use]
    pub fn build(self) -> ExponentialBackoff {
        self.policy
    }
}
