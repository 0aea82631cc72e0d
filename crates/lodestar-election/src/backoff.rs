//! Retry delays for recoverable election errors.
//!
//! One fixed delay per error class. There is no exponential growth and
//! no jitter.

use std::time::Duration;

use crate::error::{ElectionError, ErrorClass};

/// Delay applied after a rate-limited request.
pub const DEFAULT_THROTTLED_DELAY: Duration = Duration::from_secs(2 * 60);

/// Delay applied after any other recoverable failure.
pub const DEFAULT_TRANSIENT_DELAY: Duration = Duration::from_secs(5 * 60);

/// One retry decision's worth of context. Built per failure and dropped
/// once the delay has been computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    pub class: ErrorClass,
    /// 1-based count of consecutive failures in the current cycle.
    pub attempt: u32,
}

impl RetryContext {
    /// Builds the context for the `attempt`-th consecutive failure.
    pub fn new(err: &ElectionError, attempt: u32) -> Self {
        Self {
            class: err.class(),
            attempt,
        }
    }
}

/// Maps an error classification to a wait before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub throttled: Duration,
    pub transient: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            throttled: DEFAULT_THROTTLED_DELAY,
            transient: DEFAULT_TRANSIENT_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Returns how long to wait before retrying, or `None` if the error
    /// must not be retried at all.
    ///
    /// The attempt count is carried for logging; it does not stretch the
    /// delay.
    pub fn delay(&self, ctx: &RetryContext) -> Option<Duration> {
        match ctx.class {
            ErrorClass::Throttled => Some(self.throttled),
            ErrorClass::Transient => Some(self.transient),
            ErrorClass::Fatal => None,
        }
    }

    /// Convenience wrapper around [`BackoffPolicy::delay`].
    pub fn delay_for(&self, err: &ElectionError, attempt: u32) -> Option<Duration> {
        self.delay(&RetryContext::new(err, attempt))
    }
}
