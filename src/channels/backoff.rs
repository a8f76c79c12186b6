//! Reconnect policy with exponential backoff for the push channel

use std::time::Duration;

/// Default number of reconnect attempts before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Reconnect policy for the push channel
///
/// Attempt `n` (1-based) waits `base_delay * 2^(n-1)`. There is no delay
/// cap; the attempt ceiling is the only bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts
    pub max_attempts: u32,
    /// Delay before the first attempt (doubles each attempt)
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// Attempt 0 is treated as attempt 1.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
    }

    /// Whether another attempt is allowed after `attempt` attempts were made
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
