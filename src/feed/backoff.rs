use std::time::Duration;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Default ceiling for any single reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default number of consecutive attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponential reconnect policy with a hard cap and attempt limit.
///
/// The delay for attempt `n` (1-based) is `min(base * 2^(n-1), max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay before the given (1-based) attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;

        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// True once `attempts` consecutive failures exhaust the policy.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
