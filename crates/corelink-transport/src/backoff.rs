//! Reconnect backoff for client channels.

use std::time::Duration;

/// Default delay unit between reconnect attempts.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(3000);

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Attempt multiplier at which the delay stops growing.
pub const DEFAULT_BACKOFF_CAP: u32 = 5;

/// Reconnect settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
    pub cap: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

/// Retry counter for one client channel.
///
/// The delay for attempt `n` (starting at 1) is `base_delay × min(n, cap)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    budget: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            budget: policy.max_retries,
        }
    }

    /// Attempts made since the last successful connect.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether no further attempts will be scheduled.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempt >= self.budget
    }

    /// Record a successful connect.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Disallow all future attempts.
    pub const fn disable(&mut self) {
        self.budget = 0;
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.base_delay * self.attempt.min(self.policy.cap.max(1)))
    }
}
