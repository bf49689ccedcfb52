//! Bounded exponential backoff between feed reconnection attempts.

use std::time::Duration;

/// Default delay before the first reconnection attempt.
const DEFAULT_INITIAL: Duration = Duration::from_secs(3);

/// Default upper bound on the delay between attempts.
const DEFAULT_MAX: Duration = Duration::from_secs(60);

/// Reconnect timing owned by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL,
            max: DEFAULT_MAX,
        }
    }
}

impl ReconnectPolicy {
    /// Creates a policy; `max` is raised to `initial` if smaller.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Starts a fresh backoff sequence.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            next: self.initial,
        }
    }
}

/// Running backoff state: doubles after every failure up to the maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    next: Duration,
}

impl Backoff {
    /// Returns the delay to wait now and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.policy.max);
        delay
    }

    /// Goes back to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.next = self.policy.initial;
    }
}
