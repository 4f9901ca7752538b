//! Reconnect backoff schedule

use std::time::Duration;

/// Exponential reconnect policy: start at 1 s, double per failure, cap at
/// 60 s, reset on success.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectPolicy {
    /// Policy with explicit bounds.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to sleep before the next attempt. Doubles the following
    /// delay, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
