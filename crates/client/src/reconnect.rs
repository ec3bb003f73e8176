//! Exponential backoff for the progress event stream.
//!
//! The push loop asks [`Backoff::on_failure`] how long to wait before the
//! next connection attempt and calls [`Backoff::reset`] once a connection
//! succeeds, so a flaky server is retried at `min, 2*min, 4*min, ...`
//! up to `max_delay`.

use std::time::Duration;

/// Delay bounds and growth factor between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Wait after the first failure, and again after every reset.
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Growth per consecutive failure; `2.0` doubles.
    pub factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// The delay that follows `previous`, never above `max_delay`.
    pub fn grow(&self, previous: Duration) -> Duration {
        previous.mul_f64(self.factor.max(1.0)).min(self.max_delay)
    }

    fn floor(&self) -> Duration {
        self.min_delay.min(self.max_delay)
    }
}

/// Backoff state for one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    next: Duration,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let next = config.floor();
        Self { config, next }
    }

    /// Delay to wait now; the following call returns a longer one.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.config.grow(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.config.floor();
    }
}
