//! Broker configuration.

use std::ops::RangeInclusive;
use std::time::Duration;

/// Tunables shared by the broker and the cache gate of one host window.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Ports a worker listener may be bound to.
    pub port_range: RangeInclusive<u16>,
    /// Random bind attempts before giving up with `PortExhausted`.
    pub port_attempts: u32,
    /// How often a monitored URL the backend reports as validating is re-probed.
    pub validation_poll_interval: Duration,
    /// Monitors of a validating URL resolve without a path after this long.
    pub validation_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port_range: 1025..=65535,
            port_attempts: 64,
            validation_poll_interval: Duration::from_millis(250),
            validation_timeout: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_port_attempts(mut self, attempts: u32) -> Self {
        self.port_attempts = attempts;
        self
    }

    pub fn with_validation_poll_interval(mut self, interval: Duration) -> Self {
        self.validation_poll_interval = interval;
        self
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }
}
