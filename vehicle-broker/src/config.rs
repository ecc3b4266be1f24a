//! Broker tuning configuration.

use std::time::Duration;

/// Tuning knobs for the broker.
///
/// The defaults match the service's production behavior: a 10 ms event
/// dispatch window and a short bounded retry loop for drivers that report
/// not-ready while warming up.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Minimum spacing between event-worker dispatches. Events arriving
    /// inside the window are coalesced into one batch.
    pub dispatch_interval: Duration,
    /// How many times `get`/`set` retry when the HAL reports not-ready.
    pub get_set_retries: u32,
    /// Sleep between not-ready retries.
    pub get_set_retry_wait: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(10),
            get_set_retries: 5,
            get_set_retry_wait: Duration::from_millis(2),
        }
    }
}

impl BrokerConfig {
    /// Set the event dispatch window.
    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    /// Set the not-ready retry budget for `get`/`set`.
    pub fn get_set_retries(mut self, retries: u32) -> Self {
        self.get_set_retries = retries;
        self
    }

    /// Set the sleep between not-ready retries.
    pub fn get_set_retry_wait(mut self, wait: Duration) -> Self {
        self.get_set_retry_wait = wait;
        self
    }
}
