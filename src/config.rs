use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;
pub const DEFAULT_CANCELLED_SUBSCRIPTION_MEMORY: usize = 30;

/// Tuning knobs shared by servers and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Frames queued per connection before senders see backpressure.
    pub outbound_capacity: usize,
    /// Inbound events queued per connection for the event worker.
    pub event_capacity: usize,
    /// Handlers allowed to run at once, across all connections.
    pub max_concurrent_calls: usize,
    /// How many cancelled subscription ids to remember, so that late events
    /// for them are ignored without a warning.
    pub cancelled_subscription_memory: usize,
    /// Used by [`ServiceClient::call_wait`](crate::ServiceClient::call_wait).
    pub call_timeout: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            cancelled_subscription_memory: DEFAULT_CANCELLED_SUBSCRIPTION_MEMORY,
            call_timeout: None,
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    pub fn with_cancelled_subscription_memory(mut self, memory: usize) -> Self {
        self.cancelled_subscription_memory = memory;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    // Channel and semaphore sizes of zero would panic or deadlock.
    pub(crate) fn outbound_capacity(&self) -> usize {
        self.outbound_capacity.max(1)
    }

    pub(crate) fn event_capacity(&self) -> usize {
        self.event_capacity.max(1)
    }

    pub(crate) fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::de::value::{Error as ValueError, MapDeserializer};

    #[test]
    fn missing_fields_take_defaults() {
        let fields = vec![("outbound_capacity", 8usize), ("max_concurrent_calls", 2usize)];
        let config =
            ServiceConfig::deserialize(MapDeserializer::<_, ValueError>::new(fields.into_iter()))
                .unwrap();
        assert_eq!(config.outbound_capacity, 8);
        assert_eq!(config.max_concurrent_calls, 2);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.call_timeout, None);
    }

    #[test]
    fn zero_capacities_are_clamped() {
        let config = ServiceConfig::new()
            .with_outbound_capacity(0)
            .with_event_capacity(0)
            .with_max_concurrent_calls(0);
        assert_eq!(config.outbound_capacity(), 1);
        assert_eq!(config.event_capacity(), 1);
        assert_eq!(config.max_concurrent_calls(), 1);
    }
}
