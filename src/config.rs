//! Processor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the processor. `Default` carries the documented
/// defaults; every field can be overridden independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Fallback poll period. In hybrid mode this is the cadence of the
    /// starvation-guard timer; in timer-only mode it is the poll cadence.
    pub polling_interval: Duration,
    /// Global per-event retry ceiling. Reaching it makes the event terminal.
    pub max_errors: u32,
    /// Bound on concurrently processed events.
    pub max_event_concurrency: usize,
    /// Bound on concurrently running handlers within one event.
    pub max_handler_concurrency: usize,
    /// Backpressure threshold: while this many events are queued or in
    /// flight, poll ticks are skipped.
    pub max_queued_events: usize,
    /// Silence window after which the fallback timer polls regardless of
    /// wakeup signals.
    pub wakeup_timeout: Duration,
    /// Throttle window coalescing bursts of wakeup signals.
    pub wakeup_throttle: Duration,
    /// Drain window for `stop` when the caller does not pass one.
    pub shutdown_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(5),
            max_errors: 5,
            max_event_concurrency: 20,
            max_handler_concurrency: 10,
            max_queued_events: 500,
            wakeup_timeout: Duration::from_secs(60),
            wakeup_throttle: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ProcessorConfig {
    /// Reject configurations the processor cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_errors == 0 {
            return Err("max_errors must be at least 1".to_string());
        }
        if self.max_event_concurrency == 0 {
            return Err("max_event_concurrency must be at least 1".to_string());
        }
        if self.max_handler_concurrency == 0 {
            return Err("max_handler_concurrency must be at least 1".to_string());
        }
        if self.polling_interval.is_zero() {
            return Err("polling_interval must be non-zero".to_string());
        }
        Ok(())
    }

    pub(crate) fn max_errors_i32(&self) -> i32 {
        self.max_errors.min(i32::MAX as u32) as i32
    }
}
