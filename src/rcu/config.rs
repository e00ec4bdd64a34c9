//! Reclamation configuration

use std::time::Duration;

/// Shortest sleep between grace-period checks once spinning gives up
pub(crate) const MIN_BACKOFF: Duration = Duration::from_micros(1);

/// Configuration for the reclamation scheduler
#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    /// How often the worker re-checks pending callbacks for an elapsed grace period
    pub poll_interval: Duration,

    /// Busy-wait iterations before a synchronous waiter starts yielding
    pub spin_limit: u32,

    /// Upper bound on the sleep between grace-period checks in synchronous mode
    pub max_backoff: Duration,

    /// Name of the worker thread that runs deferred callbacks
    pub worker_name: String,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            spin_limit: 64,
            max_backoff: Duration::from_millis(1),
            worker_name: "rcu-reclaim".to_string(),
        }
    }
}

impl ReclaimConfig {
    /// Set the worker poll interval
    ///
    /// Zero is raised to one microsecond; the worker ticker cannot run on a zero period.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_micros(1));
        self
    }

    /// Set the spin limit for synchronous grace-period waits
    pub fn spin_limit(mut self, limit: u32) -> Self {
        self.spin_limit = limit;
        self
    }

    /// Set the maximum backoff sleep for synchronous grace-period waits
    ///
    /// Zero is raised to one microsecond so a long wait never busy-sleeps.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff.max(MIN_BACKOFF);
        self
    }

    /// Set the worker thread name
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}
