//! Statistics for reclamation and the registry

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the reclamation scheduler
#[derive(Debug, Default)]
pub(crate) struct ReclaimCounters {
    pub(crate) retired: AtomicU64,
    pub(crate) reclaimed_inline: AtomicU64,
    pub(crate) reclaimed_deferred: AtomicU64,
    pub(crate) grace_periods: AtomicU64,
    pub(crate) callback_panics: AtomicU64,
}

impl ReclaimCounters {
    pub(crate) fn snapshot(&self) -> ReclaimStats {
        // Completions are read before retirements so pending never underflows
        let reclaimed_inline = self.reclaimed_inline.load(Ordering::Acquire);
        let reclaimed_deferred = self.reclaimed_deferred.load(Ordering::Acquire);
        let callback_panics = self.callback_panics.load(Ordering::Acquire);
        let grace_periods = self.grace_periods.load(Ordering::Acquire);
        let retired = self.retired.load(Ordering::Acquire);

        ReclaimStats {
            retired,
            reclaimed_inline,
            reclaimed_deferred,
            grace_periods,
            callback_panics,
        }
    }
}

/// Point-in-time reclamation statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Values handed to the scheduler, in either mode
    pub retired: u64,
    /// Values freed by a synchronous waiter
    pub reclaimed_inline: u64,
    /// Callbacks run by the worker
    pub reclaimed_deferred: u64,
    /// Synchronous grace periods waited out
    pub grace_periods: u64,
    /// Callbacks that panicked (counted in `reclaimed_deferred` as well)
    pub callback_panics: u64,
}

impl ReclaimStats {
    /// Total values reclaimed so far
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed_inline + self.reclaimed_deferred
    }

    /// Values retired but not yet reclaimed
    pub fn pending(&self) -> u64 {
        self.retired.saturating_sub(self.reclaimed())
    }
}

/// Registry-wide statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Records currently reachable
    pub records: usize,
    /// Record nodes in memory (reachable, retired, or being built)
    pub allocated_records: usize,
    /// Reclamation statistics
    pub reclaim: ReclaimStats,
}
