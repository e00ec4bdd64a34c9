//! Reclamation scheduler
//!
//! Frees retired values once every reader session that could still observe
//! them has ended. Two modes are offered:
//!
//! - [`ReclaimMode::Sync`]: the caller waits out a grace period and frees the
//!   value itself.
//! - [`ReclaimMode::Async`]: the value is queued with its retirement epoch and
//!   a dedicated worker thread frees it later, without ever blocking the caller.
//!
//! The worker drives a current-thread tokio runtime: it drains the queue as
//! commands arrive and re-checks the oldest active epoch on a ticker while
//! callbacks are pending.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::config::{ReclaimConfig, MIN_BACKOFF};
use super::epoch::{EpochState, ReaderSession};
use super::ReclaimMode;
use crate::stats::metrics::ReclaimCounters;
use crate::stats::ReclaimStats;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Commands sent to the reclamation worker
enum Command {
    /// Run `callback` once the grace period for `retired_at` has elapsed
    Defer { retired_at: u64, callback: Callback },
    /// Signal once every callback queued before this command has run
    Barrier(oneshot::Sender<()>),
}

/// A queued callback, as held by the worker
struct Deferred {
    retired_at: u64,
    ticket: u64,
    callback: Option<Callback>,
}

#[derive(Debug)]
struct Shared {
    epochs: EpochState,
    counters: ReclaimCounters,
}

impl Shared {
    fn run_callback(&self, callback: Callback) {
        if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
            self.counters.callback_panics.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Deferred reclamation callback panicked");
        }
        self.counters
            .reclaimed_deferred
            .fetch_add(1, Ordering::Release);
    }
}

/// Tracks reader sessions and reclaims retired values after their grace period
///
/// Cheap to share behind an `Arc`. Dropping the scheduler closes the callback
/// queue and waits for the worker to drain what is left.
#[derive(Debug)]
pub struct ReclamationScheduler {
    shared: Arc<Shared>,
    queue: Option<mpsc::UnboundedSender<Command>>,
    worker: Option<JoinHandle<()>>,
    config: ReclaimConfig,
}

impl ReclamationScheduler {
    /// Create a scheduler with default configuration
    pub fn new() -> io::Result<Self> {
        Self::with_config(ReclaimConfig::default())
    }

    /// Create a scheduler with custom configuration
    ///
    /// Fails if the worker runtime or thread cannot be created.
    pub fn with_config(config: ReclaimConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            epochs: EpochState::new(),
            counters: ReclaimCounters::default(),
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = {
            let shared = Arc::clone(&shared);
            let poll_interval = config.poll_interval;
            thread::Builder::new()
                .name(config.worker_name.clone())
                .spawn(move || runtime.block_on(run_worker(shared, rx, poll_interval)))?
        };

        tracing::debug!(
            worker = %config.worker_name,
            poll_interval_us = config.poll_interval.as_micros() as u64,
            "Reclamation worker started"
        );

        Ok(Self {
            shared,
            queue: Some(tx),
            worker: Some(worker),
            config,
        })
    }

    /// Get the scheduler configuration
    pub fn config(&self) -> &ReclaimConfig {
        &self.config
    }

    /// Begin a reader session on the current thread
    pub fn read_lock(&self) -> ReaderSession<'_> {
        self.shared.epochs.pin()
    }

    /// Whether the current thread has an open reader session
    pub fn in_session(&self) -> bool {
        self.shared.epochs.in_session()
    }

    pub(crate) fn domain(&self) -> u64 {
        self.shared.epochs.domain()
    }

    /// Current global epoch
    pub fn epoch(&self) -> u64 {
        self.shared.epochs.current()
    }

    /// Block until every session open at the time of the call has ended
    ///
    /// Must not be called from inside a session on the same thread; the
    /// caller's own session would never end.
    pub fn synchronize(&self) {
        debug_assert!(
            !self.in_session(),
            "synchronize called from inside a reader session"
        );

        let retired_at = self.shared.epochs.advance();
        self.wait_for(retired_at);
        self.shared
            .counters
            .grace_periods
            .fetch_add(1, Ordering::Relaxed);

        tracing::debug!(retired_at, "Grace period elapsed");
    }

    /// Hand a retired value to the scheduler
    ///
    /// In [`ReclaimMode::Sync`] this waits for a grace period and drops the
    /// value before returning. In [`ReclaimMode::Async`] it returns at once and
    /// the worker drops the value later.
    pub fn retire<T: Send + 'static>(&self, value: T, mode: ReclaimMode) {
        match mode {
            ReclaimMode::Sync => {
                self.shared.counters.retired.fetch_add(1, Ordering::Relaxed);
                self.synchronize();
                drop(value);
                self.shared
                    .counters
                    .reclaimed_inline
                    .fetch_add(1, Ordering::Release);
            }
            ReclaimMode::Async => self.call_after_grace_period(move || drop(value)),
        }
    }

    /// Run `callback` on the worker once every session open now has ended
    ///
    /// Never blocks. The callback runs exactly once and must not block either.
    pub fn call_after_grace_period<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let retired_at = self.shared.epochs.advance();
        self.shared.counters.retired.fetch_add(1, Ordering::Relaxed);

        let command = Command::Defer {
            retired_at,
            callback: Box::new(callback),
        };

        let command = match &self.queue {
            Some(queue) => match queue.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(command)) => command,
            },
            None => command,
        };

        // Worker is gone; honor the grace period on this thread instead
        tracing::error!(retired_at, "Reclamation worker unavailable, reclaiming inline");
        if let Command::Defer { callback, .. } = command {
            self.wait_for(retired_at);
            self.shared.run_callback(callback);
        }
    }

    /// Block until every callback queued before this call has run
    ///
    /// Must not be called from inside a session.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime; use
    /// [`barrier_async`](Self::barrier_async) there.
    pub fn barrier(&self) {
        if let Some(done) = self.queue_barrier() {
            if done.blocking_recv().is_err() {
                tracing::warn!("Reclamation worker exited before barrier completed");
            }
        }
    }

    /// Wait until every callback queued before this call has run
    ///
    /// Must not be awaited from inside a session.
    pub async fn barrier_async(&self) {
        if let Some(done) = self.queue_barrier() {
            if done.await.is_err() {
                tracing::warn!("Reclamation worker exited before barrier completed");
            }
        }
    }

    fn queue_barrier(&self) -> Option<oneshot::Receiver<()>> {
        debug_assert!(
            !self.in_session(),
            "barrier called from inside a reader session"
        );

        let queue = self.queue.as_ref()?;
        let (done_tx, done_rx) = oneshot::channel();
        if queue.send(Command::Barrier(done_tx)).is_err() {
            tracing::warn!("Reclamation worker unavailable for barrier");
            return None;
        }
        Some(done_rx)
    }

    /// Get a snapshot of reclamation statistics
    pub fn stats(&self) -> ReclaimStats {
        self.shared.counters.snapshot()
    }

    /// Wait until garbage tagged `retired_at` is unobservable
    fn wait_for(&self, retired_at: u64) {
        let spin_limit = self.config.spin_limit;
        let mut spins: u32 = 0;
        let max_backoff = self.config.max_backoff.max(MIN_BACKOFF);
        let mut backoff = MIN_BACKOFF;

        while !self.shared.epochs.is_safe(retired_at) {
            if spins < spin_limit {
                spins += 1;
                std::hint::spin_loop();
            } else if spins < spin_limit.saturating_mul(2) {
                spins += 1;
                thread::yield_now();
            } else {
                thread::sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

impl Drop for ReclamationScheduler {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain and exit
        self.queue.take();

        if let Some(worker) = self.worker.take() {
            // Dropped from inside a callback; the worker exits on its own
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!("Reclamation worker panicked");
            }
        }
    }
}

/// Worker loop: queue callbacks, run the expired ones, answer barriers
async fn run_worker(
    shared: Arc<Shared>,
    mut queue: mpsc::UnboundedReceiver<Command>,
    poll_interval: Duration,
) {
    let mut pending: VecDeque<Deferred> = VecDeque::new();
    let mut barriers: Vec<(u64, oneshot::Sender<()>)> = Vec::new();
    let mut received: u64 = 0;
    let mut open = true;

    let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_micros(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let polling = !pending.is_empty() || !open;

        tokio::select! {
            command = queue.recv(), if open => match command {
                Some(Command::Defer { retired_at, callback }) => {
                    pending.push_back(Deferred {
                        retired_at,
                        ticket: received,
                        callback: Some(callback),
                    });
                    received += 1;
                }
                Some(Command::Barrier(done)) => barriers.push((received, done)),
                None => open = false,
            },
            _ = ticker.tick(), if polling => {}
        }

        if !pending.is_empty() {
            reclaim_expired(&shared, &mut pending);
        }

        if !barriers.is_empty() {
            // Tickets are queued in order, so the front is the oldest still waiting
            let oldest_waiting = pending.front().map_or(u64::MAX, |d| d.ticket);
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut barriers)
                .into_iter()
                .partition(|(mark, _)| *mark <= oldest_waiting);
            barriers = waiting;
            for (_, done) in ready {
                let _ = done.send(());
            }
        }

        if !open && pending.is_empty() {
            break;
        }
    }

    tracing::debug!(callbacks = received, "Reclamation worker stopped");
}

fn reclaim_expired(shared: &Shared, pending: &mut VecDeque<Deferred>) {
    let oldest = shared.epochs.oldest_active();

    pending.retain_mut(|deferred| {
        if deferred.retired_at >= oldest {
            return true;
        }
        if let Some(callback) = deferred.callback.take() {
            tracing::trace!(retired_at = deferred.retired_at, "Running deferred callback");
            shared.run_callback(callback);
        }
        false
    });
}
