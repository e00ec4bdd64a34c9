//! Epoch tracking for reader sessions
//!
//! Every thread that reads gets a participant slot holding the global epoch it
//! observed when its outermost session began, or [`INACTIVE`] outside a session.
//! Retirement advances the global epoch and tags the garbage with the value
//! before the advance. Garbage tagged `g` may be freed once every active
//! participant is pinned at an epoch greater than `g`.
//!
//! Both sides issue a `SeqCst` fence between their publishing store and their
//! subsequent loads. Either the reader's fence comes first, and the scanner sees
//! the reader's pinned epoch, or the writer's fence comes first, and the reader
//! cannot observe the unlinked pointer.

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use thread_local::ThreadLocal;

/// Epoch value of a participant outside any session
pub(crate) const INACTIVE: u64 = u64::MAX;

static NEXT_DOMAIN: AtomicU64 = AtomicU64::new(0);

/// Per-thread session state
#[derive(Debug)]
pub(crate) struct Participant {
    /// Epoch pinned by the outermost open session
    epoch: AtomicU64,
    /// Session nesting depth; only touched by the owning thread
    depth: AtomicUsize,
}

impl Participant {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(INACTIVE),
            depth: AtomicUsize::new(0),
        }
    }
}

/// Shared epoch state for one reclamation domain
#[derive(Debug)]
pub(crate) struct EpochState {
    domain: u64,
    global: AtomicU64,
    participants: ThreadLocal<Participant>,
}

impl EpochState {
    pub(crate) fn new() -> Self {
        Self {
            domain: NEXT_DOMAIN.fetch_add(1, Ordering::Relaxed),
            global: AtomicU64::new(0),
            participants: ThreadLocal::new(),
        }
    }

    /// Begin a session on the current thread
    pub(crate) fn pin(&self) -> ReaderSession<'_> {
        let participant = self.participants.get_or(Participant::new);
        let depth = participant.depth.load(Ordering::Relaxed);

        if depth == 0 {
            let epoch = self.global.load(Ordering::SeqCst);
            participant.epoch.store(epoch, Ordering::SeqCst);
            fence(Ordering::SeqCst);
        }
        participant.depth.store(depth + 1, Ordering::Relaxed);

        ReaderSession {
            domain: self.domain,
            participant,
            _not_send: PhantomData,
        }
    }

    /// Advance the global epoch, returning the tag for garbage retired now
    ///
    /// Must be called after the garbage has been unlinked.
    pub(crate) fn advance(&self) -> u64 {
        fence(Ordering::SeqCst);
        self.global.fetch_add(1, Ordering::SeqCst)
    }

    /// Smallest epoch pinned by any open session, or [`INACTIVE`] if none
    pub(crate) fn oldest_active(&self) -> u64 {
        fence(Ordering::SeqCst);
        self.participants
            .iter()
            .map(|p| p.epoch.load(Ordering::Acquire))
            .min()
            .unwrap_or(INACTIVE)
    }

    /// Whether garbage tagged `retired_at` can no longer be observed
    pub(crate) fn is_safe(&self, retired_at: u64) -> bool {
        self.oldest_active() > retired_at
    }

    /// Whether the calling thread is inside a session
    pub(crate) fn in_session(&self) -> bool {
        self.participants
            .get()
            .is_some_and(|p| p.depth.load(Ordering::Relaxed) > 0)
    }

    /// Identifies this state; sessions carry it so structures can reject foreign ones
    pub(crate) fn domain(&self) -> u64 {
        self.domain
    }

    pub(crate) fn current(&self) -> u64 {
        self.global.load(Ordering::Relaxed)
    }
}

/// A read-side critical section
///
/// While a session is open, records obtained from the registry stay valid:
/// nothing retired after the session began is freed until it ends. Sessions
/// nest, never block, and end when dropped. A session is tied to the thread
/// that opened it.
#[must_use = "a session ends as soon as it is dropped"]
pub struct ReaderSession<'a> {
    domain: u64,
    participant: &'a Participant,
    _not_send: PhantomData<*const ()>,
}

impl ReaderSession<'_> {
    /// End the session explicitly
    pub fn end(self) {}

    pub(crate) fn domain(&self) -> u64 {
        self.domain
    }
}

impl std::fmt::Debug for ReaderSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderSession")
            .field("epoch", &self.participant.epoch.load(Ordering::Relaxed))
            .field("depth", &self.participant.depth.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for ReaderSession<'_> {
    fn drop(&mut self) {
        let depth = self.participant.depth.load(Ordering::Relaxed);
        debug_assert!(depth > 0, "session dropped on an unpinned participant");

        if depth == 1 {
            // Release orders every read made inside the session before the free
            self.participant.epoch.store(INACTIVE, Ordering::Release);
        }
        self.participant
            .depth
            .store(depth.saturating_sub(1), Ordering::Relaxed);
    }
}
