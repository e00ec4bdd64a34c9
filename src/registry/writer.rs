//! Writer serialization

use parking_lot::{Mutex, MutexGuard};

/// Serializes structural changes to the registry
///
/// Only the publish/unlink step runs under this lock. Lookup and building the
/// replacement happen before it is taken.
#[derive(Debug, Default)]
pub(crate) struct WriterLock {
    inner: Mutex<()>,
}

impl WriterLock {
    /// Create an unlocked writer lock
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, blocking until it is free
    pub(crate) fn lock(&self) -> WriterGuard<'_> {
        WriterGuard {
            _guard: self.inner.lock(),
        }
    }
}

/// Proof that the caller holds the [`WriterLock`]
///
/// Writer-side registry methods take a reference to one.
#[must_use = "the writer lock is released as soon as the guard is dropped"]
pub(crate) struct WriterGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for WriterGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WriterGuard")
    }
}
