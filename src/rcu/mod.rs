//! Read-copy-update primitives
//!
//! Readers bracket their traversals with a [`ReaderSession`]; writers publish
//! replacements with a single atomic pointer store and hand the superseded
//! value to the [`ReclamationScheduler`], which frees it once every session
//! that might still observe it has ended.
//!
//! # Grace periods
//!
//! ```text
//!  reader A   |--session--|
//!  reader B         |------session------|
//!  writer         publish+retire(g)
//!                     |--- grace period ----|-> free
//!  reader C                   |--session--|      (began after retire,
//!                                                 never sees the old value)
//! ```
//!
//! Detection is epoch based: see [`epoch`] for the ordering argument.

pub mod config;
pub mod epoch;
pub mod scheduler;

pub use config::ReclaimConfig;
pub use epoch::ReaderSession;
pub use scheduler::ReclamationScheduler;

/// How a retired value is reclaimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimMode {
    /// The retiring thread waits out the grace period and frees the value itself
    #[default]
    Sync,
    /// The value is queued and freed later by the reclamation worker
    Async,
}
