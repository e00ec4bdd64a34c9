//! Record registry with read-copy-update access
//!
//! Readers traverse the registry without locks. Writers publish a modified
//! copy of a record with one atomic pointer store and retire the old copy to
//! the reclamation scheduler, which frees it once no reader can still see it.
//!
//! # Architecture
//!
//! ```text
//!                          RegistryService
//!            ┌──────────────────────────────────────────┐
//!            │ registry:  Registry (RCU list)           │
//!            │ writer:    WriterLock                    │
//!            │ scheduler: ReclamationScheduler ──► worker thread
//!            └──────────────────┬───────────────────────┘
//!                               │
//!         ┌─────────────────────┼─────────────────────┐
//!         │                     │                     │
//!         ▼                     ▼                     ▼
//!     [Reader]              [Reader]              [Writer]
//!     find()                iter()                borrow()
//!     no lock               no lock               locate ─► copy ─► lock
//!                                                 ─► publish ─► unlock
//!                                                 ─► retire (Sync | Async)
//! ```
//!
//! # Torn reads
//!
//! A published record is never written again. A reader following a link gets
//! either the old node or the new one, each complete, never a mix of fields.

pub mod config;
pub mod error;
pub mod list;
pub mod record;
pub mod store;
pub(crate) mod writer;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use list::{Iter, Registry};
pub use record::{Record, RecordId};
pub use store::RegistryService;
