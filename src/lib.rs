//! Read-copy-update record registry
//!
//! A concurrent registry of records where readers never block or take a lock
//! and writers replace whole records by publishing new copies. Superseded
//! copies are reclaimed once every reader that might still hold them is done,
//! either by the writer itself or by a background worker.
//!
//! # Example
//!
//! ```no_run
//! use rcu_registry::{ReclaimMode, RegistryService};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let books = RegistryService::new()?;
//! books.add(0, "book1", "jb")?;
//!
//! books.borrow(0, ReclaimMode::Sync)?;
//! assert!(books.is_borrowed(0)?);
//!
//! books.delete(0, ReclaimMode::Async)?;
//! assert!(books.find(0).is_err());
//! # Ok(())
//! # }
//! ```

pub mod rcu;
pub mod registry;
pub mod stats;

pub use rcu::{ReaderSession, ReclaimConfig, ReclaimMode, ReclamationScheduler};
pub use registry::{Record, RecordId, Registry, RegistryConfig, RegistryError, RegistryService};
pub use stats::{ReclaimStats, RegistryStats};
