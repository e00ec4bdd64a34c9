//! Registry error types
//!
//! Error types for registry operations. None of them leave the registry in a
//! partially updated state.

use super::record::RecordId;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No reachable record has this id
    NotFound(RecordId),
    /// Borrow requested on a record that is already borrowed
    AlreadyBorrowed(RecordId),
    /// Return requested on a record that is not borrowed
    NotBorrowed(RecordId),
    /// A new record copy could not be allocated
    OutOfMemory,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "Record not found: {}", id),
            RegistryError::AlreadyBorrowed(id) => write!(f, "Record already borrowed: {}", id),
            RegistryError::NotBorrowed(id) => write!(f, "Record not borrowed: {}", id),
            RegistryError::OutOfMemory => write!(f, "Out of memory allocating record"),
        }
    }
}

impl std::error::Error for RegistryError {}
