//! Record types stored in the registry

use std::sync::Arc;

/// Unique key of a record
pub type RecordId = u64;

/// A registry record
///
/// Records are never modified once published. Changing one means building a
/// new value (see [`Record::with_borrowed`]) and publishing it in place of the
/// old one. The string fields are shared, so copies are cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    /// Unique key
    pub id: RecordId,
    /// Display name
    pub name: Arc<str>,
    /// Author
    pub author: Arc<str>,
    /// Whether the record is currently borrowed
    pub borrowed: bool,
}

impl Record {
    /// Create a new, not borrowed record
    pub fn new(id: RecordId, name: impl Into<Arc<str>>, author: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            name: name.into(),
            author: author.into(),
            borrowed: false,
        }
    }

    /// Copy of this record with the borrowed flag set to `borrowed`
    pub fn with_borrowed(&self, borrowed: bool) -> Self {
        Self {
            borrowed,
            ..self.clone()
        }
    }

    /// Check if the record is borrowed
    pub fn is_borrowed(&self) -> bool {
        self.borrowed
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id : {}, name : {}, author : {}, borrowed : {}",
            self.id, self.name, self.author, self.borrowed
        )
    }
}

/// Truncate `s` to at most `max_len` bytes on a char boundary
pub(crate) fn truncate_field(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
