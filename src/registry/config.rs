//! Registry configuration

use crate::rcu::ReclaimConfig;

/// Default maximum length of the name and author fields, in bytes
pub const DEFAULT_MAX_FIELD_LEN: usize = 63;

/// Registry configuration options
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum length of name and author, in bytes; longer values are truncated
    pub max_field_len: usize,

    /// Maximum record nodes in memory at once, counting retired ones (0 = unlimited)
    pub max_allocated_records: usize,

    /// Reclamation scheduler configuration
    pub reclaim: ReclaimConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_field_len: DEFAULT_MAX_FIELD_LEN,
            max_allocated_records: 0, // Unlimited
            reclaim: ReclaimConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Set the maximum field length
    pub fn max_field_len(mut self, len: usize) -> Self {
        self.max_field_len = len;
        self
    }

    /// Set the record memory budget
    pub fn max_allocated_records(mut self, max: usize) -> Self {
        self.max_allocated_records = max;
        self
    }

    /// Set the reclamation configuration
    pub fn reclaim(mut self, reclaim: ReclaimConfig) -> Self {
        self.reclaim = reclaim;
        self
    }
}
