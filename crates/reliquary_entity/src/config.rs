//! Manager configuration.

use reliquary_storage::DEFAULT_CAPACITY;

/// What deserialization does with keys that match no schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownFields {
    /// Log a warning and skip the key.
    #[default]
    Warn,
    /// Fail the whole deserialization.
    Reject,
}

/// Settings for an [`EntityManager`](crate::EntityManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Capacity of each per-type cache.
    pub cache_capacity: usize,
    /// Unknown field policy for types that do not set their own.
    pub unknown_fields: UnknownFields,
}

impl ManagerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-type cache capacity.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the default unknown field policy.
    #[must_use]
    pub fn with_unknown_fields(mut self, policy: UnknownFields) -> Self {
        self.unknown_fields = policy;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CAPACITY,
            unknown_fields: UnknownFields::Warn,
        }
    }
}
