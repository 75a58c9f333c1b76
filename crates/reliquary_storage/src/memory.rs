//! In-memory backend.

use std::collections::BTreeMap;

use reliquary_foundation::{Error, Record, Result};

use crate::store::Backend;

/// A backend holding records in an ordered map.
///
/// Nothing survives the process; useful for tests and transient worlds.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: BTreeMap<String, Record>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Backend for MemoryBackend {
    fn has(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    fn get(&self, key: &str) -> Result<Record> {
        self.records
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("key", key))
    }

    fn put(&mut self, key: &str, record: &Record) -> Result<()> {
        self.records.insert(key.to_string(), record.clone());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.records.keys().cloned().collect())
    }
}
