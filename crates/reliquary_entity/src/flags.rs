//! Flag sets.

use std::collections::BTreeSet;

use reliquary_foundation::Value;

/// An ordered set of flag names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSet {
    flags: BTreeSet<String>,
}

impl FlagSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if every given flag is set.
    #[must_use]
    pub fn has(&self, flags: &[&str]) -> bool {
        flags.iter().all(|flag| self.flags.contains(*flag))
    }

    /// Returns true if at least one given flag is set.
    #[must_use]
    pub fn has_any(&self, flags: &[&str]) -> bool {
        flags.iter().any(|flag| self.flags.contains(*flag))
    }

    /// Sets flags. Returns true if anything changed.
    pub fn add(&mut self, flags: &[&str]) -> bool {
        flags.iter().fold(false, |changed, flag| {
            self.flags.insert((*flag).to_string()) | changed
        })
    }

    /// Clears flags. Returns true if anything changed.
    pub fn drop(&mut self, flags: &[&str]) -> bool {
        flags
            .iter()
            .fold(false, |changed, flag| self.flags.remove(*flag) | changed)
    }

    /// Flips each flag.
    pub fn toggle(&mut self, flags: &[&str]) {
        for flag in flags {
            if !self.flags.remove(*flag) {
                self.flags.insert((*flag).to_string());
            }
        }
    }

    /// Returns the number of set flags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// Returns true if no flags are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Iterates flags in order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().map(String::as_str)
    }

    /// Returns the flags as a list value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::List(self.flags.iter().map(|f| Value::from(f.as_str())).collect())
    }
}
