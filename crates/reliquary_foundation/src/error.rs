//! Error types for the Reliquary system.
//!
//! Uses `thiserror` for ergonomic error definition with rich context.

use std::fmt;

use thiserror::Error;

/// The main error type for Reliquary operations.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: ErrorKind,
    /// Optional context about where the error occurred.
    pub context: Option<ErrorContext>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// Adds context to this error.
    #[must_use]
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Creates a duplicate registration error.
    #[must_use]
    pub fn already_exists(what: &'static str, name: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists {
            what,
            name: name.into(),
        })
    }

    /// Creates a type mismatch error.
    #[must_use]
    pub fn type_mismatch(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::new(ErrorKind::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound {
            what,
            name: name.into(),
        })
    }

    /// Creates an attribute validation error.
    #[must_use]
    pub fn validation(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation {
            attribute: attribute.into(),
            message: message.into(),
        })
    }

    /// Creates a usage error.
    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Usage(message.into()))
    }

    /// Creates a consistency error.
    #[must_use]
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Consistency(message.into()))
    }

    /// Creates a duplicate key error.
    #[must_use]
    pub fn duplicate_key(key: impl Into<String>) -> Self {
        Self::new(ErrorKind::DuplicateKey(key.into()))
    }

    /// Creates a dead link error.
    #[must_use]
    pub fn link_gone(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::LinkGone(name.into()))
    }

    /// Creates a busy entity error.
    #[must_use]
    pub fn busy(uid: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy(uid.into()))
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound { .. })
    }
}

/// Categorized error kinds for pattern matching.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// A type, attribute, blob, cache or store was registered twice.
    #[error("{what} already exists: {name}")]
    AlreadyExists {
        /// What was being registered.
        what: &'static str,
        /// The conflicting name.
        name: String,
    },

    /// A value or definition was not of the expected kind.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The expected type or kind.
        expected: String,
        /// The actual type or kind encountered.
        actual: String,
    },

    /// A type, key, store or field could not be found.
    #[error("{what} not found: {name}")]
    NotFound {
        /// What was being looked up.
        what: &'static str,
        /// The name or key that was missing.
        name: String,
    },

    /// An attribute rejected a new value.
    #[error("invalid value for {attribute}: {message}")]
    Validation {
        /// The attribute that rejected the value.
        attribute: String,
        /// Why the value was rejected.
        message: String,
    },

    /// An operation was called in a state that does not support it.
    #[error("usage error: {0}")]
    Usage(String),

    /// In-memory and stored state disagree.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// A key is already present in a store.
    #[error("key exists in entity store: {0}")]
    DuplicateKey(String),

    /// A weak link no longer points at a live object.
    #[error("link is gone: {0}")]
    LinkGone(String),

    /// An entity is already mutably borrowed elsewhere.
    #[error("entity is busy: {0}")]
    Busy(String),

    /// Reading or writing a backing file failed.
    #[error("io error: {0}")]
    Io(String),

    /// Encoding or decoding a record failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Context about where an error occurred.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Entity type involved.
    pub entity_type: Option<String>,
    /// Storage key involved.
    pub key: Option<String>,
    /// Operation being performed (e.g. `load`, `revert`).
    pub operation: Option<&'static str>,
}

impl ErrorContext {
    /// Creates a new empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the entity type.
    #[must_use]
    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Sets the storage key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the operation.
    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(operation) = self.operation {
            write!(f, "during {operation}")?;
        }
        if let Some(entity_type) = &self.entity_type {
            write!(f, " of {entity_type}")?;
        }
        if let Some(key) = &self.key {
            write!(f, " [{key}]")?;
        }
        Ok(())
    }
}
