//! Type descriptors for attribute validation.

use std::fmt;

use crate::value::Value;

/// Type descriptor for attribute validation.
///
/// Used to declare attribute types and validate values at runtime.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// The nil type (only value: nil).
    Nil,
    /// Boolean type.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit floating point.
    Float,
    /// String type.
    String,
    /// Homogeneous list type.
    List(Box<Type>),
    /// String-keyed map with homogeneous values.
    Map(Box<Type>),
    /// Optional type (value or nil).
    Option(Box<Type>),
    /// Any type (accepts any value).
    Any,
}

impl Type {
    /// Creates a list type with the given element type.
    #[must_use]
    pub fn list(element: Type) -> Self {
        Self::List(Box::new(element))
    }

    /// Creates a map type with the given value type.
    #[must_use]
    pub fn map(value: Type) -> Self {
        Self::Map(Box::new(value))
    }

    /// Creates an optional type.
    #[must_use]
    pub fn option(inner: Type) -> Self {
        Self::Option(Box::new(inner))
    }

    /// Returns true if this type is `Any`.
    #[must_use]
    pub const fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Returns true if this type can be nil.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        matches!(self, Self::Nil | Self::Option(_) | Self::Any)
    }

    /// Checks if a value type is accepted by this type.
    ///
    /// This performs structural type checking:
    /// - `Any` accepts all types
    /// - `Option(T)` accepts `Nil` and any type that `T` accepts
    /// - Primitive types must match exactly
    /// - Collection types check element types recursively
    #[must_use]
    pub fn accepts(&self, value_type: &Type) -> bool {
        if matches!(self, Self::Any) {
            return true;
        }

        if let Self::Option(inner) = self {
            return matches!(value_type, Self::Nil) || inner.accepts(value_type);
        }

        match (self, value_type) {
            // Exact type matches (including numeric promotion: Float accepts Int)
            (Self::Nil, Self::Nil)
            | (Self::Bool, Self::Bool)
            | (Self::Int | Self::Float, Self::Int)
            | (Self::Float, Self::Float)
            | (Self::String, Self::String) => true,

            // List(Any) and Map(Any) describe runtime values whose element types
            // were not inspected; accept them for any collection of that kind.
            (Self::List(expected), Self::List(actual)) | (Self::Map(expected), Self::Map(actual)) => {
                actual.is_any() || expected.accepts(actual)
            }

            _ => false,
        }
    }

    /// Checks a concrete value against this type, inspecting collection
    /// elements.
    #[must_use]
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Option(_), Value::Nil) => true,
            (Self::Option(inner), v) => inner.admits(v),
            (Self::List(element), Value::List(items)) => items.iter().all(|v| element.admits(v)),
            (Self::Map(element), Value::Map(entries)) => {
                entries.values().all(|v| element.admits(v))
            }
            _ => self.accepts(&value.value_type()),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::String => write!(f, "string"),
            Self::List(t) => write!(f, "list<{t:?}>"),
            Self::Map(t) => write!(f, "map<{t:?}>"),
            Self::Option(t) => write!(f, "option<{t:?}>"),
            Self::Any => write!(f, "any"),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
