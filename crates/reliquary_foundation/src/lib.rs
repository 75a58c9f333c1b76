//! Core values, type descriptors, identities and errors for Reliquary.
//!
//! This crate provides:
//! - [`Value`] - The JSON-like value model for attributes, tags and records
//! - [`Record`] - The flat serialized form of an entity
//! - [`Type`] - Type descriptors for attribute validation
//! - [`Uid`] / [`UidGenerator`] - Time-ordered, globally unique identities
//! - [`Error`] - Rich error types with context

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;
mod types;
pub mod uid;
mod value;

pub use error::{Error, ErrorContext, ErrorKind};
pub use types::Type;
pub use uid::{Uid, UidGenerator};
pub use value::{Record, Value};

/// Result type for Reliquary operations.
pub type Result<T> = std::result::Result<T, Error>;
