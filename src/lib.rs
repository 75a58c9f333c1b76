//! Reliquary - Persistent entity system
//!
//! This crate re-exports all layers of the Reliquary system for convenient access.
//! For detailed documentation, see the individual layer crates.
//!
//! # Architecture
//!
//! ```text
//! Layer 2: reliquary_entity     - Schemas, type and instance registries, entity manager
//! Layer 1: reliquary_storage    - Durable stores, transactions, bounded caches
//! Layer 0: reliquary_foundation - Core types (Value, Uid, Error)
//! ```

pub use reliquary_entity as entity;
pub use reliquary_foundation as foundation;
pub use reliquary_storage as storage;
