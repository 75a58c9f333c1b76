//! Durable stores, transactional data stores and bounded caches for Reliquary.
//!
//! This crate provides:
//! - [`Store`] - The key-value contract the entity layer persists through
//! - [`DataStore`] - A transactional store over a raw [`Backend`]
//! - [`MemoryBackend`] / [`FileBackend`] - Reference backends
//! - [`StoreRegistry`] - Named shared stores
//! - [`BoundedCache`] - An LRU cache with an explicit eviction callback

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod file;
pub mod memory;
pub mod store;

pub use cache::{BoundedCache, DEFAULT_CAPACITY, EvictionHook};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use store::{Backend, DataStore, SharedStore, Store, StoreRegistry, shared};

/// A transactional store kept entirely in memory.
pub type MemoryStore = DataStore<MemoryBackend>;

/// A transactional store persisted as one file per key.
pub type FileStore = DataStore<FileBackend>;
