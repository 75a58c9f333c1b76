//! Integration tests for Layer 1: Storage
//!
//! Tests for transactional data stores, the file backend, the store
//! registry and bounded caches.
