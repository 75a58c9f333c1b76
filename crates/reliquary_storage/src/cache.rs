//! Fixed-capacity LRU cache with an explicit eviction callback.
//!
//! Only capacity pressure counts as eviction. Replacing the value under an
//! existing key, [`BoundedCache::remove`] and [`BoundedCache::clear`] never
//! invoke the callback.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

/// Default number of entries per cache.
pub const DEFAULT_CAPACITY: usize = 512;

/// Callback invoked with each entry evicted by capacity pressure.
pub type EvictionHook<K, V> = Box<dyn FnMut(&K, &V)>;

/// A least-recently-used cache that reports evictions.
pub struct BoundedCache<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    on_evict: Option<EvictionHook<K, V>>,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    /// Creates a cache with no eviction callback.
    ///
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            on_evict: None,
        }
    }

    /// Creates a cache that calls `on_evict` for every evicted entry.
    #[must_use]
    pub fn with_eviction(capacity: usize, on_evict: impl FnMut(&K, &V) + 'static) -> Self {
        let mut cache = Self::new(capacity);
        cache.on_evict = Some(Box::new(on_evict));
        cache
    }

    /// Returns the maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts an entry and marks it most recently used.
    ///
    /// Returns the previous value if `key` was already present. If the
    /// insert pushes the cache past capacity, the least recently used entry
    /// is evicted and handed to the callback.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.entries.contains(&key) {
            return self.entries.put(key, value);
        }
        if let Some((evicted_key, evicted)) = self.entries.push(key, value) {
            debug!(capacity = self.capacity(), "evicting least recently used entry");
            if let Some(hook) = self.on_evict.as_mut() {
                hook(&evicted_key, &evicted);
            }
        }
        None
    }

    /// Returns an entry and marks it most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key)
    }

    /// Returns an entry without touching recency.
    #[must_use]
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.peek(key)
    }

    /// Returns true if `key` is cached, without touching recency.
    #[must_use]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains(key)
    }

    /// Removes an entry without invoking the callback.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.pop(key)
    }

    /// Drops every entry without invoking the callback.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates entries from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    /// Removes every entry for which `predicate` is false, without invoking
    /// the callback.
    pub fn retain(&mut self, mut predicate: impl FnMut(&K, &V) -> bool)
    where
        K: Clone,
    {
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|&(k, v)| !predicate(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.entries.pop(&key);
        }
    }
}

impl<K: Hash + Eq + fmt::Debug, V> fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.capacity())
            .field("keys", &self.entries.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
