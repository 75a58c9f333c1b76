//! The durable store contract and transactional data stores.
//!
//! A [`Store`] is what the entity layer talks to: a key-value interface over
//! flat [`Record`]s. [`DataStore`] is the reference implementation. It queues
//! writes and deletes in a pending transaction and applies them to a raw
//! [`Backend`] on [`Store::commit`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use reliquary_foundation::{Error, ErrorContext, Record, Result};
use tracing::debug;

/// A key-value store of entity records.
pub trait Store {
    /// Returns true if `key` holds a record that is not pending deletion.
    fn has(&self, key: &str) -> bool;

    /// Reads the record under `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent or pending deletion.
    fn get(&self, key: &str) -> Result<Record>;

    /// Writes `record` under `key`, replacing any existing record.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium rejects the write.
    fn put(&mut self, key: &str, record: Record) -> Result<()>;

    /// Removes the record under `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent.
    fn delete(&mut self, key: &str) -> Result<()>;

    /// Lists every key in the store.
    ///
    /// Keys pending deletion may still be listed; callers must tolerate
    /// [`Store::get`] failing for them.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium cannot be enumerated.
    fn keys(&self) -> Result<Vec<String>>;

    /// Applies any pending transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium rejects a queued operation.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Discards any pending transaction.
    fn abort(&mut self) {}

    /// Returns true if operations are queued and not yet committed.
    fn is_pending(&self) -> bool {
        false
    }
}

/// A store shared between entity types and the host.
///
/// Stores are confined to the thread that owns the entity manager.
pub type SharedStore = Rc<RefCell<dyn Store>>;

/// Wraps a store for sharing.
pub fn shared<S: Store + 'static>(store: S) -> SharedStore {
    Rc::new(RefCell::new(store))
}

/// A raw persistence medium behind a [`DataStore`].
///
/// Backends apply operations immediately; they know nothing about
/// transactions.
pub trait Backend {
    /// Returns true if the backend must be opened before use.
    fn opens(&self) -> bool {
        false
    }

    /// Returns true if the backend is open.
    fn is_open(&self) -> bool {
        true
    }

    /// Opens the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be opened.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Closes the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be closed cleanly.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Returns true if `key` is present.
    fn has(&self, key: &str) -> bool;

    /// Reads the record under `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent, or a medium error.
    fn get(&self, key: &str) -> Result<Record>;

    /// Writes `record` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium rejects the write.
    fn put(&mut self, key: &str, record: &Record) -> Result<()>;

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium rejects the removal.
    fn delete(&mut self, key: &str) -> Result<()>;

    /// Lists every key.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be enumerated.
    fn keys(&self) -> Result<Vec<String>>;
}

/// A queued operation. `None` marks a pending delete.
type Pending = Option<Record>;

/// A transactional store over a [`Backend`].
///
/// Reads see queued writes before committed ones, so a caller always reads
/// its own writes.
pub struct DataStore<B> {
    backend: B,
    transaction: BTreeMap<String, Pending>,
    order: VecDeque<String>,
}

impl<B: Backend> DataStore<B> {
    /// Creates a store over `backend` with an empty transaction.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            transaction: BTreeMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the backend mutably. Writes made through it bypass the
    /// transaction.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Returns true if the backend is open (always true for backends that
    /// do not open).
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.backend.opens() || self.backend.is_open()
    }

    /// Opens the backend, if it needs opening.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened.
    pub fn open(&mut self) -> Result<()> {
        if self.backend.opens() {
            self.backend.open()?;
        }
        Ok(())
    }

    /// Closes the backend, committing the pending transaction first if
    /// `commit` is set. Otherwise the transaction is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit or close fails.
    pub fn close(&mut self, commit: bool) -> Result<()> {
        if !self.backend.opens() {
            return Ok(());
        }
        if commit {
            Store::commit(self)?;
        }
        self.backend.close()
    }

    /// Returns the number of queued operations.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.transaction.len()
    }

    fn queue(&mut self, key: &str, pending: Pending) {
        if self.transaction.insert(key.to_string(), pending).is_none() {
            self.order.push_back(key.to_string());
        }
    }

    fn dequeue(&mut self, key: &str) {
        self.transaction.remove(key);
        self.order.retain(|k| k != key);
    }
}

impl<B: Backend> Store for DataStore<B> {
    fn has(&self, key: &str) -> bool {
        match self.transaction.get(key) {
            Some(pending) => pending.is_some(),
            None => self.backend.has(key),
        }
    }

    fn get(&self, key: &str) -> Result<Record> {
        let missing = || {
            Error::not_found("key", key)
                .with_context(ErrorContext::new().with_key(key).with_operation("get"))
        };
        match self.transaction.get(key) {
            Some(Some(record)) => Ok(record.clone()),
            Some(None) => Err(missing()),
            None if self.backend.has(key) => self.backend.get(key),
            None => Err(missing()),
        }
    }

    fn put(&mut self, key: &str, record: Record) -> Result<()> {
        self.queue(key, Some(record));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        if !self.has(key) {
            return Err(Error::not_found("key", key)
                .with_context(ErrorContext::new().with_key(key).with_operation("delete")));
        }
        if self.backend.has(key) {
            self.queue(key, None);
        } else {
            // Only ever queued, never committed.
            self.dequeue(key);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self.backend.keys()?.into_iter().collect();
        keys.extend(self.transaction.keys().cloned());
        Ok(keys.into_iter().collect())
    }

    fn commit(&mut self) -> Result<()> {
        if self.transaction.is_empty() {
            return Ok(());
        }
        let count = self.order.len();
        while let Some(key) = self.order.pop_front() {
            let Some(pending) = self.transaction.remove(&key) else {
                continue;
            };
            let applied = match &pending {
                Some(record) => self.backend.put(&key, record),
                None => self.backend.delete(&key),
            };
            if let Err(e) = applied {
                // Keep the failed operation and everything after it queued.
                self.transaction.insert(key.clone(), pending);
                self.order.push_front(key);
                return Err(e);
            }
        }
        debug!(operations = count, "committed store transaction");
        Ok(())
    }

    fn abort(&mut self) {
        self.transaction.clear();
        self.order.clear();
    }

    fn is_pending(&self) -> bool {
        !self.transaction.is_empty()
    }
}

impl<B> fmt::Debug for DataStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore")
            .field("pending", &self.order)
            .finish_non_exhaustive()
    }
}

/// A named registry of shared stores.
///
/// Not a singleton: hosts create one and pass it around, tests create a fresh
/// one per case.
#[derive(Default)]
pub struct StoreRegistry {
    stores: BTreeMap<String, SharedStore>,
}

impl StoreRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `store` under `name` and returns a handle to it.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is taken.
    pub fn register(&mut self, name: impl Into<String>, store: SharedStore) -> Result<SharedStore> {
        let name = name.into();
        if self.stores.contains_key(&name) {
            return Err(Error::already_exists("store", name));
        }
        self.stores.insert(name, Rc::clone(&store));
        Ok(store)
    }

    /// Looks up a store by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no store has that name.
    pub fn get(&self, name: &str) -> Result<SharedStore> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("store", name))
    }

    /// Returns true if a store has that name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Returns registered store names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    /// Commits every registered store, returning how many had pending work.
    ///
    /// # Errors
    ///
    /// Returns the first commit failure; later stores are not committed.
    pub fn commit_all(&self) -> Result<usize> {
        let mut committed = 0;
        for store in self.stores.values() {
            let mut store = store.borrow_mut();
            if store.is_pending() {
                store.commit()?;
                committed += 1;
            }
        }
        Ok(committed)
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.stores.keys()).finish()
    }
}
