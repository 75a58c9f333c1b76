//! Weak per-type index of live entity instances.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use reliquary_foundation::{Error, Result, Uid};

use crate::entity::{EntityRef, WeakEntity};

/// Live instances of one entity type, by uid and optionally by key.
///
/// The index never keeps an entity alive. Dropped entries are pruned lazily.
/// The key index is a hint: keys change after insertion, so every hit is
/// checked and misses fall back to a scan.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    by_uid: BTreeMap<Uid, WeakEntity>,
    by_key: Option<HashMap<String, WeakEntity>>,
}

impl InstanceRegistry {
    /// Creates an index. `keyed` enables the key index, which is only
    /// useful for types not keyed by uid.
    #[must_use]
    pub fn new(keyed: bool) -> Self {
        Self {
            by_uid: BTreeMap::new(),
            by_key: keyed.then(HashMap::new),
        }
    }

    /// Records a live instance.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the entity is mutably borrowed.
    pub fn insert(&mut self, entity: &EntityRef) -> Result<()> {
        let (uid, key) = {
            let inner = entity
                .try_borrow()
                .map_err(|_| Error::busy("new instance"))?;
            (inner.uid().clone(), inner.key())
        };
        let weak = Rc::downgrade(entity);
        if let Some(by_key) = &mut self.by_key {
            by_key.insert(key, weak.clone());
        }
        self.by_uid.insert(uid, weak);
        Ok(())
    }

    /// Returns the live instance with a uid.
    #[must_use]
    pub fn get(&self, uid: &str) -> Option<EntityRef> {
        self.by_uid.get(uid).and_then(WeakEntity::upgrade)
    }

    /// Returns true if a live instance has the uid.
    #[must_use]
    pub fn contains(&self, uid: &str) -> bool {
        self.get(uid).is_some()
    }

    /// Returns the live instance currently keyed `key`.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a candidate is mutably borrowed.
    pub fn find_by_key(&mut self, key: &str) -> Result<Option<EntityRef>> {
        if let Some(entity) = self
            .by_key
            .as_ref()
            .and_then(|by_key| by_key.get(key))
            .and_then(WeakEntity::upgrade)
        {
            if key_of(&entity)? == key {
                return Ok(Some(entity));
            }
        }
        for entity in self.live() {
            if key_of(&entity)? == key {
                if let Some(by_key) = &mut self.by_key {
                    by_key.insert(key.to_string(), Rc::downgrade(&entity));
                }
                return Ok(Some(entity));
            }
        }
        if let Some(by_key) = &mut self.by_key {
            by_key.remove(key);
        }
        Ok(None)
    }

    /// Moves a key index entry after a key change.
    pub fn rekey(&mut self, old_key: &str, entity: &EntityRef, new_key: &str) {
        if let Some(by_key) = &mut self.by_key {
            if by_key
                .get(old_key)
                .is_some_and(|weak| weak.ptr_eq(&Rc::downgrade(entity)))
            {
                by_key.remove(old_key);
            }
            by_key.insert(new_key.to_string(), Rc::downgrade(entity));
        }
    }

    /// Returns every live instance in uid order, pruning dead entries.
    pub fn live(&mut self) -> Vec<EntityRef> {
        self.prune();
        self.by_uid.values().filter_map(WeakEntity::upgrade).collect()
    }

    /// Drops entries whose entity is gone.
    pub fn prune(&mut self) {
        self.by_uid.retain(|_, weak| weak.strong_count() > 0);
        if let Some(by_key) = &mut self.by_key {
            by_key.retain(|_, weak| weak.strong_count() > 0);
        }
    }

    /// Returns the number of indexed uids, live or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}

fn key_of(entity: &EntityRef) -> Result<String> {
    entity
        .try_borrow()
        .map(|inner| inner.key())
        .map_err(|_| Error::busy("indexed instance"))
}
