//! Entities: identity, schema values, flags, tags, links and persistence.
//!
//! Entities are created through an [`EntityManager`](crate::EntityManager),
//! which registers every instance it builds. An entity carries its type
//! descriptor, so it can save and revert itself without the manager.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use reliquary_foundation::{Error, ErrorContext, Record, Result, Uid, Value};
use reliquary_storage::{SharedStore, Store};
use tracing::{debug, warn};

use crate::flags::FlagSet;
use crate::link::Link;
use crate::registry::{EntityType, KeySpec};
use crate::schema::{Blob, RESERVED_FIELDS};

/// Tag recording the key a renamed entity was last stored under.
pub const OLD_KEY_TAG: &str = "_old_key";

/// The owning handle to an entity.
pub type EntityRef = Rc<RefCell<Entity>>;

/// A non-owning handle to an entity.
pub type WeakEntity = Weak<RefCell<Entity>>;

/// Initial state of a new entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawn {
    /// Whether the entity starts in play.
    pub active: bool,
    /// Whether the entity may be persisted.
    pub savable: bool,
}

impl Spawn {
    /// An inactive, savable entity.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: false,
            savable: true,
        }
    }

    /// Starts the entity in play.
    #[must_use]
    pub const fn active(mut self) -> Self {
        self.active = true;
        self
    }

    /// Forbids persisting the entity.
    #[must_use]
    pub const fn transient(mut self) -> Self {
        self.savable = false;
        self
    }
}

impl Default for Spawn {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn read_store(store: &SharedStore) -> Result<Ref<'_, dyn Store + 'static>> {
    store.try_borrow().map_err(|_| Error::busy("store"))
}

pub(crate) fn write_store(store: &SharedStore) -> Result<RefMut<'_, dyn Store + 'static>> {
    store.try_borrow_mut().map_err(|_| Error::busy("store"))
}

/// A persistent domain object.
pub struct Entity {
    entity_type: Rc<EntityType>,
    uid: Uid,
    schema: Blob,
    flags: FlagSet,
    tags: Record,
    links: BTreeMap<String, Link>,
    active: bool,
    dirty: bool,
    savable: bool,
    deleted: bool,
}

impl Entity {
    pub(crate) fn new(entity_type: Rc<EntityType>, uid: Uid, schema: Blob, spawn: Spawn) -> Self {
        Self {
            entity_type,
            uid,
            schema,
            flags: FlagSet::new(),
            tags: Record::new(),
            links: BTreeMap::new(),
            active: spawn.active,
            dirty: false,
            savable: spawn.savable,
            deleted: false,
        }
    }

    /// Returns the uid.
    #[must_use]
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Returns the concrete type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.entity_type.name()
    }

    /// Returns the type descriptor.
    #[must_use]
    pub fn entity_type(&self) -> &Rc<EntityType> {
        &self.entity_type
    }

    /// Returns the type's durable store, if any.
    #[must_use]
    pub fn store(&self) -> Option<&SharedStore> {
        self.entity_type.store()
    }

    /// Returns the key this entity is stored and cached under.
    #[must_use]
    pub fn key(&self) -> String {
        match self.entity_type.key_spec() {
            KeySpec::Uid => self.uid.to_string(),
            KeySpec::Attribute(name) => self
                .schema
                .get(name)
                .map(|value| value.to_key())
                .unwrap_or_default(),
            KeySpec::Custom { get, .. } => get(self),
        }
    }

    /// Returns true if the entity is in play.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Moves the entity in or out of play.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Returns true if in-memory state has not been saved.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the entity as needing a save.
    pub fn dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Returns true if the entity may be persisted and its type has a store.
    #[must_use]
    pub fn is_savable(&self) -> bool {
        self.savable && self.store().is_some()
    }

    /// Allows or forbids persisting the entity.
    pub fn set_savable(&mut self, savable: bool) {
        self.savable = savable;
    }

    /// Returns true if the entity was deleted and not saved since.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    /// Returns the schema instance.
    #[must_use]
    pub fn schema(&self) -> &Blob {
        &self.schema
    }

    /// Reads a field by dotted path.
    ///
    /// Besides schema fields, `uid`, `type`, `key`, `active`, `dirty`,
    /// `savable`, `flags` and `tags` are readable.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no field has that path.
    pub fn get(&self, path: &str) -> Result<Value> {
        match path {
            "uid" => Ok(Value::from(self.uid.as_str())),
            "type" => Ok(Value::from(self.type_name())),
            "key" => Ok(Value::from(self.key())),
            "active" => Ok(Value::Bool(self.active)),
            "dirty" => Ok(Value::Bool(self.dirty)),
            "savable" => Ok(Value::Bool(self.savable)),
            "flags" => Ok(self.flags.to_value()),
            "tags" => Ok(Value::from(self.tags.clone())),
            _ => self.schema.get(path),
        }
    }

    /// Writes a schema attribute by dotted path and marks the entity dirty.
    ///
    /// Writes to read-only attributes are ignored. Changing the key of an
    /// entity already in its store records the old key for the next save.
    ///
    /// Re-key managed entities with [`EntityManager::set_key`], which checks
    /// the new key is free and moves cache entries. Writing the key
    /// attribute here does neither, and the manager drops the stale cache
    /// entry on its next lookup of the old key.
    ///
    /// [`EntityManager::set_key`]: crate::EntityManager::set_key
    ///
    /// # Errors
    ///
    /// Returns `Usage` for built-in fields, plus any error from the schema.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        if RESERVED_FIELDS.contains(&path) {
            return Err(Error::usage(format!("built-in field '{path}' cannot be set")));
        }
        let before = self.key();
        if self.schema.set(path, value.into())? {
            self.dirty = true;
            self.note_key_change(before);
        }
        Ok(())
    }

    /// Changes the key through the type's key specification.
    pub(crate) fn set_key(&mut self, new_key: &str) -> Result<()> {
        let before = self.key();
        match self.entity_type.key_spec().clone() {
            KeySpec::Uid => {
                return Err(Error::usage(format!(
                    "{} is keyed by uid and cannot be re-keyed",
                    self.type_name()
                )));
            }
            KeySpec::Attribute(name) => {
                if self.schema.set(&name, Value::from(new_key))? {
                    self.dirty = true;
                }
            }
            KeySpec::Custom { set, .. } => set(self, new_key)?,
        }
        self.note_key_change(before);
        Ok(())
    }

    fn note_key_change(&mut self, old_key: String) {
        if self.tags.contains_key(OLD_KEY_TAG) || old_key == self.key() {
            return;
        }
        let stored = self
            .store()
            .and_then(|store| read_store(store).ok().map(|store| store.has(&old_key)))
            .unwrap_or(false);
        if stored {
            debug!(uid = %self.uid, old_key = %old_key, "entity key changed");
            self.tags.insert(OLD_KEY_TAG.to_string(), Value::from(old_key));
        }
    }

    /// Returns the flags.
    #[must_use]
    pub fn flags(&self) -> &FlagSet {
        &self.flags
    }

    /// Sets flags, marking the entity dirty if anything changed.
    pub fn add_flags(&mut self, flags: &[&str]) {
        if self.flags.add(flags) {
            self.dirty = true;
        }
    }

    /// Clears flags, marking the entity dirty if anything changed.
    pub fn drop_flags(&mut self, flags: &[&str]) {
        if self.flags.drop(flags) {
            self.dirty = true;
        }
    }

    /// Flips flags and marks the entity dirty.
    pub fn toggle_flags(&mut self, flags: &[&str]) {
        self.flags.toggle(flags);
        self.dirty = true;
    }

    /// Returns the tags.
    #[must_use]
    pub fn tags(&self) -> &Record {
        &self.tags
    }

    /// Returns one tag.
    #[must_use]
    pub fn tag(&self, name: &str) -> Option<&Value> {
        self.tags.get(name)
    }

    /// Sets a tag and marks the entity dirty.
    pub fn set_tag(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.tags.insert(name.into(), value.into());
        self.dirty = true;
    }

    /// Removes a tag, marking the entity dirty if it was present.
    pub fn remove_tag(&mut self, name: &str) -> Option<Value> {
        let removed = self.tags.remove(name);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub(crate) fn forget_old_key(&mut self) {
        self.tags.remove(OLD_KEY_TAG);
    }

    /// Adds or replaces a named link.
    pub fn set_link(&mut self, name: impl Into<String>, link: Link) {
        self.links.insert(name.into(), link);
    }

    /// Removes a named link.
    pub fn unlink(&mut self, name: &str) -> Option<Link> {
        self.links.remove(name)
    }

    /// Resolves an entity link.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no link has that name and `LinkGone` if the
    /// target was dropped.
    pub fn linked(&self, name: &str) -> Result<EntityRef> {
        self.link(name)?.entity(name)
    }

    /// Resolves an object link to a `T`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no link has that name, `LinkGone` if the target
    /// was dropped and `TypeMismatch` if it is not a `T`.
    pub fn linked_object<T: 'static>(&self, name: &str) -> Result<Rc<T>> {
        self.link(name)?.object(name)
    }

    fn link(&self, name: &str) -> Result<&Link> {
        self.links
            .get(name)
            .ok_or_else(|| Error::not_found("link", name))
    }

    /// Flattens the entity into a record.
    #[must_use]
    pub fn serialize(&self) -> Record {
        let mut record = self.schema.to_record();
        record.insert("type".to_string(), Value::from(self.type_name()));
        record.insert("uid".to_string(), Value::from(self.uid.as_str()));
        record.insert("flags".to_string(), self.flags.to_value());
        record.insert("tags".to_string(), Value::from(self.tags.clone()));
        record
    }

    /// Loads a record over this entity.
    ///
    /// `type` is ignored. `flags` are added to the current flags; `tags`
    /// replace the current tags. Everything else goes to the schema. Either
    /// the whole record applies or nothing does.
    ///
    /// # Errors
    ///
    /// Returns `Consistency` if the record's uid differs from this entity's,
    /// `TypeMismatch` for malformed `flags` or `tags`, and any schema error.
    pub fn deserialize(&mut self, mut record: Record) -> Result<()> {
        record.remove("type");
        if let Some(uid) = record.remove("uid") {
            if uid.as_str() != Some(self.uid.as_str()) {
                return Err(Error::consistency(format!(
                    "record uid {uid} does not match {}",
                    self.uid
                )));
            }
        }
        let flags = match record.remove("flags") {
            None | Some(Value::Nil) => Vec::new(),
            Some(Value::List(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(ToString::to_string)
                        .ok_or_else(|| Error::type_mismatch("flag name", item.value_type()))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => return Err(Error::type_mismatch("flag list", other.value_type())),
        };
        let tags = match record.remove("tags") {
            None => None,
            Some(value @ Value::Map(_)) => value.into_record(),
            Some(other) => return Err(Error::type_mismatch("tag map", other.value_type())),
        };

        self.schema
            .deserialize(record, self.entity_type.unknown_fields())?;
        let flags: Vec<&str> = flags.iter().map(String::as_str).collect();
        self.flags.add(&flags);
        if let Some(tags) = tags {
            self.tags = tags;
        }
        Ok(())
    }

    /// Writes the entity to its store and clears the dirty flag.
    ///
    /// Saving an entity that is not savable logs a warning and does nothing.
    /// A recorded old key is deleted from the store first.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the store is borrowed, plus any store error.
    pub fn save(&mut self) -> Result<()> {
        let Some(store) = self.store().filter(|_| self.savable).cloned() else {
            warn!(uid = %self.uid, "tried to save non-savable entity");
            return Ok(());
        };
        let key = self.key();
        let type_name = self.type_name().to_string();
        let context = || {
            ErrorContext::new()
                .with_type(type_name.as_str())
                .with_key(key.as_str())
                .with_operation("save")
        };
        let mut store = write_store(&store)?;
        if let Some(old_key) = self.tags.get(OLD_KEY_TAG).map(Value::to_key) {
            if old_key != key && store.has(&old_key) {
                store
                    .delete(&old_key)
                    .map_err(|e| e.with_context(context()))?;
                debug!(uid = %self.uid, old_key = %old_key, key = %key, "migrated stored record");
            }
        }
        self.tags.remove(OLD_KEY_TAG);
        store
            .put(&key, self.serialize())
            .map_err(|e| e.with_context(context()))?;
        self.dirty = false;
        self.deleted = false;
        Ok(())
    }

    /// Reloads the stored record over this entity and clears the dirty
    /// flag.
    ///
    /// # Errors
    ///
    /// Returns `Usage` if the type has no store, `NotFound` if nothing is
    /// stored under the key, and `Consistency` if the stored uid differs.
    pub fn revert(&mut self) -> Result<()> {
        let Some(store) = self.store().cloned() else {
            return Err(Error::usage(format!(
                "cannot revert {} with no store",
                self.uid
            )));
        };
        let key = self.key();
        let record = read_store(&store)?.get(&key)?;
        match record.get("uid") {
            Some(uid) if uid.as_str() == Some(self.uid.as_str()) => {}
            _ => {
                return Err(Error::consistency(format!(
                    "uid mismatch trying to revert {}",
                    self.uid
                ))
                .with_context(
                    ErrorContext::new()
                        .with_type(self.type_name())
                        .with_key(key)
                        .with_operation("revert"),
                ));
            }
        }
        self.deserialize(record)?;
        self.dirty = false;
        Ok(())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity<{}>", self.uid)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.type_name(), self.uid)
    }
}
