//! The entity manager: type and schema registration, construction, caches
//! and multi-tier resolution.
//!
//! Lookups resolve through three tiers. Live instances are checked first,
//! then the type's bounded caches, then the durable store. Records read from
//! a store are reconstructed into their concrete type and cached. Caches
//! write entries back to the store when capacity pressure evicts them.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;

use reliquary_foundation::{Error, ErrorContext, Record, Result, Type, Uid, UidGenerator, Value};
use reliquary_storage::{BoundedCache, SharedStore};
use tracing::{debug, trace, warn};

use crate::config::ManagerConfig;
use crate::entity::{Entity, EntityRef, OLD_KEY_TAG, Spawn, read_store, write_store};
use crate::instances::InstanceRegistry;
use crate::registry::{EntityType, ROOT_TYPE, TypeRegistry};
use crate::schema::{AttributeDef, Blob, BlobDef, SchemaRegistry};

/// How `find` combines the per-pair comparison results.
#[derive(Debug, Clone, Copy, Default)]
pub enum Match {
    /// Every pair must match.
    #[default]
    All,
    /// At least one pair must match.
    Any,
    /// A caller-supplied reduction.
    Custom(fn(&[bool]) -> bool),
}

impl Match {
    /// Reduces comparison results to a verdict.
    #[must_use]
    pub fn evaluate(&self, results: &[bool]) -> bool {
        match self {
            Self::All => results.iter().all(|&matched| matched),
            Self::Any => results.iter().any(|&matched| matched),
            Self::Custom(reduce) => reduce(results),
        }
    }
}

/// Options for [`EntityManager::find`].
#[derive(Debug, Clone, Copy)]
pub struct FindOptions {
    /// Search live instances.
    pub cache: bool,
    /// Search the durable store.
    pub store: bool,
    /// How pair comparisons combine.
    pub matching: Match,
    /// Maximum number of results. `None` or zero means unbounded.
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Searches everywhere, requiring every pair to match.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cache: true,
            store: true,
            matching: Match::All,
            limit: None,
        }
    }

    /// Sets how pair comparisons combine.
    #[must_use]
    pub const fn matching(mut self, matching: Match) -> Self {
        self.matching = matching;
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the durable store.
    #[must_use]
    pub const fn live_only(mut self) -> Self {
        self.store = false;
        self
    }

    /// Skips live instances.
    #[must_use]
    pub const fn stored_only(mut self) -> Self {
        self.cache = false;
        self
    }

    fn is_full(&self, found: usize) -> bool {
        self.limit.is_some_and(|limit| limit > 0 && found >= limit)
    }
}

impl Default for FindOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Where [`EntityManager::try_load`] may resolve from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadFrom {
    /// Live instances, caches, then the store.
    #[default]
    Anywhere,
    /// The store only. A live instance with the stored uid is reloaded in
    /// place rather than duplicated.
    Store,
}

/// The key a cloned entity is stored under.
pub enum NewKey {
    /// A known key.
    Fixed(String),
    /// A key computed at clone time.
    Generate(Box<dyn FnOnce() -> String>),
}

impl NewKey {
    /// Wraps a key generator.
    #[must_use]
    pub fn generate(generator: impl FnOnce() -> String + 'static) -> Self {
        Self::Generate(Box::new(generator))
    }

    fn resolve(self) -> String {
        match self {
            Self::Fixed(key) => key,
            Self::Generate(generator) => generator(),
        }
    }
}

impl From<&str> for NewKey {
    fn from(key: &str) -> Self {
        Self::Fixed(key.to_string())
    }
}

impl From<String> for NewKey {
    fn from(key: String) -> Self {
        Self::Fixed(key)
    }
}

impl fmt::Debug for NewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(key) => write!(f, "Fixed({key})"),
            Self::Generate(_) => write!(f, "Generate(..)"),
        }
    }
}

type EntityCache = BoundedCache<String, EntityRef>;

/// Per-type runtime state.
struct TypeState {
    instances: InstanceRegistry,
    primary: String,
    caches: BTreeMap<String, EntityCache>,
}

impl TypeState {
    fn new(entity_type: &EntityType, capacity: usize) -> Self {
        let key_spec = entity_type.key_spec();
        let primary = key_spec.name().to_string();
        let mut caches = BTreeMap::new();
        caches.insert(primary.clone(), evicting_cache(capacity));
        Self {
            instances: InstanceRegistry::new(!key_spec.is_uid()),
            primary,
            caches,
        }
    }

    /// Inserts an entity into one cache unless its key is already cached.
    fn cache(&mut self, cache_name: &str, entity: &EntityRef) -> Result<()> {
        let key = cache_key(&*borrow(entity)?, cache_name, &self.primary);
        if let (Some(key), Some(cache)) = (key, self.caches.get_mut(cache_name)) {
            if !cache.contains(key.as_str()) {
                cache.insert(key, Rc::clone(entity));
            }
        }
        Ok(())
    }

    fn cache_everywhere(&mut self, entity: &EntityRef) -> Result<()> {
        let names: Vec<String> = self.caches.keys().cloned().collect();
        for name in &names {
            self.cache(name, entity)?;
        }
        Ok(())
    }

    /// Returns a cached entity if it is still keyed `key`, dropping stale
    /// entries.
    fn cached(&mut self, cache_name: &str, key: &str) -> Result<Option<EntityRef>> {
        let Some(cache) = self.caches.get_mut(cache_name) else {
            return Err(Error::not_found("cache", cache_name));
        };
        let Some(entity) = cache.get(key).cloned() else {
            return Ok(None);
        };
        let current = {
            let inner = borrow(&entity)?;
            if inner.is_deleted() {
                None
            } else {
                cache_key(&*inner, cache_name, &self.primary)
            }
        };
        if current.as_deref() == Some(key) {
            Ok(Some(entity))
        } else {
            cache.remove(key);
            Ok(None)
        }
    }
}

fn evicting_cache(capacity: usize) -> EntityCache {
    BoundedCache::with_eviction(capacity, |key: &String, entity: &EntityRef| {
        save_on_evict(key, entity);
    })
}

/// Best-effort write-back of an evicted entity.
fn save_on_evict(key: &str, entity: &EntityRef) {
    let Ok(mut inner) = entity.try_borrow_mut() else {
        warn!(key, "evicted entity is busy and was not saved");
        return;
    };
    match inner.save() {
        Ok(()) => debug!(key, uid = %inner.uid(), "evicted entity"),
        Err(err) => warn!(key, uid = %inner.uid(), error = %err, "failed to save evicted entity"),
    }
}

/// Compares `pairs` against an entity's current attribute values.
fn live_matches(entity: &Entity, pairs: &[(&str, Value)], matching: Match) -> bool {
    let results: Vec<bool> = pairs
        .iter()
        .map(|(path, value)| entity.get(path).is_ok_and(|actual| actual == *value))
        .collect();
    matching.evaluate(&results)
}

/// The key an entity is filed under in the named cache.
fn cache_key(entity: &Entity, cache_name: &str, primary: &str) -> Option<String> {
    let key = if cache_name == primary {
        entity.key()
    } else {
        match entity.get(cache_name) {
            Ok(Value::Nil) | Err(_) => return None,
            Ok(value) => value.to_key(),
        }
    };
    (!key.is_empty()).then_some(key)
}

fn borrow(entity: &EntityRef) -> Result<std::cell::Ref<'_, Entity>> {
    entity.try_borrow().map_err(|_| Error::busy("entity"))
}

fn borrow_mut(entity: &EntityRef) -> Result<std::cell::RefMut<'_, Entity>> {
    entity.try_borrow_mut().map_err(|_| Error::busy("entity"))
}

/// Looks up a dotted path in a stored record.
fn record_path(record: &Record, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?.clone();
    for segment in segments {
        current = current.as_map()?.get(segment)?.clone();
    }
    Some(current)
}

/// Owns the registries, per-type caches and instance indexes for one world
/// of entities.
///
/// Managers are independent of each other. Everything a manager hands out
/// is confined to the thread that owns it.
pub struct EntityManager {
    config: ManagerConfig,
    types: TypeRegistry,
    schemas: SchemaRegistry,
    states: BTreeMap<String, TypeState>,
    generator: &'static UidGenerator,
}

impl EntityManager {
    /// Creates a manager with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    /// Creates a manager.
    ///
    /// The root type is registered with an integer `version` attribute
    /// defaulting to 1.
    #[must_use]
    pub fn with_config(config: ManagerConfig) -> Self {
        let types = TypeRegistry::new(config.unknown_fields);
        let mut states = BTreeMap::new();
        if let Ok(root) = types.lookup(ROOT_TYPE) {
            states.insert(
                ROOT_TYPE.to_string(),
                TypeState::new(&root, config.cache_capacity),
            );
        }
        let mut schemas = SchemaRegistry::new();
        schemas
            .register_attribute(
                &[ROOT_TYPE.to_string()],
                "version",
                AttributeDef::new(1).with_type(Type::Int),
            )
            .unwrap_or_else(|err| warn!(error = %err, "failed to declare entity version"));
        Self {
            config,
            types,
            schemas,
            states,
            generator: UidGenerator::global(),
        }
    }

    /// Uses a specific uid generator instead of the process-wide one.
    #[must_use]
    pub fn with_generator(mut self, generator: &'static UidGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ---- types and schemas ----

    /// Registers an entity type and creates its primary cache.
    ///
    /// # Errors
    ///
    /// See [`TypeRegistry::register`].
    pub fn register_type(&mut self, entity_type: EntityType) -> Result<Rc<EntityType>> {
        let entity_type = self.types.register(entity_type)?;
        self.states.insert(
            entity_type.name().to_string(),
            TypeState::new(&entity_type, self.config.cache_capacity),
        );
        debug!(entity_type = entity_type.name(), "registered entity type");
        Ok(entity_type)
    }

    /// Looks up a registered type.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types.
    pub fn entity_type(&self, name: &str) -> Result<Rc<EntityType>> {
        self.types.lookup(name)
    }

    /// Iterates registered type names.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.names()
    }

    /// Returns a type's lineage, ancestors first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types.
    pub fn lineage(&self, name: &str) -> Result<Vec<String>> {
        self.types.lineage(name)
    }

    /// Declares an attribute on a type.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types, plus any error from
    /// [`SchemaRegistry::register_attribute`].
    pub fn register_attribute(
        &mut self,
        type_name: &str,
        name: &str,
        def: AttributeDef,
    ) -> Result<()> {
        let lineage = self.types.lineage(type_name)?;
        self.schemas.register_attribute(&lineage, name, def)
    }

    /// Declares a blob on a type.
    ///
    /// # Errors
    ///
    /// See [`EntityManager::register_attribute`].
    pub fn register_blob(&mut self, type_name: &str, name: &str, def: BlobDef) -> Result<()> {
        let lineage = self.types.lineage(type_name)?;
        self.schemas.register_blob(&lineage, name, def)
    }

    /// Returns a fresh copy of a type's composed schema.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types.
    pub fn schema(&mut self, type_name: &str) -> Result<Blob> {
        let lineage = self.types.lineage(type_name)?;
        Ok(self.schemas.template(&lineage))
    }

    /// Adds a cache keyed by another field of the type, filled from the live
    /// instances.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types and `AlreadyExists` if the type
    /// already has a cache with that name.
    pub fn register_cache(&mut self, type_name: &str, field: &str, capacity: usize) -> Result<()> {
        let state = self.state_mut(type_name)?;
        if state.caches.contains_key(field) {
            return Err(Error::already_exists("cache", field));
        }
        state
            .caches
            .insert(field.to_string(), evicting_cache(capacity));
        for entity in state.instances.live() {
            state.cache(field, &entity)?;
        }
        Ok(())
    }

    /// Looks an entity up in one of a type's caches.
    ///
    /// Entries whose field no longer matches `key` are dropped.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown type or cache.
    pub fn cached(&mut self, type_name: &str, cache: &str, key: &str) -> Result<Option<EntityRef>> {
        self.state_mut(type_name)?.cached(cache, key)
    }

    fn state_mut(&mut self, type_name: &str) -> Result<&mut TypeState> {
        self.states
            .get_mut(type_name)
            .ok_or_else(|| Error::not_found("entity type", type_name))
    }

    // ---- construction ----

    /// Builds a new entity, optionally seeded from serialized data.
    ///
    /// A `uid` in the data is adopted, otherwise one is generated. The new
    /// entity is clean, registered as a live instance and cached under every
    /// key not already cached. Nothing is registered if the data is invalid.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types, `AlreadyExists` if a live
    /// instance already has the uid, `TypeMismatch` for a non-string uid,
    /// plus any deserialization error.
    pub fn create(&mut self, type_name: &str, data: Option<Record>, spawn: Spawn) -> Result<EntityRef> {
        let entity_type = self.types.lookup(type_name)?;
        let lineage = self.types.lineage(type_name)?;
        let schema = self.schemas.template(&lineage);
        let mut data = data.unwrap_or_default();
        let uid = match data.remove("uid") {
            None | Some(Value::Nil) => self.generator.next_uid(entity_type.code()),
            Some(Value::String(uid)) => Uid::from(&*uid),
            Some(other) => return Err(Error::type_mismatch("uid string", other.value_type())),
        };
        let state = self.state_mut(type_name)?;
        if state.instances.contains(uid.as_str()) {
            return Err(Error::already_exists("entity", uid.as_str()));
        }

        let mut entity = Entity::new(entity_type, uid, schema, spawn);
        entity.deserialize(data).map_err(|err| {
            err.with_context(
                ErrorContext::new()
                    .with_type(type_name)
                    .with_operation("create"),
            )
        })?;
        entity.mark_clean();

        let entity = Rc::new(RefCell::new(entity));
        state.instances.insert(&entity)?;
        state.cache_everywhere(&entity)?;
        Ok(entity)
    }

    /// Builds an entity of the concrete type named by a record's `type`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `type` is missing, not a string or not a
    /// registered type, plus any error from [`EntityManager::create`].
    pub fn reconstruct(&mut self, record: Record) -> Result<EntityRef> {
        let type_name = match record.get("type") {
            Some(Value::String(name)) => name.to_string(),
            Some(other) => return Err(Error::not_found("entity type", other.to_string())),
            None => return Err(Error::not_found("entity type", "<missing>")),
        };
        self.create(&type_name, Some(record), Spawn::new())
    }

    /// Returns the live instance for a stored record, or reconstructs it
    /// clean. With `refresh`, a live instance is reloaded from the record.
    fn adopt(&mut self, record: Record, refresh: bool) -> Result<EntityRef> {
        match self.live_instance(&record) {
            Some(entity) => {
                if refresh {
                    let mut inner = borrow_mut(&entity)?;
                    inner.deserialize(record)?;
                    inner.mark_clean();
                }
                Ok(entity)
            }
            None => {
                let entity = self.reconstruct(record)?;
                borrow_mut(&entity)?.mark_clean();
                Ok(entity)
            }
        }
    }

    /// The live instance with a record's uid, looked up under the record's
    /// concrete type.
    fn live_instance(&self, record: &Record) -> Option<EntityRef> {
        let type_name = record.get("type").and_then(Value::as_str)?;
        let uid = record.get("uid").and_then(Value::as_str)?;
        self.states.get(type_name)?.instances.get(uid)
    }

    // ---- resolution ----

    /// Finds entities whose fields equal the given values.
    ///
    /// Live instances are scanned first. Every key seen there is skipped in
    /// the store scan that follows, even if it did not match. Store records
    /// that cannot be read are treated as absent. A record whose uid is live
    /// is judged by the live instance's state, not the stored one. Other
    /// matching records are reconstructed clean. Results are unique by uid
    /// and ordered by discovery.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types, `Busy` if a live instance is
    /// mutably borrowed, plus any store or reconstruction error.
    pub fn find(
        &mut self,
        type_name: &str,
        pairs: &[(&str, Value)],
        options: &FindOptions,
    ) -> Result<Vec<EntityRef>> {
        let entity_type = self.types.lookup(type_name)?;
        let mut found = Vec::new();
        let mut seen: HashSet<Uid> = HashSet::new();
        let mut checked: HashSet<String> = HashSet::new();

        if options.cache {
            let live = self.state_mut(type_name)?.instances.live();
            for entity in live {
                let (uid, matched) = {
                    let inner = borrow(&entity)?;
                    if inner.is_deleted() {
                        continue;
                    }
                    checked.insert(inner.key());
                    (inner.uid().clone(), live_matches(&inner, pairs, options.matching))
                };
                if matched && seen.insert(uid) {
                    found.push(entity);
                    if options.is_full(found.len()) {
                        return Ok(found);
                    }
                }
            }
        }

        if !options.store {
            return Ok(found);
        }
        let Some(store) = entity_type.store().cloned() else {
            return Ok(found);
        };
        let keys = read_store(&store)?.keys()?;
        for key in keys {
            if checked.contains(&key) {
                continue;
            }
            let record = match read_store(&store)?.get(&key) {
                Ok(record) => record,
                Err(_) => continue,
            };
            if let Some(entity) = self.live_instance(&record) {
                let (uid, matched) = {
                    let inner = borrow(&entity)?;
                    let matched =
                        !inner.is_deleted() && live_matches(&inner, pairs, options.matching);
                    (inner.uid().clone(), matched)
                };
                if matched && seen.insert(uid) {
                    found.push(entity);
                    if options.is_full(found.len()) {
                        break;
                    }
                }
                continue;
            }
            let results: Vec<bool> = pairs
                .iter()
                .map(|(path, value)| record_path(&record, path).is_some_and(|actual| actual == *value))
                .collect();
            if !options.matching.evaluate(&results) {
                continue;
            }
            let entity = self.adopt(record, false)?;
            let uid = borrow(&entity)?.uid().clone();
            if seen.insert(uid) {
                found.push(entity);
                if options.is_full(found.len()) {
                    break;
                }
            }
        }
        Ok(found)
    }

    /// Finds at most one entity.
    ///
    /// # Errors
    ///
    /// See [`EntityManager::find`].
    pub fn find_one(
        &mut self,
        type_name: &str,
        pairs: &[(&str, Value)],
        options: &FindOptions,
    ) -> Result<Option<EntityRef>> {
        let options = options.limit(1);
        Ok(self.find(type_name, pairs, &options)?.into_iter().next())
    }

    /// Loads an entity by key.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing has the key, plus any error from
    /// [`EntityManager::try_load`].
    pub fn load(&mut self, type_name: &str, key: &str) -> Result<EntityRef> {
        self.try_load(type_name, key, LoadFrom::Anywhere)?
            .ok_or_else(|| Error::not_found("entity", key))
    }

    /// Loads an entity by key, returning `None` on a miss.
    ///
    /// Resolution tries the live instance with that uid (for uid-keyed
    /// types), the primary cache, the live instances' keys (for other
    /// types), then the store. Whatever resolves is put in the primary
    /// cache if its key is not cached yet.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types, `Busy` if a candidate is
    /// mutably borrowed, plus any store or reconstruction error.
    pub fn try_load(&mut self, type_name: &str, key: &str, from: LoadFrom) -> Result<Option<EntityRef>> {
        let entity_type = self.types.lookup(type_name)?;
        if from == LoadFrom::Anywhere {
            if let Some((entity, from_cache)) = self.resolve_live(&entity_type, key)? {
                if !from_cache {
                    let state = self.state_mut(type_name)?;
                    let primary = state.primary.clone();
                    state.cache(&primary, &entity)?;
                }
                return Ok(Some(entity));
            }
        }

        let Some(store) = entity_type.store() else {
            return Ok(None);
        };
        let record = match read_store(store)?.get(key) {
            Ok(record) => record,
            Err(err) if err.is_not_found() => {
                trace!(entity_type = type_name, key, "store miss");
                return Ok(None);
            }
            Err(err) => {
                return Err(err.with_context(
                    ErrorContext::new()
                        .with_type(type_name)
                        .with_key(key)
                        .with_operation("load"),
                ));
            }
        };
        if !record.contains_key("uid") {
            warn!(entity_type = type_name, key, "loaded record has no uid");
        }
        let entity = self.adopt(record, from == LoadFrom::Store)?;
        let state = self.state_mut(type_name)?;
        let primary = state.primary.clone();
        state.cache(&primary, &entity)?;
        Ok(Some(entity))
    }

    /// Resolves a key against live instances and the primary cache. The
    /// flag is true when the cache served the hit.
    fn resolve_live(
        &mut self,
        entity_type: &EntityType,
        key: &str,
    ) -> Result<Option<(EntityRef, bool)>> {
        let uid_keyed = entity_type.key_spec().is_uid();
        let state = self.state_mut(entity_type.name())?;
        if uid_keyed {
            if let Some(entity) = state.instances.get(key) {
                if !borrow(&entity)?.is_deleted() {
                    return Ok(Some((entity, false)));
                }
            }
        }
        let primary = state.primary.clone();
        if let Some(entity) = state.cached(&primary, key)? {
            trace!(entity_type = entity_type.name(), key, "cache hit");
            return Ok(Some((entity, true)));
        }
        trace!(entity_type = entity_type.name(), key, "cache miss");
        if !uid_keyed {
            if let Some(entity) = state.instances.find_by_key(key)? {
                if !borrow(&entity)?.is_deleted() {
                    return Ok(Some((entity, false)));
                }
            }
        }
        Ok(None)
    }

    /// Returns true if the key is stored or held by a live instance.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types and `Busy` on borrow conflicts.
    pub fn exists(&mut self, type_name: &str, key: &str) -> Result<bool> {
        let entity_type = self.types.lookup(type_name)?;
        if let Some(store) = entity_type.store() {
            if read_store(store)?.has(key) {
                return Ok(true);
            }
        }
        let state = self.state_mut(type_name)?;
        let live = if entity_type.key_spec().is_uid() {
            state.instances.get(key)
        } else {
            state.instances.find_by_key(key)?
        };
        match live {
            Some(entity) => Ok(!borrow(&entity)?.is_deleted()),
            None => Ok(false),
        }
    }

    /// Returns the live instances of a type that are in play.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types and `Busy` on borrow conflicts.
    pub fn all(&mut self, type_name: &str) -> Result<Vec<EntityRef>> {
        let mut active = Vec::new();
        for entity in self.instances(type_name)? {
            let keep = {
                let inner = borrow(&entity)?;
                inner.is_active() && !inner.is_deleted()
            };
            if keep {
                active.push(entity);
            }
        }
        Ok(active)
    }

    /// Returns every live instance of a type.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types.
    pub fn instances(&mut self, type_name: &str) -> Result<Vec<EntityRef>> {
        Ok(self.state_mut(type_name)?.instances.live())
    }

    // ---- lifecycle ----

    /// Changes an entity's key and moves its primary cache and key index
    /// entries.
    ///
    /// This is the supported way to re-key an entity. Writing the key
    /// attribute directly leaves stale cache entries behind until a lookup
    /// drops them.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if another stored, cached or live entity holds
    /// `new_key`, `Usage` for uid-keyed types, `Busy` if the entity is
    /// borrowed, plus any attribute error.
    pub fn set_key(&mut self, entity: &EntityRef, new_key: &str) -> Result<()> {
        let (type_name, old_key, uid, uid_keyed, store) = {
            let inner = borrow(entity)?;
            (
                inner.type_name().to_string(),
                inner.key(),
                inner.uid().clone(),
                inner.entity_type().key_spec().is_uid(),
                inner.store().cloned(),
            )
        };
        if !uid_keyed && new_key != old_key {
            let stored = match &store {
                Some(store) => {
                    let store = read_store(store)?;
                    store.has(new_key) && {
                        let record = store.get(new_key)?;
                        record.get("uid").and_then(Value::as_str) != Some(uid.as_str())
                    }
                }
                None => false,
            };
            let entity_type = self.types.lookup(&type_name)?;
            let held = self
                .resolve_live(&entity_type, new_key)?
                .is_some_and(|(other, _)| !Rc::ptr_eq(&other, entity));
            if stored || held {
                return Err(Error::duplicate_key(new_key).with_context(
                    ErrorContext::new()
                        .with_type(type_name)
                        .with_key(new_key)
                        .with_operation("set_key"),
                ));
            }
        }
        borrow_mut(entity)?.set_key(new_key)?;
        let new_key = borrow(entity)?.key();
        if new_key == old_key {
            return Ok(());
        }

        let state = self.state_mut(&type_name)?;
        if let Some(cache) = state.caches.get_mut(&state.primary) {
            if cache
                .peek(old_key.as_str())
                .is_some_and(|cached| Rc::ptr_eq(cached, entity))
            {
                cache.remove(old_key.as_str());
                cache.insert(new_key.clone(), Rc::clone(entity));
            }
        }
        state.instances.rekey(&old_key, entity, &new_key);
        debug!(entity_type = %type_name, old_key = %old_key, new_key = %new_key, "re-keyed entity");
        Ok(())
    }

    /// Creates a copy of an entity under a new key.
    ///
    /// The copy gets a fresh uid and is dirty until saved.
    ///
    /// # Errors
    ///
    /// Returns `Usage` if the type has no store or is keyed by uid, and
    /// `DuplicateKey` if the store already holds the new key.
    pub fn clone_entity(&mut self, entity: &EntityRef, new_key: impl Into<NewKey>) -> Result<EntityRef> {
        let (type_name, store, uid_keyed, mut record) = {
            let inner = borrow(entity)?;
            (
                inner.type_name().to_string(),
                inner.store().cloned(),
                inner.entity_type().key_spec().is_uid(),
                inner.serialize(),
            )
        };
        let Some(store) = store else {
            return Err(Error::usage(format!("cannot clone {type_name} with no store")));
        };
        if uid_keyed {
            return Err(Error::usage(format!(
                "cannot clone {type_name}, which is keyed by uid"
            )));
        }
        let new_key = new_key.into().resolve();
        if read_store(&store)?.has(&new_key) {
            return Err(Error::duplicate_key(new_key));
        }

        record.remove("uid");
        if let Some(Value::Map(tags)) = record.get_mut("tags") {
            tags.remove(OLD_KEY_TAG);
        }
        let copy = self.create(&type_name, Some(record), Spawn::new())?;
        self.set_key(&copy, &new_key)?;
        self.state_mut(&type_name)?.cache_everywhere(&copy)?;
        let mut inner = borrow_mut(&copy)?;
        inner.forget_old_key();
        inner.dirty();
        drop(inner);
        Ok(copy)
    }

    /// Deletes an entity from every cache holding it and from its store.
    ///
    /// The live instance stays registered but is treated as absent by
    /// `exists`, `load` and `find` until it is saved again.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the entity is borrowed, plus any store error.
    pub fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        let (type_name, key, old_key, store) = {
            let inner = borrow(entity)?;
            (
                inner.type_name().to_string(),
                inner.key(),
                inner.tag(OLD_KEY_TAG).map(Value::to_key),
                inner.store().cloned(),
            )
        };
        if let Some(state) = self.states.get_mut(&type_name) {
            for cache in state.caches.values_mut() {
                cache.retain(|_, cached| !Rc::ptr_eq(cached, entity));
            }
        }
        if let Some(store) = store {
            let mut store = write_store(&store)?;
            for stored in std::iter::once(key.as_str()).chain(old_key.as_deref()) {
                if store.has(stored) {
                    store.delete(stored).map_err(|err| {
                        err.with_context(
                            ErrorContext::new()
                                .with_type(type_name.as_str())
                                .with_key(stored)
                                .with_operation("delete"),
                        )
                    })?;
                }
            }
        }
        let mut inner = borrow_mut(entity)?;
        inner.forget_old_key();
        inner.mark_deleted();
        debug!(entity_type = %type_name, key = %key, "deleted entity");
        Ok(())
    }

    /// Saves every live, savable, dirty instance of every type.
    ///
    /// Failures and borrowed entities are logged and skipped. Returns the
    /// number saved.
    pub fn save_all(&mut self) -> usize {
        let mut saved = 0;
        for state in self.states.values_mut() {
            for entity in state.instances.live() {
                let Ok(mut inner) = entity.try_borrow_mut() else {
                    warn!("skipping busy entity during save sweep");
                    continue;
                };
                if inner.is_deleted() || !inner.is_savable() || !inner.is_dirty() {
                    continue;
                }
                match inner.save() {
                    Ok(()) => saved += 1,
                    Err(err) => warn!(uid = %inner.uid(), error = %err, "failed to save entity"),
                }
            }
        }
        debug!(saved, "saved dirty entities");
        saved
    }

    /// Commits every distinct store used by a registered type. Returns the
    /// number of stores committed.
    ///
    /// # Errors
    ///
    /// Returns the first commit failure, or `Busy` if a store is borrowed.
    pub fn commit_stores(&self) -> Result<usize> {
        let mut stores: Vec<SharedStore> = Vec::new();
        for name in self.types.names() {
            let entity_type = self.types.lookup(name)?;
            if let Some(store) = entity_type.store() {
                if !stores.iter().any(|seen| Rc::ptr_eq(seen, store)) {
                    stores.push(Rc::clone(store));
                }
            }
        }
        for store in &stores {
            write_store(store)?.commit()?;
        }
        debug!(stores = stores.len(), "committed stores");
        Ok(stores.len())
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("config", &self.config)
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}
