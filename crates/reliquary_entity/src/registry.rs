//! Entity type descriptors and the type registry.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;

use reliquary_foundation::{Error, Result};
use reliquary_storage::SharedStore;

use crate::config::UnknownFields;
use crate::entity::Entity;

/// Name of the type every lineage roots in.
pub const ROOT_TYPE: &str = "Entity";

/// UID code of the root type.
pub const ROOT_CODE: &str = "E";

/// Reads an entity's key.
pub type KeyGetter = fn(&Entity) -> String;

/// Writes an entity's key.
pub type KeySetter = fn(&mut Entity, &str) -> Result<()>;

/// How a type derives the key its records are stored under.
#[derive(Clone)]
pub enum KeySpec {
    /// The entity's uid.
    Uid,
    /// The value of an attribute, rendered as a string.
    Attribute(String),
    /// A getter/setter pair, cached under `name`.
    Custom {
        /// Cache name for the key.
        name: String,
        /// Reads the key.
        get: KeyGetter,
        /// Writes the key.
        set: KeySetter,
    },
}

impl KeySpec {
    /// Returns the key name, which also names the type's primary cache.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Uid => "uid",
            Self::Attribute(name) | Self::Custom { name, .. } => name,
        }
    }

    /// Returns true for uid keys.
    #[must_use]
    pub const fn is_uid(&self) -> bool {
        matches!(self, Self::Uid)
    }
}

impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uid => write!(f, "Uid"),
            Self::Attribute(name) => write!(f, "Attribute({name})"),
            Self::Custom { name, .. } => write!(f, "Custom({name})"),
        }
    }
}

static UID_KEY: KeySpec = KeySpec::Uid;

/// Descriptor of an entity type.
///
/// Unset settings are inherited from the first base that has them when the
/// type is registered.
#[derive(Clone)]
pub struct EntityType {
    name: String,
    code: Option<String>,
    bases: Vec<String>,
    key: Option<KeySpec>,
    store: Option<SharedStore>,
    unknown_fields: Option<UnknownFields>,
}

impl EntityType {
    /// Creates a type descriptor deriving from [`ROOT_TYPE`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: None,
            bases: Vec::new(),
            key: None,
            store: None,
            unknown_fields: None,
        }
    }

    /// Sets the UID type code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Adds a base type. Bases are walked in the order given.
    #[must_use]
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.bases.push(base.into());
        self
    }

    /// Sets the key specification.
    #[must_use]
    pub fn with_key(mut self, key: KeySpec) -> Self {
        self.key = Some(key);
        self
    }

    /// Sets the durable store.
    #[must_use]
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the unknown field policy.
    #[must_use]
    pub fn with_unknown_fields(mut self, policy: UnknownFields) -> Self {
        self.unknown_fields = Some(policy);
        self
    }

    /// Returns the type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the UID type code.
    #[must_use]
    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or(ROOT_CODE)
    }

    /// Returns the declared bases.
    #[must_use]
    pub fn bases(&self) -> &[String] {
        &self.bases
    }

    /// Returns the key specification.
    #[must_use]
    pub fn key_spec(&self) -> &KeySpec {
        self.key.as_ref().unwrap_or(&UID_KEY)
    }

    /// Returns the durable store, if any.
    #[must_use]
    pub fn store(&self) -> Option<&SharedStore> {
        self.store.as_ref()
    }

    /// Returns the unknown field policy.
    #[must_use]
    pub fn unknown_fields(&self) -> UnknownFields {
        self.unknown_fields.unwrap_or_default()
    }

    fn inherit(&mut self, base: &EntityType) {
        if self.code.is_none() {
            self.code.clone_from(&base.code);
        }
        if self.key.is_none() {
            self.key.clone_from(&base.key);
        }
        if self.store.is_none() {
            self.store.clone_from(&base.store);
        }
        if self.unknown_fields.is_none() {
            self.unknown_fields = base.unknown_fields;
        }
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("code", &self.code())
            .field("bases", &self.bases)
            .field("key", self.key_spec())
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Registered entity types by name.
pub struct TypeRegistry {
    types: BTreeMap<String, Rc<EntityType>>,
}

impl TypeRegistry {
    /// Creates a registry holding only the root type, with the given
    /// default unknown field policy.
    #[must_use]
    pub fn new(unknown_fields: UnknownFields) -> Self {
        let root = EntityType::new(ROOT_TYPE)
            .with_code(ROOT_CODE)
            .with_key(KeySpec::Uid)
            .with_unknown_fields(unknown_fields);
        let mut types = BTreeMap::new();
        types.insert(ROOT_TYPE.to_string(), Rc::new(root));
        Self { types }
    }

    /// Registers a type, resolving inherited settings.
    ///
    /// A type without bases derives from [`ROOT_TYPE`].
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` for a taken name and `TypeMismatch` if a base
    /// is not a registered entity type.
    pub fn register(&mut self, mut entity_type: EntityType) -> Result<Rc<EntityType>> {
        if self.types.contains_key(&entity_type.name) {
            return Err(Error::already_exists("entity type", entity_type.name));
        }
        if entity_type.bases.is_empty() {
            entity_type.bases.push(ROOT_TYPE.to_string());
        }
        let mut bases = Vec::with_capacity(entity_type.bases.len());
        for base in &entity_type.bases {
            let resolved = self
                .types
                .get(base)
                .ok_or_else(|| Error::type_mismatch("registered entity type", base))?;
            bases.push(Rc::clone(resolved));
        }
        for base in &bases {
            entity_type.inherit(base);
        }
        let entity_type = Rc::new(entity_type);
        self.types
            .insert(entity_type.name.clone(), Rc::clone(&entity_type));
        Ok(entity_type)
    }

    /// Looks up a type by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no type has that name.
    pub fn lookup(&self, name: &str) -> Result<Rc<EntityType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("entity type", name))
    }

    /// Returns true if a type has that name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Iterates registered type names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Returns a type and all of its ancestors, ancestors first.
    ///
    /// Bases are walked depth-first in declaration order and each type
    /// appears once, however many paths lead to it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the type is not registered.
    pub fn lineage(&self, name: &str) -> Result<Vec<String>> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        self.walk(name, &mut visited, &mut order)?;
        Ok(order)
    }

    fn walk(&self, name: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) -> Result<()> {
        if !visited.insert(name.to_string()) {
            return Ok(());
        }
        let entity_type = self.lookup(name)?;
        for base in entity_type.bases() {
            self.walk(base, visited, order)?;
        }
        order.push(name.to_string());
        Ok(())
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new(UnknownFields::default())
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.types.values()).finish()
    }
}
