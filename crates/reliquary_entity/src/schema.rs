//! Attribute and blob definitions, and schema composition across lineages.
//!
//! Each entity type declares its own fields in the [`SchemaRegistry`]. The
//! schema an instance actually carries is a [`Blob`] composed from the own
//! fields of every type in its lineage, ancestors first. Composed templates
//! are memoized per type and cloned per instance; attribute definitions are
//! shared between clones.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use reliquary_foundation::{Error, ErrorContext, Record, Result, Type, Value};
use tracing::warn;

use crate::config::UnknownFields;

/// Names every entity carries outside its schema.
pub const RESERVED_FIELDS: [&str; 8] = [
    "uid", "type", "key", "flags", "tags", "active", "dirty", "savable",
];

/// A custom attribute check. May return a sanitized replacement value.
pub type Validator = fn(&Value) -> Result<Value>;

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::usage("field names cannot be empty"));
    }
    if name.contains('.') {
        return Err(Error::usage(format!(
            "field name '{name}' cannot contain '.'"
        )));
    }
    Ok(())
}

/// Definition of a single named value.
#[derive(Clone)]
pub struct AttributeDef {
    default: Value,
    ty: Option<Type>,
    range: Option<(f64, f64)>,
    validator: Option<Validator>,
    read_only: bool,
}

impl AttributeDef {
    /// Creates an unconstrained attribute with the given default.
    #[must_use]
    pub fn new(default: impl Into<Value>) -> Self {
        Self {
            default: default.into(),
            ty: None,
            range: None,
            validator: None,
            read_only: false,
        }
    }

    /// Constrains values to a type.
    #[must_use]
    pub fn with_type(mut self, ty: Type) -> Self {
        self.ty = Some(ty);
        self
    }

    /// Constrains numeric values to an inclusive range.
    #[must_use]
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Adds a custom validator, run after the type and range checks.
    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Makes the attribute ignore writes (bulk loads still apply).
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Returns the default value.
    #[must_use]
    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// Returns the type constraint, if any.
    #[must_use]
    pub fn value_type(&self) -> Option<&Type> {
        self.ty.as_ref()
    }

    /// Returns true if writes are ignored.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Checks `value` for the attribute at `path`, returning the value to
    /// store.
    ///
    /// Integers written to `Float` attributes are stored as floats.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the type, range or validator rejects
    /// the value.
    #[allow(clippy::cast_precision_loss)]
    pub fn validate(&self, path: &str, value: Value) -> Result<Value> {
        let value = match (&self.ty, value) {
            (Some(Type::Float), Value::Int(n)) => Value::Float(n as f64),
            (_, value) => value,
        };
        if let Some(ty) = &self.ty {
            if !ty.admits(&value) {
                return Err(Error::validation(
                    path,
                    format!("expected {ty}, got {}", value.value_type()),
                ));
            }
        }
        if let Some((min, max)) = self.range {
            if !value.is_nil() {
                let Some(n) = value.as_number() else {
                    return Err(Error::validation(path, "expected a number"));
                };
                if n < min || n > max {
                    return Err(Error::validation(
                        path,
                        format!("{n} is outside {min}..={max}"),
                    ));
                }
            }
        }
        match self.validator {
            Some(validator) => validator(&value),
            None => Ok(value),
        }
    }

    fn checked(mut self, name: &str) -> Result<Self> {
        self.default = self
            .validate(name, self.default.clone())
            .map_err(|e| Error::type_mismatch(format!("valid default for {name}"), e))?;
        Ok(self)
    }
}

impl fmt::Debug for AttributeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDef")
            .field("default", &self.default)
            .field("ty", &self.ty)
            .field("range", &self.range)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// A field definition: an attribute or a nested blob.
#[derive(Clone, Debug)]
pub enum FieldDef {
    /// A single value.
    Attribute(AttributeDef),
    /// A nested container.
    Blob(BlobDef),
}

/// An ordered container of field definitions.
#[derive(Clone, Debug, Default)]
pub struct BlobDef {
    fields: Vec<(String, FieldDef)>,
}

impl BlobDef {
    /// Creates an empty blob definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attribute.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for an empty or dotted name, `AlreadyExists` if the
    /// name is taken in this blob, and `TypeMismatch` if the default does
    /// not satisfy the definition.
    pub fn add_attribute(&mut self, name: &str, def: AttributeDef) -> Result<&mut Self> {
        self.add(name, FieldDef::Attribute(def))
    }

    /// Adds a nested blob.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for an empty or dotted name and `AlreadyExists` if
    /// the name is taken in this blob.
    pub fn add_blob(&mut self, name: &str, def: BlobDef) -> Result<&mut Self> {
        self.add(name, FieldDef::Blob(def))
    }

    /// Chaining form of [`BlobDef::add_attribute`].
    ///
    /// # Errors
    ///
    /// See [`BlobDef::add_attribute`].
    pub fn with_attribute(mut self, name: &str, def: AttributeDef) -> Result<Self> {
        self.add_attribute(name, def)?;
        Ok(self)
    }

    /// Chaining form of [`BlobDef::add_blob`].
    ///
    /// # Errors
    ///
    /// See [`BlobDef::add_blob`].
    pub fn with_blob(mut self, name: &str, def: BlobDef) -> Result<Self> {
        self.add_blob(name, def)?;
        Ok(self)
    }

    /// Returns true if a field has that name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    /// Returns the number of direct fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if no fields are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates field definitions in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldDef)> {
        self.fields.iter().map(|(n, f)| (n.as_str(), f))
    }

    fn add(&mut self, name: &str, field: FieldDef) -> Result<&mut Self> {
        check_name(name)?;
        if self.contains(name) {
            return Err(Error::already_exists("field", name));
        }
        let field = match field {
            FieldDef::Attribute(def) => FieldDef::Attribute(def.checked(name)?),
            blob @ FieldDef::Blob(_) => blob,
        };
        self.fields.push((name.to_string(), field));
        Ok(self)
    }
}

#[derive(Clone)]
enum Slot {
    Attribute { def: Rc<AttributeDef>, value: Value },
    Blob(Blob),
}

/// A live schema instance: current values for a tree of fields.
#[derive(Clone, Default)]
pub struct Blob {
    fields: Vec<(String, Slot)>,
}

impl Blob {
    /// Builds an instance holding every default of `def`.
    #[must_use]
    pub fn from_def(def: &BlobDef) -> Self {
        let fields = def
            .fields
            .iter()
            .map(|(name, field)| {
                let slot = match field {
                    FieldDef::Attribute(attr) => Slot::Attribute {
                        value: attr.default.clone(),
                        def: Rc::new(attr.clone()),
                    },
                    FieldDef::Blob(blob) => Slot::Blob(Self::from_def(blob)),
                };
                (name.clone(), slot)
            })
            .collect();
        Self { fields }
    }

    /// Returns the number of top-level fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates top-level field names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Returns true if `path` names a field.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.slot(path).is_some()
    }

    /// Reads the value at a dotted `path`. Blob paths read as maps.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no field has that path.
    pub fn get(&self, path: &str) -> Result<Value> {
        match self.slot(path) {
            Some(Slot::Attribute { value, .. }) => Ok(value.clone()),
            Some(Slot::Blob(blob)) => Ok(blob.serialize()),
            None => Err(Error::not_found("field", path)),
        }
    }

    /// Writes the attribute at a dotted `path`.
    ///
    /// Returns false if the attribute is read-only and the write was
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown paths, `TypeMismatch` when `path`
    /// names a blob, and validation errors from the attribute.
    pub fn set(&mut self, path: &str, value: Value) -> Result<bool> {
        match self.slot_mut(path) {
            Some(Slot::Attribute { def, value: current }) => {
                if def.read_only {
                    return Ok(false);
                }
                *current = def.validate(path, value)?;
                Ok(true)
            }
            Some(Slot::Blob(_)) => Err(Error::type_mismatch("attribute", format!("blob {path}"))),
            None => Err(Error::not_found("field", path)),
        }
    }

    /// Returns the current values as a flat record, blobs as nested maps.
    #[must_use]
    pub fn to_record(&self) -> Record {
        self.fields
            .iter()
            .map(|(name, slot)| {
                let value = match slot {
                    Slot::Attribute { value, .. } => value.clone(),
                    Slot::Blob(blob) => blob.serialize(),
                };
                (name.clone(), value)
            })
            .collect()
    }

    /// Returns the current values as a map value.
    #[must_use]
    pub fn serialize(&self) -> Value {
        Value::from(self.to_record())
    }

    /// Loads values from `data`, bypassing read-only guards.
    ///
    /// Either every value is applied or none is.
    ///
    /// # Errors
    ///
    /// Returns validation errors from attributes, `TypeMismatch` if a blob
    /// field is given something other than a map, and a validation error for
    /// unknown keys under [`UnknownFields::Reject`].
    pub fn deserialize(&mut self, data: Record, policy: UnknownFields) -> Result<()> {
        let mut staged = self.clone();
        staged.load(data, policy, "")?;
        *self = staged;
        Ok(())
    }

    fn load(
        &mut self,
        data: impl IntoIterator<Item = (String, Value)>,
        policy: UnknownFields,
        prefix: &str,
    ) -> Result<()> {
        for (name, value) in data {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            match self.fields.iter_mut().find(|(n, _)| *n == name) {
                Some((_, Slot::Attribute { def, value: current })) => {
                    *current = def.validate(&path, value)?;
                }
                Some((_, Slot::Blob(blob))) => match value {
                    Value::Map(entries) => blob.load(entries, policy, &path)?,
                    other => {
                        return Err(Error::type_mismatch(
                            format!("map for blob {path}"),
                            other.value_type(),
                        ));
                    }
                },
                None => match policy {
                    UnknownFields::Warn => warn!(field = %path, "ignoring unknown field"),
                    UnknownFields::Reject => {
                        return Err(Error::validation(path, "unknown field"));
                    }
                },
            }
        }
        Ok(())
    }

    /// Adds every field of `other` not already present.
    fn merge_missing(&mut self, other: &Blob) {
        for (name, slot) in &other.fields {
            if !self.fields.iter().any(|(n, _)| n == name) {
                self.fields.push((name.clone(), slot.clone()));
            }
        }
    }

    fn slot(&self, path: &str) -> Option<&Slot> {
        let (head, rest) = split_path(path);
        let slot = self.fields.iter().find(|(n, _)| n == head).map(|(_, s)| s)?;
        match (slot, rest) {
            (_, None) => Some(slot),
            (Slot::Blob(blob), Some(rest)) => blob.slot(rest),
            (Slot::Attribute { .. }, Some(_)) => None,
        }
    }

    fn slot_mut(&mut self, path: &str) -> Option<&mut Slot> {
        let (head, rest) = split_path(path);
        let slot = self.fields.iter_mut().find(|(n, _)| n == head).map(|(_, s)| s)?;
        match rest {
            None => Some(slot),
            Some(rest) => match slot {
                Slot::Blob(blob) => blob.slot_mut(rest),
                Slot::Attribute { .. } => None,
            },
        }
    }
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.to_record()).finish()
    }
}

/// Per-type field declarations and memoized composed templates.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    declared: HashMap<String, BlobDef>,
    lineages: HashMap<String, Vec<String>>,
    templates: HashMap<String, Blob>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an attribute on the last type of `lineage`.
    ///
    /// `lineage` is the type's full ancestry in composition order, ending
    /// with the type itself.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is reserved, declared anywhere in
    /// the lineage or declared by a type descending from this one. Returns
    /// `Usage` for bad names and `TypeMismatch` for an invalid definition.
    pub fn register_attribute(
        &mut self,
        lineage: &[String],
        name: &str,
        def: AttributeDef,
    ) -> Result<()> {
        self.register(lineage, name, FieldDef::Attribute(def))
    }

    /// Declares a blob on the last type of `lineage`.
    ///
    /// # Errors
    ///
    /// See [`SchemaRegistry::register_attribute`].
    pub fn register_blob(&mut self, lineage: &[String], name: &str, def: BlobDef) -> Result<()> {
        self.register(lineage, name, FieldDef::Blob(def))
    }

    /// Returns the fields declared directly on a type.
    #[must_use]
    pub fn declared(&self, type_name: &str) -> Option<&BlobDef> {
        self.declared.get(type_name)
    }

    /// Returns the composed template for the last type of `lineage`.
    ///
    /// Each type's own fields are merged in lineage order; the first
    /// declaration of a name wins.
    pub fn template(&mut self, lineage: &[String]) -> Blob {
        let Some(concrete) = lineage.last() else {
            return Blob::default();
        };
        if let Some(template) = self.templates.get(concrete) {
            return template.clone();
        }
        let mut composed = Blob::default();
        for type_name in lineage {
            if let Some(def) = self.declared.get(type_name) {
                composed.merge_missing(&Blob::from_def(def));
            }
        }
        self.templates.insert(concrete.clone(), composed.clone());
        composed
    }

    fn register(&mut self, lineage: &[String], name: &str, field: FieldDef) -> Result<()> {
        check_name(name)?;
        if RESERVED_FIELDS.contains(&name) {
            return Err(Error::already_exists("built-in field", name));
        }
        let Some(owner) = lineage.last() else {
            return Err(Error::usage("cannot declare fields without a type"));
        };
        let taken = lineage
            .iter()
            .filter_map(|t| self.declared.get(t))
            .any(|def| def.contains(name));
        if taken {
            return Err(Error::already_exists("field", name));
        }
        if let Some(descendant) = self.descendant_declaring(owner, name) {
            return Err(Error::already_exists("field", name).with_context(
                ErrorContext::new()
                    .with_type(descendant)
                    .with_operation("declare"),
            ));
        }
        self.lineages.insert(owner.clone(), lineage.to_vec());
        self.declared
            .entry(owner.clone())
            .or_default()
            .add(name, field)?;
        self.templates.clear();
        Ok(())
    }

    /// A type other than `ancestor` whose lineage includes `ancestor` and
    /// which declares `name` itself.
    fn descendant_declaring(&self, ancestor: &str, name: &str) -> Option<String> {
        self.lineages
            .iter()
            .filter(|(type_name, lineage)| {
                type_name.as_str() != ancestor && lineage.iter().any(|t| t == ancestor)
            })
            .find(|(type_name, _)| {
                self.declared
                    .get(type_name.as_str())
                    .is_some_and(|def| def.contains(name))
            })
            .map(|(type_name, _)| type_name.clone())
    }
}
