//! Persistent entities for Reliquary.
//!
//! This crate provides:
//! - [`SchemaRegistry`] - Attribute and blob declarations composed across
//!   type lineages
//! - [`TypeRegistry`] - Entity type descriptors and their inheritance
//! - [`InstanceRegistry`] - Weak indexes of live instances
//! - [`Entity`] - The persistent unit, with flags, tags and weak links
//! - [`EntityManager`] - Construction, caching and multi-tier resolution
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//!
//! use reliquary_entity::{AttributeDef, EntityManager, EntityType, KeySpec, Spawn};
//! use reliquary_foundation::Value;
//! use reliquary_storage::{MemoryBackend, MemoryStore, shared};
//!
//! let store = shared(MemoryStore::new(MemoryBackend::new()));
//! let mut entities = EntityManager::new();
//! entities
//!     .register_type(
//!         EntityType::new("Item")
//!             .with_code("I")
//!             .with_key(KeySpec::Attribute("name".to_string()))
//!             .with_store(Rc::clone(&store)),
//!     )
//!     .unwrap();
//! entities
//!     .register_attribute("Item", "name", AttributeDef::new("thing"))
//!     .unwrap();
//!
//! let sword = entities.create("Item", None, Spawn::new()).unwrap();
//! sword.borrow_mut().set("name", "sword").unwrap();
//! sword.borrow_mut().save().unwrap();
//!
//! assert!(entities.exists("Item", "sword").unwrap());
//! assert_eq!(sword.borrow().get("name").unwrap(), Value::from("sword"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod entity;
pub mod flags;
pub mod instances;
pub mod link;
pub mod manager;
pub mod registry;
pub mod schema;

pub use config::{ManagerConfig, UnknownFields};
pub use entity::{Entity, EntityRef, OLD_KEY_TAG, Spawn, WeakEntity};
pub use flags::FlagSet;
pub use instances::InstanceRegistry;
pub use link::Link;
pub use manager::{EntityManager, FindOptions, LoadFrom, Match, NewKey};
pub use registry::{EntityType, KeyGetter, KeySetter, KeySpec, ROOT_CODE, ROOT_TYPE, TypeRegistry};
pub use schema::{AttributeDef, Blob, BlobDef, FieldDef, RESERVED_FIELDS, SchemaRegistry, Validator};
