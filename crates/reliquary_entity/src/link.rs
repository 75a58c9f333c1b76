//! Non-owning links from an entity to other objects.

use std::any::Any;
use std::fmt;
use std::rc::{Rc, Weak};

use reliquary_foundation::{Error, Result};

use crate::entity::{EntityRef, WeakEntity};

/// A weak association. Never keeps its target alive.
#[derive(Clone)]
pub enum Link {
    /// Another entity.
    Entity(WeakEntity),
    /// Any other object, such as a network session.
    Object(Weak<dyn Any>),
}

impl Link {
    /// Links to an entity.
    #[must_use]
    pub fn to_entity(entity: &EntityRef) -> Self {
        Self::Entity(Rc::downgrade(entity))
    }

    /// Links to an arbitrary object.
    #[must_use]
    pub fn to_object<T: Any>(object: &Rc<T>) -> Self {
        let object: Rc<dyn Any> = Rc::clone(object) as Rc<dyn Any>;
        Self::Object(Rc::downgrade(&object))
    }

    /// Returns true while the target is alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Entity(weak) => weak.strong_count() > 0,
            Self::Object(weak) => weak.strong_count() > 0,
        }
    }

    /// Resolves an entity link named `name`.
    ///
    /// # Errors
    ///
    /// Returns `LinkGone` if the entity was dropped and `TypeMismatch` if
    /// the link points at a non-entity.
    pub fn entity(&self, name: &str) -> Result<EntityRef> {
        match self {
            Self::Entity(weak) => weak.upgrade().ok_or_else(|| Error::link_gone(name)),
            Self::Object(_) => Err(Error::type_mismatch("entity link", "object link")),
        }
    }

    /// Resolves an object link named `name` to a `T`.
    ///
    /// # Errors
    ///
    /// Returns `LinkGone` if the object was dropped and `TypeMismatch` if
    /// it is not a `T` or the link points at an entity.
    pub fn object<T: Any>(&self, name: &str) -> Result<Rc<T>> {
        match self {
            Self::Object(weak) => weak
                .upgrade()
                .ok_or_else(|| Error::link_gone(name))?
                .downcast::<T>()
                .map_err(|_| Error::type_mismatch(std::any::type_name::<T>(), "another object")),
            Self::Entity(_) => Err(Error::type_mismatch("object link", "entity link")),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Entity(_) => "Entity",
            Self::Object(_) => "Object",
        };
        write!(f, "Link::{kind}(alive: {})", self.is_alive())
    }
}
