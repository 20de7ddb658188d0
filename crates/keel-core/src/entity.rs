//! Entities and shared entity handles.
//!
//! The session never owns entity data. Applications hand it [`EntityRef`]
//! handles (`Arc<RwLock<dyn Entity>>`) and the write path reads and writes
//! attributes through the [`Entity`] accessors, so generated identifiers and
//! database-computed columns become visible to every holder of the handle.

use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Result of the `on_save` lifecycle callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleVerdict {
    /// Continue with the insert.
    #[default]
    Proceed,
    /// Skip the insert. Not an error: the save finishes without touching the session.
    Veto,
}

/// The value of an association attribute.
#[derive(Debug, Clone, Default)]
pub enum Associated {
    /// Unset single-valued association or an association the entity does not carry.
    #[default]
    None,
    /// Single-valued association (many-to-one, one-to-one).
    One(EntityRef),
    /// Collection-valued association (one-to-many, many-to-many).
    Many(Vec<EntityRef>),
}

impl Associated {
    /// All referenced entities, in collection order.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            Associated::None => Vec::new(),
            Associated::One(e) => vec![e.clone()],
            Associated::Many(items) => items.clone(),
        }
    }
}

/// An application object the write path can persist.
///
/// Attribute names are the ones used by the entity's mapping.
pub trait Entity: Send + Sync + 'static {
    /// Name of the mapping this entity is persisted with.
    fn entity_name(&self) -> &str;

    /// Read an attribute. Unknown attributes read as `Value::Null`.
    fn get(&self, attribute: &str) -> Value;

    /// Write an attribute.
    fn set(&mut self, attribute: &str, value: Value);

    /// Read an association.
    fn association(&self, _name: &str) -> Associated {
        Associated::None
    }

    /// Lifecycle hook run before the entity is registered for insert.
    fn on_save(&mut self) -> LifecycleVerdict {
        LifecycleVerdict::Proceed
    }
}

/// Identity of an entity instance (pointer identity of its handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(usize);

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<dyn Entity>>);

impl EntityRef {
    /// Wrap an entity in a new shared handle.
    pub fn new<E: Entity>(entity: E) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Instance identity, stable for as long as any handle is alive.
    pub fn id(&self) -> EntityId {
        EntityId(Arc::as_ptr(&self.0).cast::<()>() as usize)
    }

    /// Do both handles point at the same instance?
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Acquire a read guard. A poisoned lock still yields the data.
    pub fn read(&self) -> RwLockReadGuard<'_, dyn Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a write guard. A poisoned lock still yields the data.
    pub fn write(&self) -> RwLockWriteGuard<'_, dyn Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entity name of the instance.
    pub fn entity_name(&self) -> String {
        self.read().entity_name().to_string()
    }

    /// Read one attribute.
    pub fn get(&self, attribute: &str) -> Value {
        self.read().get(attribute)
    }

    /// Write one attribute.
    pub fn set(&self, attribute: &str, value: Value) {
        self.write().set(attribute, value);
    }

    /// Read one association.
    pub fn association(&self, name: &str) -> Associated {
        self.read().association(name)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("entity", &self.read().entity_name())
            .field("id", &self.id())
            .finish()
    }
}

/// A map-backed entity, for callers without a dedicated struct per mapping.
#[derive(Debug, Clone, Default)]
pub struct DynamicEntity {
    name: String,
    attributes: HashMap<String, Value>,
    associations: HashMap<String, Associated>,
    veto: bool,
}

impl DynamicEntity {
    /// Create an empty entity for the mapping `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set an attribute (builder pattern).
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute.into(), value.into());
        self
    }

    /// Set a single-valued association (builder pattern).
    pub fn with_one(mut self, association: impl Into<String>, target: EntityRef) -> Self {
        self.associations
            .insert(association.into(), Associated::One(target));
        self
    }

    /// Set a collection association (builder pattern).
    pub fn with_many(mut self, association: impl Into<String>, items: Vec<EntityRef>) -> Self {
        self.associations
            .insert(association.into(), Associated::Many(items));
        self
    }

    /// Make `on_save` veto the insert.
    pub fn vetoing(mut self) -> Self {
        self.veto = true;
        self
    }

    /// Replace an association after construction.
    pub fn set_association(&mut self, association: impl Into<String>, value: Associated) {
        self.associations.insert(association.into(), value);
    }

    /// Wrap into a shared handle.
    pub fn into_ref(self) -> EntityRef {
        EntityRef::new(self)
    }
}

impl Entity for DynamicEntity {
    fn entity_name(&self) -> &str {
        &self.name
    }

    fn get(&self, attribute: &str) -> Value {
        self.attributes.get(attribute).cloned().unwrap_or(Value::Null)
    }

    fn set(&mut self, attribute: &str, value: Value) {
        self.attributes.insert(attribute.to_string(), value);
    }

    fn association(&self, name: &str) -> Associated {
        self.associations.get(name).cloned().unwrap_or_default()
    }

    fn on_save(&mut self) -> LifecycleVerdict {
        if self.veto {
            LifecycleVerdict::Veto
        } else {
            LifecycleVerdict::Proceed
        }
    }
}
