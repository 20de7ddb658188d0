//! Session-scoped registry of managed entities.
//!
//! Every entity that enters the save pipeline gets an [`EntityEntry`],
//! indexed by instance identity. Once its identifier is known the entry is
//! also indexed by [`EntityKey`] so that a second instance with the same
//! identity is detected before it can produce a duplicate INSERT.
//!
//! The context is owned by exactly one session and is never shared.

use keel_core::{EntityId, EntityMapping, EntityRef, Error, PersistErrorKind, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// (entity name, identifier) pair.
#[derive(Debug, Clone)]
pub struct EntityKey {
    entity: String,
    id: Value,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: Value) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }

    /// Entity name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Identifier value.
    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.id == other.id
    }
}

// Identifiers are never NaN floats, so value equality is reflexive here.
impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Lifecycle status of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// In the save pipeline, not yet finalized.
    Saving,
    /// Saved (or scheduled for insert) and tracked.
    Managed,
    /// Scheduled for deletion.
    Deleted,
    /// Deleted or abandoned; no longer tracked.
    Gone,
}

impl Status {
    /// Statuses only move forward.
    pub const fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Saving, Status::Managed | Status::Gone)
                | (Status::Managed, Status::Deleted | Status::Gone)
                | (Status::Deleted, Status::Gone)
        )
    }

    /// Backward moves, allowed only while a transaction rolls back.
    pub const fn can_roll_back_to(self, previous: Status) -> bool {
        matches!((self, previous), (Status::Deleted, Status::Managed))
    }
}

/// Lock held on the entity's row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockMode {
    /// No lock.
    #[default]
    None,
    /// The row was read in this transaction.
    Read,
    /// The row was written in this transaction.
    Write,
}

/// Type-keyed bag of additional per-entry state.
#[derive(Default)]
pub struct ExtraState {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ExtraState {
    /// Store `value`, replacing any value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Borrow the value of type `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Mutably borrow the value of type `T`.
    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Is the bag empty?
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Move every value into `target` unless `target` already holds that type.
    pub fn copy_into(self, target: &mut ExtraState) {
        for (type_id, value) in self.values {
            target.values.entry(type_id).or_insert(value);
        }
    }
}

impl fmt::Debug for ExtraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraState")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Bookkeeping attached to one managed entity instance.
#[derive(Debug)]
pub struct EntityEntry {
    status: Status,
    entity: EntityRef,
    mapping: Arc<EntityMapping>,
    id: Option<Value>,
    lock_mode: LockMode,
    identity: bool,
    loaded_state: Option<Vec<Value>>,
    version: Option<Value>,
    exists_in_database: bool,
    extra: ExtraState,
}

impl EntityEntry {
    /// Current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The managed instance.
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Mapping the entity is persisted with.
    pub fn mapping(&self) -> &Arc<EntityMapping> {
        &self.mapping
    }

    /// Identifier, `None` while an identity INSERT is still pending.
    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    /// Lock held on the row.
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Is the identifier assigned by an identity column?
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// State as last written to or read from the database.
    pub fn loaded_state(&self) -> Option<&[Value]> {
        self.loaded_state.as_deref()
    }

    /// Version as last written to or read from the database.
    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    /// Has the row been written?
    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    /// Additional per-entry state.
    pub fn extra(&self) -> &ExtraState {
        &self.extra
    }

    /// Mutable additional per-entry state.
    pub fn extra_mut(&mut self) -> &mut ExtraState {
        &mut self.extra
    }

    /// The key this entry is registered under, once the identifier is known.
    pub fn key(&self) -> Option<EntityKey> {
        self.id
            .as_ref()
            .map(|id| EntityKey::new(self.mapping.name.clone(), id.clone()))
    }

    pub(crate) fn set_status(&mut self, next: Status) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal status transition {:?} -> {:?}",
            self.status,
            next
        );
        self.status = next;
    }

    pub(crate) fn roll_back_status(&mut self, previous: Status) {
        debug_assert!(
            self.status.can_roll_back_to(previous),
            "illegal rollback transition {:?} -> {:?}",
            self.status,
            previous
        );
        self.status = previous;
    }

    /// Record the state the database now holds.
    pub(crate) fn post_write(&mut self, state: Vec<Value>, version: Option<Value>) {
        self.loaded_state = Some(state);
        self.version = version;
        self.exists_in_database = true;
        self.lock_mode = LockMode::Write;
    }
}

/// Outcome of [`PersistenceContext::add_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The entry was created.
    Registered,
    /// The key belongs to an entity whose DELETE is still queued. Nothing was
    /// registered; flush the delete and try again.
    PendingDelete,
}

/// Registry of managed entities, owned by one session.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entries: HashMap<EntityId, EntityEntry>,
    by_key: HashMap<EntityKey, EntityId>,
    cascade_level: usize,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entity`.
    ///
    /// Fails with a duplicate-key error when a different live instance is
    /// registered under the same key.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entry(
        &mut self,
        entity: &EntityRef,
        mapping: &Arc<EntityMapping>,
        status: Status,
        id: Option<Value>,
        lock_mode: LockMode,
        identity: bool,
    ) -> Result<Registration, Error> {
        let key = id
            .as_ref()
            .map(|id| EntityKey::new(mapping.name.clone(), id.clone()));

        if let Some(key) = &key {
            if self.check_key(key, entity)? == Registration::PendingDelete {
                return Ok(Registration::PendingDelete);
            }
        }

        let entry = EntityEntry {
            status,
            entity: entity.clone(),
            mapping: Arc::clone(mapping),
            id,
            lock_mode,
            identity,
            loaded_state: None,
            version: None,
            exists_in_database: false,
            extra: ExtraState::default(),
        };
        self.entries.insert(entity.id(), entry);
        if let Some(key) = key {
            self.by_key.insert(key, entity.id());
        }
        Ok(Registration::Registered)
    }

    /// Can `entity` be registered under `key`?
    ///
    /// `Registered` means the key is free (or already held by `entity`
    /// itself); nothing is registered by this call.
    pub fn check_key(&self, key: &EntityKey, entity: &EntityRef) -> Result<Registration, Error> {
        let Some(holder) = self.by_key.get(key) else {
            return Ok(Registration::Registered);
        };
        if *holder == entity.id() {
            return Ok(Registration::Registered);
        }
        match self.entries.get(holder).map(|e| e.status) {
            Some(Status::Deleted) => Ok(Registration::PendingDelete),
            _ => Err(duplicate_key(key)),
        }
    }

    /// Entry of `entity`, if managed.
    pub fn get_entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.entries.get(&entity.id())
    }

    /// Mutable entry of `entity`, if managed.
    pub fn get_entry_mut(&mut self, entity: &EntityRef) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&entity.id())
    }

    /// Entity registered under `key`.
    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityRef> {
        self.by_key
            .get(key)
            .and_then(|id| self.entries.get(id))
            .map(|entry| entry.entity.clone())
    }

    /// Is `entity` managed?
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.entries.contains_key(&entity.id())
    }

    /// Re-register an entry created without an identifier under its real key.
    ///
    /// A fresh entry replaces the old one; the extra state is carried over.
    pub fn replace_identity_entry(&mut self, entity: &EntityRef, id: Value) -> Result<(), Error> {
        let Some(old) = self.entries.remove(&entity.id()) else {
            return Err(not_managed(entity));
        };
        let key = EntityKey::new(old.mapping.name.clone(), id.clone());
        if let Some(holder) = self.by_key.get(&key) {
            if *holder != entity.id() {
                let err = duplicate_key(&key);
                self.entries.insert(entity.id(), old);
                return Err(err);
            }
        }
        if let Some(old_key) = old.key() {
            self.by_key.remove(&old_key);
        }

        let EntityEntry {
            status,
            entity: handle,
            mapping,
            lock_mode,
            identity,
            loaded_state,
            version,
            exists_in_database,
            extra,
            ..
        } = old;
        let mut replacement = EntityEntry {
            status,
            entity: handle,
            mapping,
            id: Some(id),
            lock_mode,
            identity,
            loaded_state,
            version,
            exists_in_database,
            extra: ExtraState::default(),
        };
        extra.copy_into(&mut replacement.extra);

        tracing::trace!(key = %key, "identity entry replaced under real key");
        self.by_key.insert(key, entity.id());
        self.entries.insert(entity.id(), replacement);
        Ok(())
    }

    /// Remove `entity` from the context.
    pub fn evict(&mut self, entity: &EntityRef) -> Option<EntityEntry> {
        let entry = self.entries.remove(&entity.id())?;
        if let Some(key) = entry.key() {
            if self.by_key.get(&key) == Some(&entity.id()) {
                self.by_key.remove(&key);
            }
        }
        Some(entry)
    }

    /// Mark `entity` as gone and stop tracking it.
    pub fn mark_gone(&mut self, entity: &EntityRef) -> Option<EntityEntry> {
        let mut entry = self.evict(entity)?;
        entry.set_status(Status::Gone);
        Some(entry)
    }

    /// Evict every entry still in `Saving`. Returns how many were removed.
    ///
    /// Invoked by rollback cleanup so an aborted save never leaves a
    /// half-registered entity behind.
    pub fn evict_saving(&mut self) -> usize {
        let saving: Vec<EntityRef> = self
            .entries
            .values()
            .filter(|e| e.status == Status::Saving)
            .map(|e| e.entity.clone())
            .collect();
        for entity in &saving {
            self.evict(entity);
        }
        saving.len()
    }

    /// Undo every pending delete. Returns how many entries were restored.
    pub fn restore_deleted(&mut self) -> usize {
        let mut restored = 0;
        for entry in self.entries.values_mut() {
            if entry.status == Status::Deleted {
                entry.roll_back_status(Status::Managed);
                restored += 1;
            }
        }
        restored
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_key.clear();
        self.cascade_level = 0;
    }

    /// Number of managed entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is nothing managed?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
    }

    /// Enter one cascade level. Returns the new depth.
    pub fn increment_cascade_level(&mut self) -> usize {
        self.cascade_level += 1;
        self.cascade_level
    }

    /// Leave one cascade level. Returns the new depth.
    pub fn decrement_cascade_level(&mut self) -> usize {
        self.cascade_level = self.cascade_level.saturating_sub(1);
        self.cascade_level
    }

    /// Current cascade depth.
    pub fn cascade_level(&self) -> usize {
        self.cascade_level
    }
}

fn duplicate_key(key: &EntityKey) -> Error {
    Error::persist(
        PersistErrorKind::DuplicateKey,
        key.entity(),
        Some(key.id().to_string()),
        "a different object with the same identifier value was already associated with the session",
    )
}

pub(crate) fn not_managed(entity: &EntityRef) -> Error {
    Error::persist(
        PersistErrorKind::NotManaged,
        entity.entity_name(),
        None,
        "entity is not managed by this session",
    )
}
