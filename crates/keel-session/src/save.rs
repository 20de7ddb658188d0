//! Save orchestration.
//!
//! One save attempt moves through [`SaveState`]:
//!
//! ```text
//! REQUESTED -> ID_RESOLVED -> ENTRY_REGISTERED -> BEFORE_CASCADED
//!           -> ACTION_ENQUEUED -> AFTER_CASCADED -> FINALIZED
//! ```
//!
//! A lifecycle veto short-circuits to `FINALIZED` before the entry is
//! registered. A failure anywhere in the attempt, including inside a
//! cascaded save, undoes every registration the attempt made: the entries
//! leave the context and their queued actions are dropped. Rows an early
//! identity INSERT already wrote stay in the open transaction, so the
//! session becomes rollback-only.

use asupersync::{Cx, Outcome};
use keel_core::{
    Associated, AssociationKind, BoxFuture, Connection, EntityMapping, EntityRef, Error,
    GenerationEvent, LifecycleVerdict, MappingErrorKind, PersistErrorKind, Value,
};
use std::sync::Arc;

use crate::Session;
use crate::action_queue::{
    ForeignKeyReference, InsertAction, LinkTableOp, MutationAction, execute_insert,
};
use crate::cascade::{CascadeContext, CascadePoint};
use crate::generated::apply_in_memory_generation;
use crate::identifier::{IdentifierGenerationOutcome, IdentifierResolver};
use crate::persistence_context::{EntityKey, LockMode, Registration, Status};

/// Progress of one save attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Requested,
    IdResolved,
    EntryRegistered,
    BeforeCascaded,
    ActionEnqueued,
    AfterCascaded,
    Finalized,
}

fn advance(entity: &str, state: SaveState) {
    tracing::trace!(entity, ?state, "save progressed");
}

impl<C: Connection> Session<C> {
    /// Save `entity`, generating its identifier when it has none.
    ///
    /// Returns the identifier. With an identity column and
    /// `requires_immediate_id_access == false` outside a transaction the
    /// INSERT is delayed to flush and `None` is returned.
    pub fn save_with_generated_id<'a, X: CascadeContext + 'a>(
        &'a mut self,
        cx: &'a Cx,
        entity: &'a EntityRef,
        visits: &'a mut X,
        requires_immediate_id_access: bool,
    ) -> BoxFuture<'a, Outcome<Option<Value>, Error>> {
        Box::pin(async move {
            let mapping = match self.mapping_for(entity) {
                Ok(mapping) => mapping,
                Err(e) => return Outcome::Err(e),
            };
            advance(&mapping.name, SaveState::Requested);

            let resolved =
                IdentifierResolver::resolve(cx, &self.connection, &self.context, &mapping, entity)
                    .await;
            let id = match resolved {
                Outcome::Ok(IdentifierGenerationOutcome::ShortCircuit) => {
                    tracing::trace!(entity = %mapping.name, "already managed, nothing to save");
                    return Outcome::Ok(self.identifier_of(entity));
                }
                Outcome::Ok(IdentifierGenerationOutcome::Value(id)) => Some(id),
                Outcome::Ok(IdentifierGenerationOutcome::PostInsert) => None,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            advance(&mapping.name, SaveState::IdResolved);

            self.perform_save(cx, entity, mapping, id, visits, requires_immediate_id_access)
                .await
        })
    }

    /// Save `entity` under the caller-chosen identifier `id`.
    ///
    /// The mapping's generator is never consulted.
    pub fn save_with_requested_id<'a, X: CascadeContext + 'a>(
        &'a mut self,
        cx: &'a Cx,
        entity: &'a EntityRef,
        id: Value,
        visits: &'a mut X,
    ) -> BoxFuture<'a, Outcome<Option<Value>, Error>> {
        Box::pin(async move {
            let mapping = match self.mapping_for(entity) {
                Ok(mapping) => mapping,
                Err(e) => return Outcome::Err(e),
            };
            if self.context.contains(entity) {
                return Outcome::Ok(self.identifier_of(entity));
            }
            if id.is_null() {
                return Outcome::Err(Error::persist(
                    PersistErrorKind::IdentifierGeneration,
                    &mapping.name,
                    None,
                    "requested identifier is null",
                ));
            }
            advance(&mapping.name, SaveState::IdResolved);
            self.perform_save(cx, entity, mapping, Some(id), visits, true)
                .await
        })
    }

    /// Register `entity`, cascade, and enqueue (or execute) its INSERT.
    ///
    /// `id` is `None` only for identity-column mappings.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, mapping, visits), fields(entity = %mapping.name))]
    pub async fn perform_save<X: CascadeContext>(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        mapping: Arc<EntityMapping>,
        id: Option<Value>,
        visits: &mut X,
        requires_immediate_id_access: bool,
    ) -> Outcome<Option<Value>, Error> {
        // The outermost save owns the attempt; cascaded saves join it.
        let owns_attempt = self.attempt.is_none();
        if owns_attempt {
            self.attempt = Some(Vec::new());
        }
        let outcome = self
            .register_and_save(cx, entity, mapping, id, visits, requires_immediate_id_access)
            .await;
        if owns_attempt {
            let registered = self.attempt.take().unwrap_or_default();
            if !matches!(outcome, Outcome::Ok(_)) {
                self.abort_attempt(&registered);
            }
        }
        outcome
    }

    /// Forget everything a failed attempt registered.
    fn abort_attempt(&mut self, registered: &[EntityRef]) {
        let mut discarded = 0;
        let mut written = 0;
        for entity in registered.iter().rev() {
            discarded += self.queue.discard(entity);
            if let Some(entry) = self.context.mark_gone(entity) {
                if entry.exists_in_database() {
                    written += 1;
                }
            }
            self.created_since_commit.retain(|e| !e.ptr_eq(entity));
        }
        if written > 0 {
            self.rollback_only = true;
            tracing::warn!(written, "aborted save already wrote rows, session is rollback-only");
        }
        tracing::debug!(
            entities = registered.len(),
            discarded,
            "save aborted, attempt undone"
        );
    }

    async fn register_and_save<X: CascadeContext>(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        mapping: Arc<EntityMapping>,
        id: Option<Value>,
        visits: &mut X,
        requires_immediate_id_access: bool,
    ) -> Outcome<Option<Value>, Error> {
        if let Some(id) = &id {
            let key = EntityKey::new(mapping.name.clone(), id.clone());
            match self.context.check_key(&key, entity) {
                Ok(Registration::Registered) => {}
                Ok(Registration::PendingDelete) => {
                    tracing::warn!(
                        key = %key,
                        "identifier belongs to an entity pending deletion, forcing flush"
                    );
                    match self.force_flush(cx).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                    match self.context.check_key(&key, entity) {
                        Ok(Registration::Registered) => {}
                        Ok(Registration::PendingDelete) => {
                            return Outcome::Err(Error::persist(
                                PersistErrorKind::DuplicateKey,
                                &mapping.name,
                                Some(id.to_string()),
                                "pending delete of the previous instance did not complete",
                            ));
                        }
                        Err(e) => return Outcome::Err(e),
                    }
                }
                Err(e) => return Outcome::Err(e),
            }
            entity.set(&mapping.identifier.attribute, id.clone());
        }

        let verdict = entity.write().on_save();
        if verdict == LifecycleVerdict::Veto {
            tracing::debug!(entity = %mapping.name, "save vetoed by lifecycle callback");
            advance(&mapping.name, SaveState::Finalized);
            return Outcome::Ok(id);
        }

        let identity = id.is_none();
        match self.context.add_entry(
            entity,
            &mapping,
            Status::Saving,
            id.clone(),
            LockMode::Write,
            identity,
        ) {
            Ok(Registration::Registered) => {}
            Ok(Registration::PendingDelete) => {
                return Outcome::Err(Error::persist(
                    PersistErrorKind::DuplicateKey,
                    &mapping.name,
                    id.as_ref().map(ToString::to_string),
                    "identifier belongs to an entity pending deletion",
                ));
            }
            Err(e) => return Outcome::Err(e),
        }
        self.created_since_commit.push(entity.clone());
        if let Some(attempt) = &mut self.attempt {
            attempt.push(entity.clone());
        }
        advance(&mapping.name, SaveState::EntryRegistered);

        self.save_registered(cx, entity, &mapping, id, visits, requires_immediate_id_access)
            .await
    }

    async fn save_registered<X: CascadeContext>(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        mapping: &Arc<EntityMapping>,
        id: Option<Value>,
        visits: &mut X,
        requires_immediate_id_access: bool,
    ) -> Outcome<Option<Value>, Error> {
        match self
            .cascade_save(cx, CascadePoint::BeforeInsertAfterDelete, mapping, entity, visits)
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        advance(&mapping.name, SaveState::BeforeCascaded);

        let action = match self.prepare_insert(mapping, entity, id.clone()) {
            Ok(action) => action,
            Err(e) => return Outcome::Err(e),
        };
        let delayed = action.identity && !requires_immediate_id_access && !self.in_transaction;
        let action = action.delayed(delayed);

        let id = if action.identity && !delayed {
            match self.execute_early_insert(cx, action).await {
                Outcome::Ok(id) => Some(id),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            self.queue.add_action(MutationAction::Insert(action));
            id
        };
        if let Some(entry) = self.context.get_entry_mut(entity) {
            entry.set_status(Status::Managed);
        }
        tracing::trace!(entity = %mapping.name, delayed, "insert action enqueued");
        advance(&mapping.name, SaveState::ActionEnqueued);

        match self
            .cascade_save(cx, CascadePoint::AfterInsertBeforeDelete, mapping, entity, visits)
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Err(e) = self.schedule_collection_rows(mapping, entity) {
            return Outcome::Err(e);
        }
        advance(&mapping.name, SaveState::AfterCascaded);

        tracing::debug!(entity = %mapping.name, id = ?id, "entity saved");
        advance(&mapping.name, SaveState::Finalized);
        Outcome::Ok(id)
    }

    /// Build the INSERT from the entity's current state.
    ///
    /// Seeds a null version, runs the interceptor and in-memory generators,
    /// checks nullability and collects the foreign key references.
    #[allow(clippy::result_large_err)]
    fn prepare_insert(
        &self,
        mapping: &Arc<EntityMapping>,
        entity: &EntityRef,
        id: Option<Value>,
    ) -> Result<InsertAction, Error> {
        let mut state = mapping.extract_state(&*entity.read());

        if let Some(index) = mapping.version_index() {
            if state[index].is_null() {
                state[index] = Value::BigInt(0);
                entity.set(&mapping.attributes[index].name, Value::BigInt(0));
            }
        }

        if let Some(interceptor) = &self.interceptor {
            let names = mapping.attribute_names();
            if interceptor.on_save(&mapping.name, id.as_ref(), &mut state, &names) {
                mapping.apply_state(&mut *entity.write(), &state);
            }
        }

        apply_in_memory_generation(mapping, GenerationEvent::Insert, entity, &mut state);

        if self.config.check_nullability {
            check_nullability(mapping, &state)?;
        }

        let mut references = Vec::new();
        for association in &mapping.associations {
            let Some(column) = association.owner_column() else {
                continue;
            };
            match entity.association(&association.name) {
                Associated::One(target) => references.push(ForeignKeyReference {
                    column: column.to_string(),
                    target,
                }),
                _ if !association.optional && self.config.check_nullability => {
                    return Err(Error::persist(
                        PersistErrorKind::TransientReference,
                        &mapping.name,
                        id.as_ref().map(ToString::to_string),
                        format!(
                            "not-null association '{}' references nothing",
                            association.name
                        ),
                    ));
                }
                _ => {}
            }
        }

        Ok(InsertAction::new(
            entity.clone(),
            Arc::clone(mapping),
            id,
            state,
            references,
        ))
    }

    /// Run an identity INSERT now. Queued inserts go first so the row's
    /// foreign keys point at existing rows.
    async fn execute_early_insert(&mut self, cx: &Cx, action: InsertAction) -> Outcome<Value, Error> {
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if self.queue.counts().inserts > 0 {
            match self
                .queue
                .execute_inserts(
                    cx,
                    &self.connection,
                    &mut self.context,
                    &self.metamodel,
                    self.config.batch_size,
                )
                .await
            {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        execute_insert(cx, &self.connection, &mut self.context, &self.metamodel, action).await
    }

    /// Queue link rows and foreign key updates for the collections of a
    /// freshly saved owner.
    #[allow(clippy::result_large_err)]
    fn schedule_collection_rows(
        &mut self,
        mapping: &Arc<EntityMapping>,
        entity: &EntityRef,
    ) -> Result<(), Error> {
        for association in &mapping.associations {
            let elements = match association.kind {
                AssociationKind::ManyToMany | AssociationKind::OneToMany => {
                    entity.association(&association.name).entities()
                }
                _ => continue,
            };
            if elements.is_empty() {
                continue;
            }

            if let Some(link) = &association.link {
                let collection_id = link.collection_id.as_ref().and_then(|id| {
                    self.metamodel
                        .collection_id_generator(&mapping.name, &association.name)
                        .map(|generator| (id.column.clone(), Arc::clone(generator)))
                });
                for element in elements {
                    self.queue.add_link(LinkTableOp::Link {
                        table: link.table.clone(),
                        owner_column: link.owner_column.clone(),
                        owner: entity.clone(),
                        element_column: link.element_column.clone(),
                        element,
                        collection_id: collection_id.clone(),
                    });
                }
                continue;
            }

            let Some(column) = &association.column else {
                continue;
            };
            let target = self.metamodel.mapping(&association.target)?;
            // An element mapping the column itself writes it on insert.
            let written_by_element = target.attributes.iter().any(|a| &a.column == column)
                || target
                    .associations
                    .iter()
                    .any(|a| a.owner_column() == Some(column.as_str()));
            if written_by_element {
                continue;
            }
            for element in elements {
                self.queue.add_link(LinkTableOp::Adopt {
                    table: target.table.clone(),
                    column: column.clone(),
                    id_column: target.identifier.column.clone(),
                    owner: entity.clone(),
                    element,
                });
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn mapping_for(&self, entity: &EntityRef) -> Result<Arc<EntityMapping>, Error> {
        self.metamodel.mapping(&entity.entity_name()).map(Arc::clone)
    }
}

/// A non-nullable, non-generated attribute may not be null at insert time.
#[allow(clippy::result_large_err)]
fn check_nullability(mapping: &EntityMapping, state: &[Value]) -> Result<(), Error> {
    for (attribute, value) in mapping.attributes.iter().zip(state) {
        if attribute.nullable
            || !value.is_null()
            || attribute.is_database_generated_on(GenerationEvent::Insert)
        {
            continue;
        }
        return Err(Error::mapping(
            MappingErrorKind::Invalid,
            &mapping.name,
            format!(
                "not-null property references a null value: {}.{}",
                mapping.name, attribute.name
            ),
        ));
    }
    Ok(())
}
