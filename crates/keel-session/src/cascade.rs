//! Cascading of persistence actions along associations.
//!
//! Single-valued associations cascade before the owner's INSERT (the owner's
//! foreign key needs the target's identifier) and after the owner's DELETE.
//! Collections cascade after the INSERT (the elements reference the owner)
//! and before the DELETE. Cycles are cut by the [`CascadeContext`] visited
//! set and by the persistence context's depth counter.

use asupersync::{Cx, Outcome};
use keel_core::{
    AssociationKind, CascadeAction, Connection, EntityId, EntityMapping, EntityRef, Error,
};
use std::collections::HashSet;
use std::sync::Arc;

use crate::Session;
use crate::persistence_context::Status;

/// Where, relative to the owner's own mutation, a cascade runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePoint {
    /// Before the owner's INSERT, after its DELETE.
    BeforeInsertAfterDelete,
    /// After the owner's INSERT, before its DELETE.
    AfterInsertBeforeDelete,
}

impl CascadePoint {
    /// Does an association of `kind` cascade at this point?
    pub const fn applies_to(self, kind: AssociationKind) -> bool {
        match self {
            CascadePoint::BeforeInsertAfterDelete => kind.is_single_valued(),
            CascadePoint::AfterInsertBeforeDelete => kind.is_collection(),
        }
    }
}

/// State threaded through one cascading operation.
pub trait CascadeContext: Send {
    /// Record a visit to `entity`. Returns `false` if it was already visited.
    fn visit(&mut self, entity: EntityId) -> bool;
}

/// Default [`CascadeContext`]: a set of visited instances.
#[derive(Debug, Default, Clone)]
pub struct CascadeVisits {
    visited: HashSet<EntityId>,
}

impl CascadeVisits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.visited.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.visited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visited.is_empty()
    }
}

impl CascadeContext for CascadeVisits {
    fn visit(&mut self, entity: EntityId) -> bool {
        self.visited.insert(entity)
    }
}

impl<C: Connection> Session<C> {
    /// Cascade a save from `entity` to the associations that cascade at `point`.
    ///
    /// Targets already in the persistence context (including ones mid-save)
    /// are skipped, as is everything past the configured depth.
    pub(crate) async fn cascade_save<X: CascadeContext>(
        &mut self,
        cx: &Cx,
        point: CascadePoint,
        mapping: &Arc<EntityMapping>,
        entity: &EntityRef,
        visits: &mut X,
    ) -> Outcome<(), Error> {
        let depth = self.context.increment_cascade_level();
        let outcome = if depth > self.config.max_cascade_depth {
            tracing::warn!(
                entity = %mapping.name,
                depth,
                "cascade depth limit reached, not cascading further"
            );
            Outcome::Ok(())
        } else {
            self.cascade_save_associations(cx, point, mapping, entity, visits)
                .await
        };
        self.context.decrement_cascade_level();
        outcome
    }

    async fn cascade_save_associations<X: CascadeContext>(
        &mut self,
        cx: &Cx,
        point: CascadePoint,
        mapping: &Arc<EntityMapping>,
        entity: &EntityRef,
        visits: &mut X,
    ) -> Outcome<(), Error> {
        // The owner's foreign key needs the target's identifier right away.
        let requires_immediate_id_access = point == CascadePoint::BeforeInsertAfterDelete;

        for association in mapping.associations.iter().filter(|a| {
            point.applies_to(a.kind) && a.cascade.includes(CascadeAction::SaveUpdate)
        }) {
            for target in entity.association(&association.name).entities() {
                if self.context.contains(&target) || !visits.visit(target.id()) {
                    continue;
                }
                tracing::trace!(
                    owner = %mapping.name,
                    association = %association.name,
                    ?point,
                    "cascading save"
                );
                match self
                    .save_with_generated_id(cx, &target, visits, requires_immediate_id_access)
                    .await
                {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
        Outcome::Ok(())
    }

    /// Cascade a delete from `entity` to the associations that cascade at `point`.
    pub(crate) async fn cascade_delete<X: CascadeContext>(
        &mut self,
        cx: &Cx,
        point: CascadePoint,
        mapping: &Arc<EntityMapping>,
        entity: &EntityRef,
        visits: &mut X,
    ) -> Outcome<(), Error> {
        let depth = self.context.increment_cascade_level();
        let mut outcome = Outcome::Ok(());
        if depth > self.config.max_cascade_depth {
            tracing::warn!(
                entity = %mapping.name,
                depth,
                "cascade depth limit reached, not cascading further"
            );
        } else {
            'associations: for association in mapping.associations.iter().filter(|a| {
                point.applies_to(a.kind) && a.cascade.includes(CascadeAction::Delete)
            }) {
                for target in entity.association(&association.name).entities() {
                    let managed = self
                        .context
                        .get_entry(&target)
                        .is_some_and(|e| e.status() == Status::Managed);
                    if !managed || !visits.visit(target.id()) {
                        continue;
                    }
                    tracing::trace!(
                        owner = %mapping.name,
                        association = %association.name,
                        ?point,
                        "cascading delete"
                    );
                    match self.delete_with_context(cx, &target, visits).await {
                        Outcome::Ok(()) => {}
                        other => {
                            outcome = other;
                            break 'associations;
                        }
                    }
                }
            }
        }
        self.context.decrement_cascade_level();
        outcome
    }
}
