//! Entity deletion.

use asupersync::{Cx, Outcome};
use keel_core::{AssociationKind, BoxFuture, Connection, EntityRef, Error, PersistErrorKind};
use std::sync::Arc;

use crate::Session;
use crate::action_queue::{DeleteAction, LinkTableOp, MutationAction};
use crate::cascade::{CascadeContext, CascadePoint, CascadeVisits};
use crate::persistence_context::{Status, not_managed};

impl<C: Connection> Session<C> {
    /// Schedule `entity` for deletion.
    ///
    /// Collections cascading deletes are removed first, single-valued
    /// associations after. An entity whose INSERT has not run yet is simply
    /// forgotten.
    pub async fn delete(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        let mut visits = CascadeVisits::new();
        visits.visit(entity.id());
        self.delete_with_context(cx, entity, &mut visits).await
    }

    /// [`Session::delete`] with an explicit cascade context.
    pub fn delete_with_context<'a, X: CascadeContext + 'a>(
        &'a mut self,
        cx: &'a Cx,
        entity: &'a EntityRef,
        visits: &'a mut X,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            let mapping = match self.context.get_entry(entity) {
                Some(entry) if entry.status() == Status::Deleted => return Outcome::Ok(()),
                Some(entry) if entry.status() == Status::Managed => Arc::clone(entry.mapping()),
                _ => return Outcome::Err(not_managed(entity)),
            };

            match self
                .cascade_delete(cx, CascadePoint::AfterInsertBeforeDelete, &mapping, entity, visits)
                .await
            {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }

            if self.queue.has_pending_insert(entity) {
                let discarded = self.queue.discard(entity);
                self.context.mark_gone(entity);
                tracing::debug!(
                    entity = %mapping.name,
                    discarded,
                    "deleted before its insert ran, queued actions discarded"
                );
            } else {
                let Some(entry) = self.context.get_entry_mut(entity) else {
                    return Outcome::Err(not_managed(entity));
                };
                let Some(action) = DeleteAction::for_entry(entry) else {
                    return Outcome::Err(Error::persist(
                        PersistErrorKind::NotManaged,
                        &mapping.name,
                        None,
                        "cannot delete an entity without an identifier",
                    ));
                };
                entry.set_status(Status::Deleted);

                for association in &mapping.associations {
                    if association.kind != AssociationKind::ManyToMany {
                        continue;
                    }
                    if let Some(link) = &association.link {
                        self.queue.add_link(LinkTableOp::UnlinkAll {
                            table: link.table.clone(),
                            owner_column: link.owner_column.clone(),
                            owner_id: action.id.clone(),
                        });
                    }
                }
                tracing::debug!(entity = %mapping.name, id = %action.id, "delete scheduled");
                self.queue.add_action(MutationAction::Delete(action));
            }

            self.cascade_delete(cx, CascadePoint::BeforeInsertAfterDelete, &mapping, entity, visits)
                .await
        })
    }
}
