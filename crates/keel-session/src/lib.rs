//! Persistence context and write path for Keel.
//!
//! `keel-session` turns "make this object graph persistent" into ordered SQL.
//! A [`Session`] owns a connection and a persistence context, and coordinates:
//!
//! - **Identifier resolution**: assigned, identity, sequence, table, increment,
//!   UUID or user-supplied generators ([`identifier`]).
//! - **Registration**: one entry per managed instance, unique per entity key
//!   ([`persistence_context`]).
//! - **Cascading**: single-valued associations are saved before the owner,
//!   collections after it ([`cascade`]).
//! - **Action queue**: inserts in FIFO order, then updates, link rows and
//!   deletes, each with its row count checked ([`action_queue`]).
//! - **Generated values**: database-generated columns are read back after the
//!   write ([`generated`]).
//!
//! # Example
//!
//! ```ignore
//! let metamodel = Arc::new(
//!     Metamodel::builder(Dialect::Postgres)
//!         .entity_with_strategy(customer_mapping(), "sequence")
//!         .entity_with_strategy(order_mapping(), "identity")
//!         .build()?,
//! );
//! let mut session = Session::new(conn, metamodel);
//!
//! // The customer is cascaded and gets its identifier before the order's INSERT
//! let id = session.save(&cx, &order).await?;
//!
//! session.commit(&cx).await?;
//! ```

pub mod action_queue;
pub mod cascade;
mod delete;
pub mod generated;
pub mod identifier;
pub mod metamodel;
pub mod mutation;
pub mod persistence_context;
pub mod save;

#[cfg(test)]
mod test_support;

pub use action_queue::{
    ActionQueue, DeleteAction, Expectation, FlushResult, InsertAction, LinkTableOp,
    MutationAction, PendingCounts, UpdateAction,
};
pub use cascade::{CascadeContext, CascadePoint, CascadeVisits};
pub use generated::{GeneratedValueDescriptor, GeneratedValuesProcessor, ValueResolver};
pub use identifier::{
    AliasPolicy, GeneratorRegistry, IdentifierGenerationOutcome, IdentifierResolver,
    InMemoryGenerator, IncrementGenerator, SequenceGenerator, TableGenerator, UuidGenerator,
};
pub use metamodel::{Metamodel, MetamodelBuilder};
pub use mutation::{BindingExpr, ColumnBinding, MutationKind, TableMutation};
pub use persistence_context::{
    EntityEntry, EntityKey, ExtraState, LockMode, PersistenceContext, Registration, Status,
};
pub use save::SaveState;

use asupersync::{Cx, Outcome};
use keel_core::{
    ConfigError, Connection, EntityRef, Error, TransactionError, TransactionErrorKind, Value,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::persistence_context::not_managed;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Returning `Err` aborts the operation that fired the event.
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes queued actions.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Begin a transaction on flush (or early insert) when none is active.
    pub auto_begin: bool,
    /// Maximum number of identical statements sent in one batch.
    pub batch_size: usize,
    /// Cascades deeper than this are cut off with a warning.
    pub max_cascade_depth: usize,
    /// Reject null values in non-nullable attributes before inserting.
    pub check_nullability: bool,
    /// Execute updates sorted by table and identifier.
    pub order_updates: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            batch_size: 1,
            max_cascade_depth: 64,
            check_nullability: true,
            order_updates: false,
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a JSON document. Missing fields take their defaults.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid session configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }

    #[must_use]
    pub fn with_auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, value: usize) -> Self {
        self.batch_size = value.max(1);
        self
    }

    #[must_use]
    pub fn with_max_cascade_depth(mut self, value: usize) -> Self {
        self.max_cascade_depth = value;
        self
    }

    #[must_use]
    pub fn with_check_nullability(mut self, value: bool) -> Self {
        self.check_nullability = value;
        self
    }

    #[must_use]
    pub fn with_order_updates(mut self, value: bool) -> Self {
        self.order_updates = value;
        self
    }
}

// ============================================================================
// Interceptor
// ============================================================================

/// Application hook into the save path.
pub trait Interceptor: Send + Sync {
    /// Called with the state about to be inserted.
    ///
    /// Return `true` if `state` was modified; it is then written back into
    /// the entity before the INSERT is built.
    fn on_save(
        &self,
        entity: &str,
        id: Option<&Value>,
        state: &mut [Value],
        attribute_names: &[&str],
    ) -> bool {
        let _ = (entity, id, state, attribute_names);
        false
    }
}

// ============================================================================
// Session
// ============================================================================

/// The write-path session.
///
/// Owns a connection, a persistence context and an action queue. Saves
/// register entities and queue their INSERTs; [`Session::flush`] executes the
/// queue inside a transaction; [`Session::commit`] and [`Session::rollback`]
/// end it.
pub struct Session<C: Connection> {
    /// The database connection.
    pub(crate) connection: C,
    /// Validated mappings, shared between sessions.
    pub(crate) metamodel: Arc<Metamodel>,
    /// Session configuration.
    pub(crate) config: SessionConfig,
    /// Whether we're in a transaction.
    pub(crate) in_transaction: bool,
    /// Managed entities.
    pub(crate) context: PersistenceContext,
    /// Queued mutations.
    pub(crate) queue: ActionQueue,
    /// Instances registered since the last commit, evicted on rollback.
    pub(crate) created_since_commit: Vec<EntityRef>,
    /// Instances registered by the top-level save in progress.
    pub(crate) attempt: Option<Vec<EntityRef>>,
    /// An aborted save left rows behind; commit is refused until rollback.
    pub(crate) rollback_only: bool,
    pub(crate) interceptor: Option<Arc<dyn Interceptor>>,
    event_callbacks: SessionEventCallbacks,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("metamodel", &self.metamodel)
            .field("config", &self.config)
            .field("in_transaction", &self.in_transaction)
            .field("rollback_only", &self.rollback_only)
            .field("context", &self.context.len())
            .field("queue", &self.queue.counts())
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a new session with the default configuration.
    pub fn new(connection: C, metamodel: Arc<Metamodel>) -> Self {
        Self::with_config(connection, metamodel, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(connection: C, metamodel: Arc<Metamodel>, config: SessionConfig) -> Self {
        Self {
            connection,
            metamodel,
            config,
            in_transaction: false,
            context: PersistenceContext::new(),
            queue: ActionQueue::new(),
            created_since_commit: Vec::new(),
            attempt: None,
            rollback_only: false,
            interceptor: None,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.metamodel
    }

    /// The persistence context, read-only.
    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    /// Register a callback to run before flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit. Returning `Err` aborts the commit.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    /// Install the save interceptor, replacing any previous one.
    pub fn set_interceptor(&mut self, interceptor: impl Interceptor + 'static) {
        self.interceptor = Some(Arc::new(interceptor));
    }

    // ========================================================================
    // Saving
    // ========================================================================

    /// Make `entity` persistent and return its identifier.
    ///
    /// The identifier is always available on return: identity-column
    /// mappings execute their INSERT immediately.
    pub async fn save(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<Option<Value>, Error> {
        let mut visits = CascadeVisits::new();
        visits.visit(entity.id());
        self.save_with_generated_id(cx, entity, &mut visits, true)
            .await
    }

    /// Make `entity` persistent without requiring its identifier.
    ///
    /// Outside a transaction an identity INSERT waits for the next flush.
    pub async fn persist(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        let mut visits = CascadeVisits::new();
        visits.visit(entity.id());
        match self
            .save_with_generated_id(cx, entity, &mut visits, false)
            .await
        {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Make `entity` persistent under the identifier `id`.
    pub async fn save_with_id(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        id: Value,
    ) -> Outcome<Option<Value>, Error> {
        let mut visits = CascadeVisits::new();
        visits.visit(entity.id());
        self.save_with_requested_id(cx, entity, id, &mut visits)
            .await
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Ok(());
        }

        match self.connection.execute(cx, "BEGIN", &[]).await {
            Outcome::Ok(_) => {
                self.in_transaction = true;
                tracing::debug!("transaction started");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Begin a transaction if configured to and none is active.
    pub(crate) async fn ensure_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.config.auto_begin && !self.in_transaction {
            return self.begin(cx).await;
        }
        Outcome::Ok(())
    }

    /// Execute every queued action.
    ///
    /// Managed entities are dirty-checked against their last written state
    /// first; changed ones get an UPDATE. Does NOT commit.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let scheduled = match self.schedule_updates() {
            Ok(scheduled) => scheduled,
            Err(e) => return Outcome::Err(e),
        };
        let pending = self.queue.counts();
        tracing::debug!(
            inserts = pending.inserts,
            updates = pending.updates,
            links = pending.links,
            deletes = pending.deletes,
            dirty = scheduled,
            "flushing"
        );

        let result = match self.execute_actions(cx).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }

        tracing::debug!(
            inserted = result.inserted,
            updated = result.updated,
            linked = result.linked,
            deleted = result.deleted,
            "flush complete"
        );
        Outcome::Ok(result)
    }

    /// Queue an UPDATE for every managed entity whose state changed.
    #[allow(clippy::result_large_err)]
    fn schedule_updates(&mut self) -> Result<usize, Error> {
        let mut updates: Vec<UpdateAction> = Vec::new();
        for entry in self
            .context
            .entries()
            .filter(|entry| entry.status() == Status::Managed && entry.exists_in_database())
        {
            let current = entry.mapping().extract_state(&*entry.entity().read());
            if let Some(action) = UpdateAction::from_dirty_state(entry, current)? {
                updates.push(action);
            }
        }

        let count = updates.len();
        for action in updates {
            tracing::trace!(entity = %action.mapping.name, id = %action.id, "dirty, update scheduled");
            self.queue.add_action(MutationAction::Update(action));
        }
        Ok(count)
    }

    /// Drain the queue: inserts, updates, link rows, deletes.
    async fn execute_actions(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let batch_size = self.config.batch_size;
        let mut result = FlushResult::default();

        result.inserted = match self
            .queue
            .execute_inserts(cx, &self.connection, &mut self.context, &self.metamodel, batch_size)
            .await
        {
            Outcome::Ok(n) => n,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        result.updated = match self
            .queue
            .execute_updates(
                cx,
                &self.connection,
                &mut self.context,
                &self.metamodel,
                batch_size,
                self.config.order_updates,
            )
            .await
        {
            Outcome::Ok(n) => n,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        result.linked = match self
            .queue
            .execute_links(cx, &self.connection, &self.context, &self.metamodel)
            .await
        {
            Outcome::Ok(n) => n,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        result.deleted = match self
            .queue
            .execute_deletes(cx, &self.connection, &mut self.context, batch_size)
            .await
        {
            Outcome::Ok(n) => n,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        Outcome::Ok(result)
    }

    /// Flush forced by the save path, without firing flush events.
    pub(crate) async fn force_flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            other => return other,
        }
        match self.execute_actions(cx).await {
            Outcome::Ok(result) => {
                tracing::debug!(executed = result.total(), "forced flush complete");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Flush and commit the current transaction.
    ///
    /// Refused while the session is rollback-only.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.rollback_only {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::RollbackOnly,
                message: "an aborted save wrote rows in this transaction, roll back first"
                    .to_string(),
            }));
        }

        let result = match self.flush(cx).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        // Fire before_commit event (can abort)
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        if self.in_transaction {
            match self.connection.execute(cx, "COMMIT", &[]).await {
                Outcome::Ok(_) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.created_since_commit.clear();

        tracing::info!(
            statements = result.total(),
            managed = self.context.len(),
            "transaction committed"
        );

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }

    /// Roll back the current transaction.
    ///
    /// Queued actions are dropped, entities registered since the last commit
    /// are evicted and entities scheduled for deletion are managed again.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            match self.connection.execute(cx, "ROLLBACK", &[]).await {
                Outcome::Ok(_) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let discarded = self.queue.len();
        self.queue.clear();
        self.rollback_only = false;
        self.attempt = None;
        let mut evicted = 0;
        for entity in std::mem::take(&mut self.created_since_commit) {
            if self.context.evict(&entity).is_some() {
                evicted += 1;
            }
        }
        evicted += self.context.evict_saving();
        let restored = self.context.restore_deleted();

        tracing::info!(discarded, evicted, restored, "transaction rolled back");

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }

    // ========================================================================
    // Managed Entities
    // ========================================================================

    /// Detach `entity` from the session, dropping its queued actions.
    #[allow(clippy::result_large_err)]
    pub fn evict(&mut self, entity: &EntityRef) -> Result<(), Error> {
        if !self.context.contains(entity) {
            return Err(not_managed(entity));
        }
        let discarded = self.queue.discard(entity);
        self.context.evict(entity);
        tracing::debug!(entity = %entity.entity_name(), discarded, "entity evicted");
        Ok(())
    }

    /// Is `entity` managed by this session?
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.context.contains(entity)
    }

    /// Status of `entity`'s entry, if it has one.
    pub fn entry_status(&self, entity: &EntityRef) -> Option<Status> {
        self.context.get_entry(entity).map(EntityEntry::status)
    }

    /// Identifier of a managed entity. `None` while a delayed identity
    /// INSERT is pending.
    pub fn identifier_of(&self, entity: &EntityRef) -> Option<Value> {
        self.context.get_entry(entity).and_then(|e| e.id().cloned())
    }

    /// Identifier of a managed entity, executing queued inserts first if the
    /// entity's own INSERT is still pending.
    pub async fn resolve_identifier(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
    ) -> Outcome<Option<Value>, Error> {
        if !self.context.contains(entity) {
            return Outcome::Err(not_managed(entity));
        }
        if self.identifier_of(entity).is_none() && self.queue.has_pending_insert(entity) {
            match self.ensure_transaction(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
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
        Outcome::Ok(self.identifier_of(entity))
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    /// Whether a transaction is active.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Whether only [`Session::rollback`] can end the transaction.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Number of queued actions by kind.
    pub fn pending_counts(&self) -> PendingCounts {
        self.queue.counts()
    }

    /// Number of entries in the persistence context.
    pub fn managed_count(&self) -> usize {
        self.context.len()
    }

    /// Get a snapshot of the session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            managed: self.context.len(),
            pending: self.queue.counts(),
            in_transaction: self.in_transaction,
            rollback_only: self.rollback_only,
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone)]
pub struct SessionDebugInfo {
    /// Entries in the persistence context.
    pub managed: usize,
    /// Queued actions.
    pub pending: PendingCounts,
    /// Whether a transaction is active.
    pub in_transaction: bool,
    /// Whether only a rollback can end the transaction.
    pub rollback_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockConnection, block_on, int_row, unwrap_outcome};
    use keel_core::{
        Associated, AssociationMapping, AttributeMapping, CascadeStyle, Dialect, DynamicEntity,
        Entity, EntityMapping, IdentifierGenerator, IdentifierMapping, IdentifierStrategy,
        LifecycleVerdict, LinkTable, MappingErrorKind,
    };
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn widget() -> EntityMapping {
        EntityMapping::new(
            "Widget",
            "widgets",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned),
        )
        .attribute(AttributeMapping::new("name", "name"))
    }

    fn session_for(
        conn: &MockConnection,
        mappings: Vec<EntityMapping>,
        config: SessionConfig,
    ) -> Session<MockConnection> {
        let builder = mappings
            .into_iter()
            .fold(Metamodel::builder(Dialect::Postgres), MetamodelBuilder::entity);
        Session::with_config(conn.clone(), Arc::new(builder.build().unwrap()), config)
    }

    fn sequence(name: &str) -> IdentifierStrategy {
        IdentifierStrategy::Generated(Arc::new(SequenceGenerator::new(name)))
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_begin);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_cascade_depth, 64);
        assert!(config.check_nullability);
        assert!(!config.order_updates);
    }

    #[test]
    fn test_session_config_from_json() {
        let config = SessionConfig::from_json(r#"{"batch_size": 25, "order_updates": true}"#).unwrap();
        assert_eq!(config, SessionConfig::default().with_batch_size(25).with_order_updates(true));

        let err = SessionConfig::from_json(r#"{"batch_size": "many"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_assigned_identifier_never_invokes_generator() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let generator: Arc<dyn IdentifierGenerator> =
            Arc::new(InMemoryGenerator::new("counter", move |_: &EntityRef| {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(Value::BigInt(99))
            }));
        let mapping = EntityMapping::new(
            "Widget",
            "widgets",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Generated(generator)),
        )
        .attribute(AttributeMapping::new("name", "name"));
        let mut session = session_for(&conn, vec![mapping], SessionConfig::default());

        let entity = DynamicEntity::new("Widget").with("id", 7_i64).with("name", "gear").into_ref();
        let id = unwrap_outcome(block_on(session.save(&cx, &entity)));

        assert_eq!(id, Some(Value::BigInt(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let key = EntityKey::new("Widget", Value::BigInt(7));
        assert!(session.context().get_entity(&key).unwrap().ptr_eq(&entity));
    }

    #[test]
    fn test_sequence_identifier_registers_and_inserts_once() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("nextval('e_seq')", vec![int_row("nextval", 42)]);
        let mapping = EntityMapping::new("E", "e", IdentifierMapping::new("id", "id", sequence("e_seq")))
            .attribute(AttributeMapping::new("label", "label"));
        let mut session = session_for(&conn, vec![mapping], SessionConfig::default());

        let entity = DynamicEntity::new("E").with("label", "x").into_ref();
        let id = unwrap_outcome(block_on(session.save(&cx, &entity)));
        assert_eq!(id, Some(Value::BigInt(42)));
        assert_eq!(session.managed_count(), 1);
        assert_eq!(session.entry_status(&entity), Some(Status::Managed));
        assert_eq!(session.pending_counts().inserts, 1);
        assert!(conn.statements().is_empty());

        let result = unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(result.inserted, 1);
        let inserts: Vec<_> = conn
            .executed()
            .into_iter()
            .filter(|(sql, _)| sql.starts_with("INSERT"))
            .collect();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].1[0], Value::BigInt(42));
        assert_eq!(entity.get("id"), Value::BigInt(42));
    }

    #[test]
    fn test_delayed_identity_insert_waits_for_flush() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.set_next_key(500);
        let mapping = EntityMapping::new(
            "Note",
            "notes",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Identity),
        )
        .attribute(AttributeMapping::new("body", "body"));
        let mut session = session_for(&conn, vec![mapping], SessionConfig::default());

        let note = DynamicEntity::new("Note").with("body", "hi").into_ref();
        unwrap_outcome(block_on(session.persist(&cx, &note)));
        assert!(session.contains(&note));
        assert_eq!(session.identifier_of(&note), None);
        assert!(conn.executed().is_empty());

        unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(session.identifier_of(&note), Some(Value::BigInt(500)));
        assert_eq!(note.get("id"), Value::BigInt(500));
        let key = EntityKey::new("Note", Value::BigInt(500));
        assert!(session.context().get_entity(&key).unwrap().ptr_eq(&note));
        assert!(conn.statements()[0].starts_with("INSERT INTO \"notes\" (\"body\")"));
    }

    #[test]
    fn test_identity_with_immediate_access_inserts_on_save() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.set_next_key(9);
        let mapping = EntityMapping::new(
            "Note",
            "notes",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Identity),
        )
        .attribute(AttributeMapping::new("body", "body"));
        let mut session = session_for(&conn, vec![mapping], SessionConfig::default());

        let note = DynamicEntity::new("Note").with("body", "hi").into_ref();
        let id = unwrap_outcome(block_on(session.save(&cx, &note)));

        assert_eq!(id, Some(Value::BigInt(9)));
        assert!(session.in_transaction());
        assert_eq!(session.pending_counts().total(), 0);
        let executed: Vec<String> = conn.executed().into_iter().map(|(sql, _)| sql).collect();
        assert_eq!(executed[0], "BEGIN");
        assert!(executed[1].starts_with("INSERT INTO \"notes\""));
    }

    #[test]
    fn test_resolve_identifier_executes_pending_identity_insert() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.set_next_key(3);
        let mapping = EntityMapping::new(
            "Note",
            "notes",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Identity),
        );
        let mut session = session_for(&conn, vec![mapping], SessionConfig::default());

        let note = DynamicEntity::new("Note").into_ref();
        unwrap_outcome(block_on(session.persist(&cx, &note)));
        let id = unwrap_outcome(block_on(session.resolve_identifier(&cx, &note)));
        assert_eq!(id, Some(Value::BigInt(3)));
        assert_eq!(session.pending_counts().inserts, 0);

        let stranger = DynamicEntity::new("Note").into_ref();
        match block_on(session.resolve_identifier(&cx, &stranger)) {
            Outcome::Err(e) => assert!(e.to_string().contains("not managed")),
            other => std::panic::panic_any(format!("expected error, got {other:?}")),
        }
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());

        let first = DynamicEntity::new("Widget").with("id", 1_i64).with("name", "a").into_ref();
        let second = DynamicEntity::new("Widget").with("id", 1_i64).with("name", "b").into_ref();
        unwrap_outcome(block_on(session.save(&cx, &first)));

        match block_on(session.save(&cx, &second)) {
            Outcome::Err(e) => assert!(e.is_duplicate_key()),
            other => std::panic::panic_any(format!("expected duplicate key, got {other:?}")),
        }
        assert!(session.contains(&first));
        assert!(!session.contains(&second));
        assert_eq!(session.pending_counts().inserts, 1);
    }

    #[test]
    fn test_key_of_pending_delete_forces_flush() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());

        let old = DynamicEntity::new("Widget").with("id", 1_i64).with("name", "old").into_ref();
        unwrap_outcome(block_on(session.save(&cx, &old)));
        unwrap_outcome(block_on(session.flush(&cx)));
        unwrap_outcome(block_on(session.delete(&cx, &old)));
        assert_eq!(session.entry_status(&old), Some(Status::Deleted));

        let new = DynamicEntity::new("Widget").with("id", 1_i64).with("name", "new").into_ref();
        let id = unwrap_outcome(block_on(session.save(&cx, &new)));
        assert_eq!(id, Some(Value::BigInt(1)));
        assert!(!session.contains(&old));
        assert!(session.contains(&new));

        unwrap_outcome(block_on(session.commit(&cx)));
        let statements = conn.statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("INSERT"));
        assert!(statements[1].starts_with("DELETE FROM \"widgets\""));
        assert!(statements[2].starts_with("INSERT"));
    }

    fn customer() -> EntityMapping {
        EntityMapping::new(
            "Customer",
            "customers",
            IdentifierMapping::new("id", "id", sequence("customer_seq")),
        )
        .attribute(AttributeMapping::new("name", "name"))
    }

    fn order() -> EntityMapping {
        EntityMapping::new("Order", "orders", IdentifierMapping::new("id", "id", sequence("order_seq")))
            .attribute(AttributeMapping::new("status", "status"))
            .association(
                AssociationMapping::many_to_one("customer", "Customer", "customer_id")
                    .cascade(CascadeStyle::ALL)
                    .required(),
            )
            .association(
                AssociationMapping::one_to_many("lines", "OrderLine", "order_id")
                    .cascade(CascadeStyle::ALL),
            )
    }

    fn order_line() -> EntityMapping {
        EntityMapping::new(
            "OrderLine",
            "order_lines",
            IdentifierMapping::new("id", "id", sequence("line_seq")),
        )
        .attribute(AttributeMapping::new("qty", "qty"))
    }

    #[test]
    fn test_cascade_orders_inserts_by_foreign_keys() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("nextval('customer_seq')", vec![int_row("nextval", 10)]);
        conn.respond("nextval('order_seq')", vec![int_row("nextval", 20)]);
        conn.respond("nextval('line_seq')", vec![int_row("nextval", 30)]);
        conn.respond("nextval('line_seq')", vec![int_row("nextval", 31)]);
        let mut session = session_for(
            &conn,
            vec![customer(), order(), order_line()],
            SessionConfig::default(),
        );

        let customer = DynamicEntity::new("Customer").with("name", "Ada").into_ref();
        let lines: Vec<EntityRef> = (1..=2_i64)
            .map(|qty| DynamicEntity::new("OrderLine").with("qty", qty).into_ref())
            .collect();
        let order = DynamicEntity::new("Order")
            .with("status", "open")
            .with_one("customer", customer.clone())
            .with_many("lines", lines.clone())
            .into_ref();

        let id = unwrap_outcome(block_on(session.save(&cx, &order)));
        assert_eq!(id, Some(Value::BigInt(20)));
        assert_eq!(customer.get("id"), Value::BigInt(10));
        assert_eq!(lines[1].get("id"), Value::BigInt(31));
        assert_eq!(session.managed_count(), 4);
        assert_eq!(session.pending_counts().links, 2);

        unwrap_outcome(block_on(session.flush(&cx)));
        let executed = conn.executed();
        let inserts: Vec<&(String, Vec<Value>)> = executed
            .iter()
            .filter(|(sql, _)| sql.starts_with("INSERT"))
            .collect();
        assert_eq!(inserts.len(), 4);
        assert!(inserts[0].0.starts_with("INSERT INTO \"customers\""));
        assert!(inserts[1].0.starts_with("INSERT INTO \"orders\""));
        assert_eq!(
            inserts[1].1,
            vec![Value::BigInt(20), Value::from("open"), Value::BigInt(10)]
        );
        assert!(inserts[2].0.starts_with("INSERT INTO \"order_lines\""));
        assert_eq!(inserts[2].1, vec![Value::BigInt(30), Value::BigInt(1)]);

        // Lines do not map the foreign key, so it is written after the inserts
        let adopts: Vec<&(String, Vec<Value>)> = executed
            .iter()
            .filter(|(sql, _)| sql.starts_with("UPDATE \"order_lines\" SET \"order_id\""))
            .collect();
        assert_eq!(adopts.len(), 2);
        assert_eq!(adopts[0].1, vec![Value::BigInt(20), Value::BigInt(30)]);
        let last_insert = executed.iter().rposition(|(sql, _)| sql.starts_with("INSERT")).unwrap();
        let first_adopt = executed.iter().position(|(sql, _)| sql.starts_with("UPDATE")).unwrap();
        assert!(last_insert < first_adopt);
    }

    #[test]
    fn test_missing_required_association_aborts_save() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("nextval('order_seq')", vec![int_row("nextval", 20)]);
        let mut session = session_for(
            &conn,
            vec![customer(), order(), order_line()],
            SessionConfig::default(),
        );

        let order = DynamicEntity::new("Order").with("status", "open").into_ref();
        match block_on(session.save(&cx, &order)) {
            Outcome::Err(e) => assert!(e.to_string().contains("customer")),
            other => std::panic::panic_any(format!("expected error, got {other:?}")),
        }
        assert!(!session.contains(&order));
        assert_eq!(session.pending_counts().total(), 0);
    }

    /// Entity whose `next` association can be repointed after creation,
    /// counting its `on_save` calls.
    #[derive(Debug)]
    struct Node {
        id: Value,
        label: Value,
        next: Arc<Mutex<Option<EntityRef>>>,
        saves: Arc<AtomicUsize>,
    }

    impl Entity for Node {
        fn entity_name(&self) -> &str {
            "Node"
        }

        fn get(&self, attribute: &str) -> Value {
            match attribute {
                "id" => self.id.clone(),
                "label" => self.label.clone(),
                _ => Value::Null,
            }
        }

        fn set(&mut self, attribute: &str, value: Value) {
            match attribute {
                "id" => self.id = value,
                "label" => self.label = value,
                _ => {}
            }
        }

        fn association(&self, name: &str) -> Associated {
            match (name, self.next.lock().unwrap().clone()) {
                ("next", Some(target)) => Associated::One(target),
                _ => Associated::None,
            }
        }

        fn on_save(&mut self) -> LifecycleVerdict {
            self.saves.fetch_add(1, Ordering::SeqCst);
            LifecycleVerdict::Proceed
        }
    }

    fn node_mapping() -> EntityMapping {
        EntityMapping::new("Node", "nodes", IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned))
            .attribute(AttributeMapping::new("label", "label"))
            .association(
                AssociationMapping::many_to_one("next", "Node", "next_id").cascade(CascadeStyle::ALL),
            )
    }

    fn node(id: i64, label: &str, saves: &Arc<AtomicUsize>) -> (EntityRef, Arc<Mutex<Option<EntityRef>>>) {
        let next = Arc::new(Mutex::new(None));
        let entity = EntityRef::new(Node {
            id: Value::BigInt(id),
            label: Value::from(label),
            next: Arc::clone(&next),
            saves: Arc::clone(saves),
        });
        (entity, next)
    }

    #[test]
    fn test_cascade_cycles_save_each_node_once() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![node_mapping()], SessionConfig::default());
        let saves = Arc::new(AtomicUsize::new(0));

        let (a, a_next) = node(1, "a", &saves);
        let (b, b_next) = node(2, "b", &saves);
        *a_next.lock().unwrap() = Some(b.clone());
        *b_next.lock().unwrap() = Some(a.clone());
        let (c, c_next) = node(3, "c", &saves);
        *c_next.lock().unwrap() = Some(c.clone());

        assert_eq!(unwrap_outcome(block_on(session.save(&cx, &a))), Some(Value::BigInt(1)));
        assert_eq!(unwrap_outcome(block_on(session.save(&cx, &c))), Some(Value::BigInt(3)));
        // Saving a member of the cycle again is a no-op.
        assert_eq!(unwrap_outcome(block_on(session.save(&cx, &b))), Some(Value::BigInt(2)));

        assert_eq!(saves.load(Ordering::SeqCst), 3);
        assert_eq!(session.managed_count(), 3);
        assert_eq!(session.pending_counts().inserts, 3);

        unwrap_outcome(block_on(session.flush(&cx)));
        let inserts: Vec<(String, Vec<Value>)> = conn
            .executed()
            .into_iter()
            .filter(|(sql, _)| sql.starts_with("INSERT"))
            .collect();
        assert_eq!(inserts.len(), 3);
        assert_eq!(inserts[0].1, vec![Value::BigInt(2), Value::from("b"), Value::BigInt(1)]);
        assert_eq!(inserts[1].1, vec![Value::BigInt(1), Value::from("a"), Value::BigInt(2)]);
        assert_eq!(inserts[2].1, vec![Value::BigInt(3), Value::from("c"), Value::BigInt(3)]);
    }

    #[test]
    fn test_cascade_stops_at_depth_limit() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(
            &conn,
            vec![node_mapping()],
            SessionConfig::default().with_max_cascade_depth(2),
        );
        let saves = Arc::new(AtomicUsize::new(0));

        let chain: Vec<(EntityRef, Arc<Mutex<Option<EntityRef>>>)> =
            (1..=4).map(|id| node(id, "link", &saves)).collect();
        for pair in chain.windows(2) {
            *pair[0].1.lock().unwrap() = Some(pair[1].0.clone());
        }

        unwrap_outcome(block_on(session.save(&cx, &chain[0].0)));

        assert!(session.contains(&chain[0].0));
        assert!(session.contains(&chain[1].0));
        assert!(session.contains(&chain[2].0));
        assert!(!session.contains(&chain[3].0));
        assert_eq!(saves.load(Ordering::SeqCst), 3);
        assert_eq!(session.context().cascade_level(), 0);
    }

    fn purchase() -> EntityMapping {
        EntityMapping::new(
            "Purchase",
            "purchases",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned),
        )
        .attribute(AttributeMapping::new("status", "status"))
        .association(
            AssociationMapping::one_to_many("lines", "Line", "purchase_id").cascade(CascadeStyle::ALL),
        )
    }

    fn line(strategy: IdentifierStrategy) -> EntityMapping {
        EntityMapping::new("Line", "lines", IdentifierMapping::new("id", "id", strategy))
            .attribute(AttributeMapping::new("qty", "qty").not_null())
            .association(AssociationMapping::many_to_one("purchase", "Purchase", "purchase_id"))
    }

    #[test]
    fn test_failed_cascade_undoes_the_whole_save() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(
            &conn,
            vec![purchase(), line(IdentifierStrategy::Assigned)],
            SessionConfig::default(),
        );

        let good = DynamicEntity::new("Line").with("id", 1_i64).with("qty", 1_i64).into_ref();
        let bad = DynamicEntity::new("Line").with("id", 2_i64).into_ref();
        let purchase = DynamicEntity::new("Purchase")
            .with("id", 7_i64)
            .with("status", "open")
            .with_many("lines", vec![good.clone(), bad.clone()])
            .into_ref();

        match block_on(session.save(&cx, &purchase)) {
            Outcome::Err(e) => assert_eq!(e.mapping_kind(), Some(MappingErrorKind::Invalid)),
            other => std::panic::panic_any(format!("expected nullability error, got {other:?}")),
        }
        assert!(!session.contains(&purchase));
        assert!(!session.contains(&good));
        assert!(!session.contains(&bad));
        assert_eq!(session.pending_counts().total(), 0);
        assert!(!session.is_rollback_only());

        let result = unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(result.total(), 0);
        assert!(conn.statements().is_empty());

        // Nothing of the failed attempt blocks a retry under the same keys.
        bad.set("qty", Value::BigInt(2));
        unwrap_outcome(block_on(session.save(&cx, &purchase)));
        assert_eq!(session.managed_count(), 3);
        assert_eq!(session.pending_counts().inserts, 3);
    }

    #[test]
    fn test_failure_after_early_insert_makes_session_rollback_only() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.set_next_key(40);
        let mut session = session_for(
            &conn,
            vec![purchase(), line(IdentifierStrategy::Identity)],
            SessionConfig::default(),
        );

        let good = DynamicEntity::new("Line").with("qty", 1_i64).into_ref();
        let bad = DynamicEntity::new("Line").into_ref();
        let purchase = DynamicEntity::new("Purchase")
            .with("id", 7_i64)
            .with("status", "open")
            .with_many("lines", vec![good.clone(), bad.clone()])
            .into_ref();

        unwrap_outcome(block_on(session.begin(&cx)));
        let Outcome::Err(_) = block_on(session.save(&cx, &purchase)) else {
            std::panic::panic_any("expected the save to fail");
        };

        // The purchase and the first line were written before the failure.
        let statements = conn.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("INSERT INTO \"purchases\""));
        assert!(statements[1].starts_with("INSERT INTO \"lines\""));
        assert!(!session.contains(&purchase));
        assert!(!session.contains(&good));
        assert!(session.is_rollback_only());
        assert!(session.debug_state().rollback_only);

        match block_on(session.commit(&cx)) {
            Outcome::Err(Error::Transaction(e)) => {
                assert_eq!(e.kind, TransactionErrorKind::RollbackOnly);
            }
            other => std::panic::panic_any(format!("expected commit refusal, got {other:?}")),
        }
        assert!(conn.executed().iter().all(|(sql, _)| sql != "COMMIT"));

        unwrap_outcome(block_on(session.rollback(&cx)));
        assert!(!session.is_rollback_only());
        assert_eq!(conn.executed().last().map(|(sql, _)| sql.as_str()), Some("ROLLBACK"));
    }

    fn account() -> EntityMapping {
        EntityMapping::new(
            "Account",
            "accounts",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned),
        )
        .attribute(AttributeMapping::new("balance", "balance"))
        .attribute(AttributeMapping::new("version", "version"))
        .version("version")
    }

    #[test]
    fn test_version_seeded_and_incremented() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![account()], SessionConfig::default());

        let acct = DynamicEntity::new("Account").with("id", 1_i64).with("balance", 100_i64).into_ref();
        unwrap_outcome(block_on(session.save(&cx, &acct)));
        assert_eq!(acct.get("version"), Value::BigInt(0));
        unwrap_outcome(block_on(session.flush(&cx)));

        acct.set("balance", Value::BigInt(80));
        let result = unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(result.updated, 1);
        assert_eq!(acct.get("version"), Value::BigInt(1));

        let (sql, params) = conn.executed().pop().unwrap();
        assert!(sql.starts_with("UPDATE \"accounts\" SET"));
        assert!(sql.contains("\"version\" = "));
        assert_eq!(params, vec![Value::BigInt(80), Value::BigInt(1), Value::BigInt(1), Value::BigInt(0)]);

        // Clean entities are not updated again
        let result = unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(result.updated, 0);
    }

    #[test]
    fn test_optimistic_lock_failure_leaves_entry_untouched() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![account()], SessionConfig::default());

        let acct = DynamicEntity::new("Account").with("id", 1_i64).with("balance", 100_i64).into_ref();
        unwrap_outcome(block_on(session.save(&cx, &acct)));
        unwrap_outcome(block_on(session.flush(&cx)));

        acct.set("balance", Value::BigInt(50));
        conn.affect("UPDATE", 0);
        match block_on(session.flush(&cx)) {
            Outcome::Err(e) => assert!(e.is_optimistic_lock_failure()),
            other => std::panic::panic_any(format!("expected optimistic lock failure, got {other:?}")),
        }

        let entry = session.context().get_entry(&acct).unwrap();
        assert_eq!(
            entry.loaded_state(),
            Some(&[Value::BigInt(100), Value::BigInt(0)][..])
        );
        assert_eq!(entry.version(), Some(&Value::BigInt(0)));
        assert_eq!(acct.get("version"), Value::BigInt(0));
        let updates = conn.statements().iter().filter(|s| s.starts_with("UPDATE")).count();
        assert_eq!(updates, 1);
    }

    #[test]
    fn test_identical_inserts_are_batched() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default().with_batch_size(10));

        for id in 1..=3_i64 {
            let w = DynamicEntity::new("Widget").with("id", id).with("name", "w").into_ref();
            unwrap_outcome(block_on(session.save(&cx, &w)));
        }
        let result = unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(result.inserted, 3);
        assert_eq!(conn.batches(), 1);
        assert_eq!(conn.statements().len(), 3);
    }

    #[test]
    fn test_rollback_evicts_new_and_restores_deleted() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());

        let kept = DynamicEntity::new("Widget").with("id", 1_i64).with("name", "kept").into_ref();
        unwrap_outcome(block_on(session.save(&cx, &kept)));
        unwrap_outcome(block_on(session.commit(&cx)));

        let fresh = DynamicEntity::new("Widget").with("id", 2_i64).with("name", "fresh").into_ref();
        unwrap_outcome(block_on(session.save(&cx, &fresh)));
        unwrap_outcome(block_on(session.delete(&cx, &kept)));
        unwrap_outcome(block_on(session.begin(&cx)));
        unwrap_outcome(block_on(session.rollback(&cx)));

        assert!(!session.contains(&fresh));
        assert_eq!(session.entry_status(&kept), Some(Status::Managed));
        assert_eq!(session.pending_counts().total(), 0);
        assert!(!session.in_transaction());
        assert_eq!(conn.executed().last().map(|(sql, _)| sql.as_str()), Some("ROLLBACK"));
    }

    #[test]
    fn test_vetoed_save_registers_nothing() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());

        let w = DynamicEntity::new("Widget").with("id", 5_i64).with("name", "w").vetoing().into_ref();
        let id = unwrap_outcome(block_on(session.save(&cx, &w)));
        assert_eq!(id, Some(Value::BigInt(5)));
        assert!(!session.contains(&w));
        assert_eq!(session.pending_counts().total(), 0);
    }

    #[test]
    fn test_null_in_required_attribute_rejected() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mapping = EntityMapping::new(
            "Widget",
            "widgets",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned),
        )
        .attribute(AttributeMapping::new("name", "name").not_null());
        let mut session = session_for(&conn, vec![mapping.clone()], SessionConfig::default());

        let w = DynamicEntity::new("Widget").with("id", 1_i64).into_ref();
        match block_on(session.save(&cx, &w)) {
            Outcome::Err(e) => {
                assert_eq!(e.mapping_kind(), Some(MappingErrorKind::Invalid));
                assert!(e.to_string().contains("Widget.name"));
            }
            other => std::panic::panic_any(format!("expected nullability error, got {other:?}")),
        }
        assert!(!session.contains(&w));

        let mut lenient = session_for(&conn, vec![mapping], SessionConfig::default().with_check_nullability(false));
        unwrap_outcome(block_on(lenient.save(&cx, &w)));
        assert!(lenient.contains(&w));
    }

    #[test]
    fn test_null_generated_identifier_fails() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let generator: Arc<dyn IdentifierGenerator> =
            Arc::new(InMemoryGenerator::new("nothing", |_: &EntityRef| None));
        let mapping = EntityMapping::new(
            "Widget",
            "widgets",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Generated(generator)),
        );
        let mut session = session_for(&conn, vec![mapping], SessionConfig::default());

        let w = DynamicEntity::new("Widget").into_ref();
        match block_on(session.save(&cx, &w)) {
            Outcome::Err(e) => assert!(matches!(
                e,
                Error::Persist(ref p) if p.kind == keel_core::PersistErrorKind::IdentifierGeneration
            )),
            other => std::panic::panic_any(format!("expected generation error, got {other:?}")),
        }
        assert!(!session.contains(&w));
    }

    fn tagged() -> Vec<EntityMapping> {
        let tag = EntityMapping::new(
            "Tag",
            "tags",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned),
        )
        .attribute(AttributeMapping::new("label", "label"));
        let post = EntityMapping::new(
            "Post",
            "posts",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned),
        )
        .attribute(AttributeMapping::new("title", "title"))
        .association(
            AssociationMapping::many_to_many(
                "tags",
                "Tag",
                LinkTable::new("post_tags", "post_id", "tag_id"),
            )
            .cascade(CascadeStyle::ALL),
        );
        vec![tag, post]
    }

    #[test]
    fn test_many_to_many_link_rows_follow_entity_inserts() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, tagged(), SessionConfig::default());

        let tags: Vec<EntityRef> = [(1_i64, "rust"), (2, "sql")]
            .into_iter()
            .map(|(id, label)| DynamicEntity::new("Tag").with("id", id).with("label", label).into_ref())
            .collect();
        let post = DynamicEntity::new("Post")
            .with("id", 7_i64)
            .with("title", "hello")
            .with_many("tags", tags)
            .into_ref();

        unwrap_outcome(block_on(session.save(&cx, &post)));
        assert_eq!(session.pending_counts().links, 2);
        let result = unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(result.inserted, 3);
        assert_eq!(result.linked, 2);

        let executed = conn.executed();
        let links: Vec<&(String, Vec<Value>)> = executed
            .iter()
            .filter(|(sql, _)| sql.starts_with("INSERT INTO \"post_tags\""))
            .collect();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].1, vec![Value::BigInt(7), Value::BigInt(1)]);
        let last_entity_insert = executed
            .iter()
            .rposition(|(sql, _)| sql.starts_with("INSERT INTO \"tags\""))
            .unwrap();
        let first_link = executed
            .iter()
            .position(|(sql, _)| sql.starts_with("INSERT INTO \"post_tags\""))
            .unwrap();
        assert!(last_entity_insert < first_link);

        // Deleting the owner unlinks it first and cascades to the tags
        unwrap_outcome(block_on(session.delete(&cx, &post)));
        let result = unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(result.deleted, 3);
        let statements = conn.statements();
        let unlink = statements
            .iter()
            .position(|s| s.starts_with("DELETE FROM \"post_tags\""))
            .unwrap();
        let delete_post = statements
            .iter()
            .position(|s| s.starts_with("DELETE FROM \"posts\""))
            .unwrap();
        assert!(unlink < delete_post);
        assert_eq!(session.managed_count(), 0);
    }

    #[test]
    fn test_delete_before_insert_discards_queued_insert() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());

        let w = DynamicEntity::new("Widget").with("id", 1_i64).with("name", "w").into_ref();
        unwrap_outcome(block_on(session.save(&cx, &w)));
        unwrap_outcome(block_on(session.delete(&cx, &w)));

        assert!(!session.contains(&w));
        let result = unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(result.total(), 0);
        assert!(conn.statements().is_empty());
    }

    #[test]
    fn test_evict_unknown_entity_fails() {
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());
        let w = DynamicEntity::new("Widget").with("id", 1_i64).into_ref();
        let err = session.evict(&w).unwrap_err();
        assert!(err.to_string().contains("not managed"));
    }

    #[test]
    fn test_evict_drops_queued_insert() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());
        let w = DynamicEntity::new("Widget").with("id", 1_i64).with("name", "w").into_ref();
        unwrap_outcome(block_on(session.save(&cx, &w)));

        session.evict(&w).unwrap();
        assert!(!session.contains(&w));
        assert_eq!(session.debug_state().pending.total(), 0);
    }

    struct Uppercase;

    impl Interceptor for Uppercase {
        fn on_save(
            &self,
            _entity: &str,
            _id: Option<&Value>,
            state: &mut [Value],
            attribute_names: &[&str],
        ) -> bool {
            let Some(index) = attribute_names.iter().position(|n| *n == "name") else {
                return false;
            };
            let Some(upper) = state[index].as_str().map(str::to_uppercase) else {
                return false;
            };
            state[index] = Value::Text(upper);
            true
        }
    }

    #[test]
    fn test_interceptor_changes_are_written_back() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());
        session.set_interceptor(Uppercase);

        let w = DynamicEntity::new("Widget").with("id", 1_i64).with("name", "gear").into_ref();
        unwrap_outcome(block_on(session.save(&cx, &w)));
        assert_eq!(w.get("name"), Value::from("GEAR"));

        unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(conn.executed()[1].1, vec![Value::BigInt(1), Value::from("GEAR")]);
    }

    #[test]
    fn test_session_events_fire_in_order() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str| {
            let log = Arc::clone(&log);
            move || {
                log.lock().unwrap().push(name);
                Ok::<(), Error>(())
            }
        };
        session.on_before_flush(record("before_flush"));
        session.on_after_flush(record("after_flush"));
        session.on_before_commit(record("before_commit"));
        session.on_after_commit(record("after_commit"));

        unwrap_outcome(block_on(session.commit(&cx)));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before_flush", "after_flush", "before_commit", "after_commit"]
        );
    }

    #[test]
    fn test_before_commit_error_aborts_commit() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default());
        session.on_before_commit(|| Err(Error::Custom("not today".into())));

        let w = DynamicEntity::new("Widget").with("id", 1_i64).with("name", "w").into_ref();
        unwrap_outcome(block_on(session.save(&cx, &w)));
        assert!(matches!(block_on(session.commit(&cx)), Outcome::Err(_)));
        assert!(session.in_transaction());
        assert!(!conn.executed().iter().any(|(sql, _)| sql == "COMMIT"));
    }

    #[test]
    fn test_ordered_updates() {
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session_for(&conn, vec![widget()], SessionConfig::default().with_order_updates(true));

        let widgets: Vec<EntityRef> = [3_i64, 1, 2]
            .into_iter()
            .map(|id| DynamicEntity::new("Widget").with("id", id).with("name", "w").into_ref())
            .collect();
        for w in &widgets {
            unwrap_outcome(block_on(session.save(&cx, w)));
        }
        unwrap_outcome(block_on(session.flush(&cx)));
        for w in &widgets {
            w.set("name", Value::from("v2"));
        }
        let result = unwrap_outcome(block_on(session.flush(&cx)));
        assert_eq!(result.updated, 3);

        let ids: Vec<Value> = conn
            .executed()
            .into_iter()
            .filter(|(sql, _)| sql.starts_with("UPDATE"))
            .map(|(_, params)| params[1].clone())
            .collect();
        assert_eq!(ids, vec![Value::BigInt(1), Value::BigInt(2), Value::BigInt(3)]);
    }
}
