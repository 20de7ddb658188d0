//! Deferred mutation actions and their ordered execution.
//!
//! The queue keeps inserts in enqueue order (cascading already arranged
//! parents before children) and drains in four phases:
//! - INSERT, FIFO
//! - UPDATE, FIFO or sorted by (table, id)
//! - link table rows
//! - DELETE, after everything that might still reference the rows
//!
//! Consecutive statements with identical SQL are sent as one batch when the
//! session's batch size allows it. Every row count is still checked.

#![allow(clippy::result_large_err)]

use asupersync::{Cx, Outcome};
use keel_core::{
    Connection, EntityMapping, EntityRef, Error, GenerationEvent, IdentifierGenerator,
    OptimisticLockStyle, PersistErrorKind, Value,
};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::generated::{GeneratedValuesProcessor, apply_in_memory_generation};
use crate::metamodel::Metamodel;
use crate::mutation::{MutationKind, TableMutation};
use crate::persistence_context::{EntityEntry, PersistenceContext};

// ============================================================================
// Actions
// ============================================================================

/// A foreign key column filled from another entity's identifier at execution.
#[derive(Debug, Clone)]
pub struct ForeignKeyReference {
    pub column: String,
    pub target: EntityRef,
}

/// Queued INSERT.
#[derive(Debug)]
pub struct InsertAction {
    pub entity: EntityRef,
    pub mapping: Arc<EntityMapping>,
    pub mutation: TableMutation,
    /// Identifier, `None` until an identity INSERT has run.
    pub id: Option<Value>,
    /// State array written by the statement.
    pub state: Vec<Value>,
    pub references: Vec<ForeignKeyReference>,
    /// The identity column assigns the identifier.
    pub identity: bool,
    /// Identity insert postponed to flush.
    pub delayed: bool,
}

impl InsertAction {
    /// Build the INSERT for `entity` from its state array.
    pub fn new(
        entity: EntityRef,
        mapping: Arc<EntityMapping>,
        id: Option<Value>,
        state: Vec<Value>,
        references: Vec<ForeignKeyReference>,
    ) -> Self {
        let mut mutation = TableMutation::new(MutationKind::Insert, mapping.table.clone());
        if let Some(id) = &id {
            mutation.add_value(mapping.identifier.column.clone(), id.clone());
        }

        for (attribute, value) in mapping.attributes.iter().zip(&state) {
            if !attribute.insertable {
                continue;
            }
            match &attribute.generation {
                Some(g) if g.is_database_generated() && g.timing.includes(GenerationEvent::Insert) => {
                    if let Some(sql) = g.referenced_column_value() {
                        mutation.add_value_literal(attribute.column.clone(), sql);
                    } else if g.writes_property_value() {
                        mutation.add_value(attribute.column.clone(), value.clone());
                    }
                }
                _ => mutation.add_value(attribute.column.clone(), value.clone()),
            }
        }

        for association in &mapping.associations {
            let Some(column) = association.owner_column() else {
                continue;
            };
            if !references.iter().any(|r| r.column == column) {
                mutation.add_value(column.to_string(), Value::Null);
            }
        }
        for reference in &references {
            mutation.add_value(reference.column.clone(), Value::Null);
        }

        if let Some((column, value)) = &mapping.discriminator {
            mutation.add_value(column.clone(), value.clone());
        }

        let identity = mapping.identifier.strategy.is_post_insert() && id.is_none();
        Self {
            entity,
            mapping,
            mutation,
            id,
            state,
            references,
            identity,
            delayed: false,
        }
    }

    /// Postpone an identity insert to flush.
    #[must_use]
    pub fn delayed(mut self, delayed: bool) -> Self {
        self.delayed = delayed && self.identity;
        self
    }
}

/// Queued UPDATE.
#[derive(Debug)]
pub struct UpdateAction {
    pub entity: EntityRef,
    pub mapping: Arc<EntityMapping>,
    pub mutation: TableMutation,
    pub id: Value,
    /// State after the update, including the incremented version.
    pub state: Vec<Value>,
    /// Version written by the update.
    pub version: Option<Value>,
}

impl UpdateAction {
    /// Compare `current` against the entry's snapshot and build the UPDATE.
    ///
    /// Returns `None` when nothing updatable changed. In-memory generators
    /// for updates run only once the entity is known to be dirty. Fails when
    /// the version cannot be incremented.
    pub fn from_dirty_state(entry: &EntityEntry, current: Vec<Value>) -> Result<Option<Self>, Error> {
        let mapping = entry.mapping();
        let (Some(loaded), Some(id)) = (entry.loaded_state(), entry.id().cloned()) else {
            return Ok(None);
        };
        let version_index = mapping.version_index();

        let dirty: Vec<usize> = mapping
            .attributes
            .iter()
            .enumerate()
            .filter(|(i, a)| {
                a.updatable && Some(*i) != version_index && current.get(*i) != loaded.get(*i)
            })
            .map(|(i, _)| i)
            .collect();
        if dirty.is_empty() {
            return Ok(None);
        }

        let mut state = current;
        apply_in_memory_generation(mapping, GenerationEvent::Update, entry.entity(), &mut state);
        let version = match version_index {
            Some(vi) => {
                let previous = loaded.get(vi).cloned().unwrap_or(Value::Null);
                let Some(next) = previous.successor() else {
                    return Err(Error::persist(
                        PersistErrorKind::VersionExhausted,
                        &mapping.name,
                        Some(id.to_string()),
                        format!("version {previous} has no successor"),
                    ));
                };
                state[vi] = next.clone();
                Some(next)
            }
            None => None,
        };

        let mut mutation = TableMutation::new(MutationKind::Update, mapping.table.clone());
        for (index, attribute) in mapping.attributes.iter().enumerate() {
            let generated_on_update = attribute
                .generation
                .as_ref()
                .filter(|g| g.timing.includes(GenerationEvent::Update));
            match generated_on_update {
                Some(g) if g.is_database_generated() => {
                    if let Some(sql) = g.referenced_column_value() {
                        mutation.add_value_literal(attribute.column.clone(), sql);
                    } else if g.writes_property_value() {
                        mutation.add_value(attribute.column.clone(), state[index].clone());
                    }
                }
                Some(_) => mutation.add_value(attribute.column.clone(), state[index].clone()),
                None if dirty.contains(&index) || (version.is_some() && Some(index) == version_index) => {
                    mutation.add_value(attribute.column.clone(), state[index].clone());
                }
                None => {}
            }
        }

        mutation.add_key_restriction(mapping.identifier.column.clone(), id.clone());
        if let Some((column, value)) = &mapping.discriminator {
            mutation.add_key_restriction(column.clone(), value.clone());
        }
        add_lock_restrictions(&mut mutation, entry, loaded, Some(&dirty));

        Ok(Some(Self {
            entity: entry.entity().clone(),
            mapping: Arc::clone(mapping),
            mutation,
            id,
            state,
            version,
        }))
    }
}

/// Queued DELETE.
#[derive(Debug)]
pub struct DeleteAction {
    pub entity: EntityRef,
    pub mapping: Arc<EntityMapping>,
    pub mutation: TableMutation,
    pub id: Value,
    /// Version the row is expected to hold.
    pub version: Option<Value>,
}

impl DeleteAction {
    /// Build the DELETE for a managed entry.
    pub fn for_entry(entry: &EntityEntry) -> Option<Self> {
        let mapping = entry.mapping();
        let id = entry.id()?.clone();
        let mut mutation = TableMutation::new(MutationKind::Delete, mapping.table.clone());
        mutation.add_key_restriction(mapping.identifier.column.clone(), id.clone());
        if let Some(loaded) = entry.loaded_state() {
            add_lock_restrictions(&mut mutation, entry, loaded, None);
        }
        Some(Self {
            entity: entry.entity().clone(),
            mapping: Arc::clone(mapping),
            mutation,
            id,
            version: entry.version().cloned(),
        })
    }
}

/// Optimistic-lock restrictions for `entry`. `dirty` limits the `Dirty`
/// style to the changed columns; without it every column is restricted.
fn add_lock_restrictions(
    mutation: &mut TableMutation,
    entry: &EntityEntry,
    loaded: &[Value],
    dirty: Option<&[usize]>,
) {
    let mapping = entry.mapping();
    match mapping.optimistic_lock {
        OptimisticLockStyle::None => {}
        OptimisticLockStyle::Version => {
            if let (Some(vi), Some(version)) = (mapping.version_index(), entry.version()) {
                mutation.add_optimistic_lock_restriction(
                    mapping.attributes[vi].column.clone(),
                    version.clone(),
                );
            }
        }
        OptimisticLockStyle::Dirty | OptimisticLockStyle::All => {
            let only_dirty = mapping.optimistic_lock == OptimisticLockStyle::Dirty;
            for (index, attribute) in mapping.attributes.iter().enumerate() {
                if !attribute.updatable && mutation.kind() == MutationKind::Update {
                    continue;
                }
                if only_dirty && dirty.is_some_and(|d| !d.contains(&index)) {
                    continue;
                }
                if let Some(previous) = loaded.get(index) {
                    mutation.add_optimistic_lock_restriction(attribute.column.clone(), previous.clone());
                }
            }
        }
    }
}

/// A mutation action.
#[derive(Debug)]
pub enum MutationAction {
    Insert(InsertAction),
    Update(UpdateAction),
    Delete(DeleteAction),
}

impl MutationAction {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationAction::Insert(_) => MutationKind::Insert,
            MutationAction::Update(_) => MutationKind::Update,
            MutationAction::Delete(_) => MutationKind::Delete,
        }
    }

    pub fn entity(&self) -> &EntityRef {
        match self {
            MutationAction::Insert(a) => &a.entity,
            MutationAction::Update(a) => &a.entity,
            MutationAction::Delete(a) => &a.entity,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            MutationAction::Insert(a) => a.mutation.table(),
            MutationAction::Update(a) => a.mutation.table(),
            MutationAction::Delete(a) => a.mutation.table(),
        }
    }
}

// ============================================================================
// Link table operations
// ============================================================================

/// A pending collection row operation.
#[derive(Debug, Clone)]
pub enum LinkTableOp {
    /// Insert a many-to-many link row.
    Link {
        table: String,
        owner_column: String,
        owner: EntityRef,
        element_column: String,
        element: EntityRef,
        /// Id-bag row identifier column and its generator.
        collection_id: Option<(String, Arc<dyn IdentifierGenerator>)>,
    },
    /// Delete every link row of an owner.
    UnlinkAll {
        table: String,
        owner_column: String,
        owner_id: Value,
    },
    /// Point a one-to-many element's foreign key at its owner.
    Adopt {
        table: String,
        column: String,
        id_column: String,
        owner: EntityRef,
        element: EntityRef,
    },
}

impl LinkTableOp {
    /// Get the table name.
    pub fn table(&self) -> &str {
        match self {
            LinkTableOp::Link { table, .. }
            | LinkTableOp::UnlinkAll { table, .. }
            | LinkTableOp::Adopt { table, .. } => table,
        }
    }

    /// Is `entity` the owner or element of this operation?
    fn involves(&self, entity: &EntityRef) -> bool {
        match self {
            LinkTableOp::Link { owner, element, .. } | LinkTableOp::Adopt { owner, element, .. } => {
                owner.ptr_eq(entity) || element.ptr_eq(entity)
            }
            LinkTableOp::UnlinkAll { .. } => false,
        }
    }

    /// Execute this link table operation.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, context, metamodel), fields(table = %self.table()))]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        context: &PersistenceContext,
        metamodel: &Metamodel,
    ) -> Outcome<(), Error> {
        let dialect = conn.dialect();
        let q = |name: &str| dialect.quote_identifier(name);
        match self {
            LinkTableOp::Link {
                table,
                owner_column,
                owner,
                element_column,
                element,
                collection_id,
            } => {
                let owner_id = match reference_id(context, metamodel, owner) {
                    Ok(id) => id,
                    Err(e) => return Outcome::Err(e),
                };
                let element_id = match reference_id(context, metamodel, element) {
                    Ok(id) => id,
                    Err(e) => return Outcome::Err(e),
                };
                let mut columns = vec![q(owner_column), q(element_column)];
                let mut params = vec![owner_id, element_id];
                if let Some((column, generator)) = collection_id {
                    let row_id = match generator.generate(cx, conn, owner).await {
                        Outcome::Ok(Some(id)) if !id.is_null() => id,
                        Outcome::Ok(_) => {
                            return Outcome::Err(Error::persist(
                                PersistErrorKind::IdentifierGeneration,
                                table.as_str(),
                                None,
                                "collection identifier generator returned no value",
                            ));
                        }
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    columns.insert(0, q(column));
                    params.insert(0, row_id);
                }
                let placeholders: Vec<String> =
                    (1..=params.len()).map(|i| dialect.placeholder(i)).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    q(table),
                    columns.join(", "),
                    placeholders.join(", ")
                );
                tracing::trace!(sql = %sql, "Executing link INSERT");
                execute_expecting(cx, conn, &sql, &params, Expectation::RowCount(1), table).await
            }
            LinkTableOp::UnlinkAll {
                table,
                owner_column,
                owner_id,
            } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {}",
                    q(table),
                    q(owner_column),
                    dialect.placeholder(1)
                );
                tracing::trace!(sql = %sql, "Executing link DELETE");
                execute_expecting(
                    cx,
                    conn,
                    &sql,
                    std::slice::from_ref(owner_id),
                    Expectation::None,
                    table,
                )
                .await
            }
            LinkTableOp::Adopt {
                table,
                column,
                id_column,
                owner,
                element,
            } => {
                let owner_id = match reference_id(context, metamodel, owner) {
                    Ok(id) => id,
                    Err(e) => return Outcome::Err(e),
                };
                let element_id = match reference_id(context, metamodel, element) {
                    Ok(id) => id,
                    Err(e) => return Outcome::Err(e),
                };
                let sql = format!(
                    "UPDATE {} SET {} = {} WHERE {} = {}",
                    q(table),
                    q(column),
                    dialect.placeholder(1),
                    q(id_column),
                    dialect.placeholder(2)
                );
                tracing::trace!(sql = %sql, "Executing foreign key UPDATE");
                execute_expecting(
                    cx,
                    conn,
                    &sql,
                    &[owner_id, element_id],
                    Expectation::RowCount(1),
                    table,
                )
                .await
            }
        }
    }
}

async fn execute_expecting<C: Connection>(
    cx: &Cx,
    conn: &C,
    sql: &str,
    params: &[Value],
    expectation: Expectation,
    table: &str,
) -> Outcome<(), Error> {
    match conn.execute(cx, sql, params).await {
        Outcome::Ok(n) => match expectation.verify(n, MutationKind::Insert, table, None) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        },
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

// ============================================================================
// Expectations
// ============================================================================

/// Affected-row expectation of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Any row count is fine.
    None,
    /// Exactly this many rows.
    RowCount(u64),
}

impl Expectation {
    /// Check `actual` against the expectation.
    ///
    /// An UPDATE or DELETE that matched nothing lost an optimistic-lock race.
    pub fn verify(
        self,
        actual: u64,
        kind: MutationKind,
        entity: &str,
        id: Option<&Value>,
    ) -> Result<(), Error> {
        let Expectation::RowCount(expected) = self else {
            return Ok(());
        };
        if actual == expected {
            return Ok(());
        }
        let identifier = id.map(ToString::to_string);
        if actual == 0 && matches!(kind, MutationKind::Update | MutationKind::Delete) {
            return Err(Error::persist(
                PersistErrorKind::OptimisticLock,
                entity,
                identifier,
                format!(
                    "row was updated or deleted by another transaction ({} matched no row)",
                    kind.as_str()
                ),
            ));
        }
        Err(Error::persist(
            PersistErrorKind::UnexpectedRowCount,
            entity,
            identifier,
            format!("{} affected {actual} rows, expected {expected}", kind.as_str()),
        ))
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Counts of queued work.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingCounts {
    pub inserts: usize,
    pub updates: usize,
    pub links: usize,
    pub deletes: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.links + self.deletes
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of link table operations.
    pub linked: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.linked + self.deleted
    }
}

/// Ordered, deferred work list of one session.
#[derive(Debug, Default)]
pub struct ActionQueue {
    inserts: VecDeque<InsertAction>,
    updates: Vec<UpdateAction>,
    links: Vec<LinkTableOp>,
    deletes: Vec<DeleteAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an action.
    pub fn add_action(&mut self, action: MutationAction) {
        tracing::trace!(
            kind = action.kind().as_str(),
            table = action.table(),
            "action enqueued"
        );
        match action {
            MutationAction::Insert(a) => self.inserts.push_back(a),
            MutationAction::Update(a) => self.updates.push(a),
            MutationAction::Delete(a) => self.deletes.push(a),
        }
    }

    /// Enqueue a link table operation.
    pub fn add_link(&mut self, op: LinkTableOp) {
        self.links.push(op);
    }

    /// Drop every queued action and link row involving `entity`.
    pub fn discard(&mut self, entity: &EntityRef) -> usize {
        let before = self.len();
        self.inserts.retain(|a| !a.entity.ptr_eq(entity));
        self.updates.retain(|a| !a.entity.ptr_eq(entity));
        self.deletes.retain(|a| !a.entity.ptr_eq(entity));
        self.links.retain(|op| !op.involves(entity));
        before - self.len()
    }

    /// Is an INSERT for `entity` still queued?
    pub fn has_pending_insert(&self, entity: &EntityRef) -> bool {
        self.inserts.iter().any(|a| a.entity.ptr_eq(entity))
    }

    /// Is a DELETE still queued?
    pub fn has_pending_deletes(&self) -> bool {
        !self.deletes.is_empty()
    }

    pub fn counts(&self) -> PendingCounts {
        PendingCounts {
            inserts: self.inserts.len(),
            updates: self.updates.len(),
            links: self.links.len(),
            deletes: self.deletes.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.counts().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.inserts.clear();
        self.updates.clear();
        self.links.clear();
        self.deletes.clear();
    }

    /// Execute every queued INSERT in FIFO order.
    #[tracing::instrument(level = "debug", skip_all, fields(count = self.inserts.len()))]
    pub async fn execute_inserts<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        context: &mut PersistenceContext,
        metamodel: &Metamodel,
        batch_size: usize,
    ) -> Outcome<usize, Error> {
        let dialect = conn.dialect();
        let mut executed = 0;
        let mut run: Vec<(InsertAction, String, Vec<Value>)> = Vec::new();

        while let Some(mut action) = self.inserts.pop_front() {
            if action.identity {
                match flush_insert_run(cx, conn, context, metamodel, std::mem::take(&mut run), batch_size).await {
                    Outcome::Ok(n) => executed += n,
                    other => return other,
                }
                match execute_insert(cx, conn, context, metamodel, action).await {
                    Outcome::Ok(_) => executed += 1,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                continue;
            }

            if let Err(e) = bind_references(&mut action, context, metamodel) {
                return Outcome::Err(e);
            }
            let sql = action.mutation.to_sql(dialect);
            let params = action.mutation.parameters();
            let joins_run = run
                .first()
                .is_some_and(|(_, first, _)| *first == sql && run.len() < batch_size.max(1));
            if !joins_run && !run.is_empty() {
                match flush_insert_run(cx, conn, context, metamodel, std::mem::take(&mut run), batch_size).await {
                    Outcome::Ok(n) => executed += n,
                    other => return other,
                }
            }
            run.push((action, sql, params));
        }

        match flush_insert_run(cx, conn, context, metamodel, run, batch_size).await {
            Outcome::Ok(n) => Outcome::Ok(executed + n),
            other => other,
        }
    }

    /// Execute every queued UPDATE.
    #[tracing::instrument(level = "debug", skip_all, fields(count = self.updates.len()))]
    pub async fn execute_updates<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        context: &mut PersistenceContext,
        metamodel: &Metamodel,
        batch_size: usize,
        order_updates: bool,
    ) -> Outcome<usize, Error> {
        let mut updates = std::mem::take(&mut self.updates);
        if order_updates {
            updates.sort_by(|a, b| {
                (a.mutation.table(), a.id.to_string()).cmp(&(b.mutation.table(), b.id.to_string()))
            });
        }
        let dialect = conn.dialect();
        let statements: Vec<(String, Vec<Value>)> = updates
            .iter()
            .map(|a| (a.mutation.to_sql(dialect), a.mutation.parameters()))
            .collect();

        let verify = |index: usize, count: u64| {
            let action = &updates[index];
            Expectation::RowCount(1).verify(count, MutationKind::Update, &action.mapping.name, Some(&action.id))
        };
        match execute_statements(cx, conn, &statements, batch_size, verify).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let count = updates.len();
        for mut action in updates {
            let processor = metamodel.processor(&action.mapping.name, GenerationEvent::Update);
            match post_write(cx, conn, context, processor, &action.entity, &action.mapping, &action.id, &mut action.state).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(count)
    }

    /// Execute every queued link table operation.
    pub async fn execute_links<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        context: &PersistenceContext,
        metamodel: &Metamodel,
    ) -> Outcome<usize, Error> {
        let ops = std::mem::take(&mut self.links);
        if ops.is_empty() {
            return Outcome::Ok(0);
        }

        tracing::info!(count = ops.len(), "Executing link table operations");

        // Unlinks of deleted owners run before new links to the same table.
        let (unlinks, others): (Vec<_>, Vec<_>) = ops
            .into_iter()
            .partition(|op| matches!(op, LinkTableOp::UnlinkAll { .. }));

        let mut count = 0;
        for op in unlinks.iter().chain(&others) {
            match op.execute(cx, conn, context, metamodel).await {
                Outcome::Ok(()) => count += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::debug!(executed = count, "Link table operations complete");
        Outcome::Ok(count)
    }

    /// Execute every queued DELETE. Deleted entries leave the context.
    #[tracing::instrument(level = "debug", skip_all, fields(count = self.deletes.len()))]
    pub async fn execute_deletes<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        context: &mut PersistenceContext,
        batch_size: usize,
    ) -> Outcome<usize, Error> {
        let deletes = std::mem::take(&mut self.deletes);
        let dialect = conn.dialect();
        let statements: Vec<(String, Vec<Value>)> = deletes
            .iter()
            .map(|a| (a.mutation.to_sql(dialect), a.mutation.parameters()))
            .collect();

        let verify = |index: usize, count: u64| {
            let action = &deletes[index];
            Expectation::RowCount(1).verify(count, MutationKind::Delete, &action.mapping.name, Some(&action.id))
        };
        match execute_statements(cx, conn, &statements, batch_size, verify).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        for action in &deletes {
            context.mark_gone(&action.entity);
        }
        Outcome::Ok(deletes.len())
    }
}

// ============================================================================
// Execution helpers
// ============================================================================

/// Identifier of a referenced entity.
fn reference_id(
    context: &PersistenceContext,
    metamodel: &Metamodel,
    target: &EntityRef,
) -> Result<Value, Error> {
    if let Some(entry) = context.get_entry(target) {
        return entry.id().cloned().ok_or_else(|| {
            Error::persist(
                PersistErrorKind::TransientReference,
                entry.mapping().name.as_str(),
                None,
                "referenced entity has no identifier yet",
            )
        });
    }
    let name = target.entity_name();
    let mapping = metamodel.mapping(&name)?;
    let id = mapping.identifier_of(&*target.read());
    if id.is_null() {
        return Err(Error::persist(
            PersistErrorKind::TransientReference,
            name,
            None,
            "object references an unsaved transient instance",
        ));
    }
    Ok(id)
}

fn bind_references(
    action: &mut InsertAction,
    context: &PersistenceContext,
    metamodel: &Metamodel,
) -> Result<(), Error> {
    for reference in &action.references {
        let id = reference_id(context, metamodel, &reference.target)?;
        action.mutation.rebind_value(&reference.column, id);
    }
    Ok(())
}

/// Run one INSERT immediately. Returns the identifier.
pub(crate) async fn execute_insert<C: Connection>(
    cx: &Cx,
    conn: &C,
    context: &mut PersistenceContext,
    metamodel: &Metamodel,
    mut action: InsertAction,
) -> Outcome<Value, Error> {
    if let Err(e) = bind_references(&mut action, context, metamodel) {
        return Outcome::Err(e);
    }
    let dialect = conn.dialect();
    let sql = action.mutation.to_sql(dialect);
    let params = action.mutation.parameters();

    let id = match &action.id {
        Some(id) => {
            let count = match conn.execute(cx, &sql, &params).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let Err(e) = Expectation::RowCount(1).verify(count, MutationKind::Insert, &action.mapping.name, Some(id)) {
                return Outcome::Err(e);
            }
            id.clone()
        }
        None => {
            let key = match conn.insert(cx, &sql, &params).await {
                Outcome::Ok(key) => key,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let id = Value::BigInt(key);
            action.entity.set(&action.mapping.identifier.attribute, id.clone());
            if let Err(e) = context.replace_identity_entry(&action.entity, id.clone()) {
                return Outcome::Err(e);
            }
            tracing::debug!(entity = %action.mapping.name, id = %id, "identity insert assigned identifier");
            id
        }
    };

    let processor = metamodel.processor(&action.mapping.name, GenerationEvent::Insert);
    match post_write(cx, conn, context, processor, &action.entity, &action.mapping, &id, &mut action.state).await {
        Outcome::Ok(()) => Outcome::Ok(id),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Execute a run of prepared non-identity INSERTs sharing one SQL text.
async fn flush_insert_run<C: Connection>(
    cx: &Cx,
    conn: &C,
    context: &mut PersistenceContext,
    metamodel: &Metamodel,
    run: Vec<(InsertAction, String, Vec<Value>)>,
    batch_size: usize,
) -> Outcome<usize, Error> {
    if run.is_empty() {
        return Outcome::Ok(0);
    }
    let statements: Vec<(String, Vec<Value>)> = run
        .iter()
        .map(|(_, sql, params)| (sql.clone(), params.clone()))
        .collect();
    let verify = |index: usize, count: u64| {
        let action = &run[index].0;
        Expectation::RowCount(1).verify(count, MutationKind::Insert, &action.mapping.name, action.id.as_ref())
    };
    match execute_statements(cx, conn, &statements, batch_size, verify).await {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    }

    let count = run.len();
    for (mut action, _, _) in run {
        let Some(id) = action.id.clone() else {
            continue;
        };
        let processor = metamodel.processor(&action.mapping.name, GenerationEvent::Insert);
        match post_write(cx, conn, context, processor, &action.entity, &action.mapping, &id, &mut action.state).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }
    Outcome::Ok(count)
}

/// Read back generated values and record the written state on the entry.
///
/// The entry is only touched once everything succeeded.
#[allow(clippy::too_many_arguments)]
async fn post_write<C: Connection>(
    cx: &Cx,
    conn: &C,
    context: &mut PersistenceContext,
    processor: Option<&Arc<GeneratedValuesProcessor>>,
    entity: &EntityRef,
    mapping: &EntityMapping,
    id: &Value,
    state: &mut Vec<Value>,
) -> Outcome<(), Error> {
    if let Some(processor) = processor {
        match processor.process_generated_values(cx, conn, entity, id, state).await {
            Outcome::Ok(()) => {}
            other => return other,
        }
    }
    let version = mapping.version_index().and_then(|vi| state.get(vi).cloned());
    if let Some((vi, version)) = mapping.version_index().zip(version.as_ref()) {
        entity.set(&mapping.attributes[vi].name, version.clone());
    }
    if let Some(entry) = context.get_entry_mut(entity) {
        entry.post_write(std::mem::take(state), version);
    }
    Outcome::Ok(())
}

/// Execute `statements`, batching consecutive identical SQL up to
/// `batch_size`, and check each row count with `verify` as groups complete.
async fn execute_statements<C, F>(
    cx: &Cx,
    conn: &C,
    statements: &[(String, Vec<Value>)],
    batch_size: usize,
    verify: F,
) -> Outcome<(), Error>
where
    C: Connection,
    F: Fn(usize, u64) -> Result<(), Error>,
{
    let batch_size = batch_size.max(1);
    let mut start = 0;
    while start < statements.len() {
        let mut end = start + 1;
        while end < statements.len()
            && end - start < batch_size
            && statements[end].0 == statements[start].0
        {
            end += 1;
        }

        let counts = if end - start == 1 {
            let (sql, params) = &statements[start];
            match conn.execute(cx, sql, params).await {
                Outcome::Ok(n) => vec![n],
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            tracing::trace!(size = end - start, sql = %statements[start].0, "Executing statement batch");
            match conn.batch(cx, &statements[start..end]).await {
                Outcome::Ok(counts) => counts,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        for offset in 0..(end - start) {
            let count = counts.get(offset).copied().unwrap_or(0);
            if let Err(e) = verify(start + offset, count) {
                return Outcome::Err(e);
            }
        }
        start = end;
    }
    Outcome::Ok(())
}
