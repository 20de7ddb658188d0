//! Identifier resolution and the built-in identifier generators.
//!
//! [`IdentifierResolver`] decides how a save obtains its primary key. The
//! generators in this module are shared by every session using a mapping;
//! each synchronizes its own pool and never holds a lock across a database
//! round-trip.

use asupersync::{Cx, Outcome};
use keel_core::{
    BoxFuture, CollectionId, Dialect, EntityMapping, EntityRef, Error, IdentifierGenerator,
    IdentifierStrategy, LinkTable, MappingErrorKind, PersistErrorKind, QueryExecutor, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::persistence_context::PersistenceContext;

/// Sequence used by `sequence` generators that were not given a name.
pub const DEFAULT_SEQUENCE_NAME: &str = "keel_sequence";

/// Hi-value table used by `table` generators.
pub const DEFAULT_TABLE_NAME: &str = "keel_sequences";

// ============================================================================
// Resolution
// ============================================================================

/// What the resolver decided for one save.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifierGenerationOutcome {
    /// The identifier is known now.
    Value(Value),
    /// The instance is already managed; nothing to generate.
    ShortCircuit,
    /// The identifier is produced by the INSERT itself.
    PostInsert,
}

/// Decides how an entity obtains its identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierResolver;

impl IdentifierResolver {
    /// Resolve the identifier of `entity`.
    ///
    /// A non-null identifier already carried by the entity is returned as-is
    /// and the mapping's generator is never invoked.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = %mapping.name))]
    pub async fn resolve(
        cx: &Cx,
        executor: &dyn QueryExecutor,
        context: &PersistenceContext,
        mapping: &EntityMapping,
        entity: &EntityRef,
    ) -> Outcome<IdentifierGenerationOutcome, Error> {
        if context.contains(entity) {
            return Outcome::Ok(IdentifierGenerationOutcome::ShortCircuit);
        }

        let current = mapping.identifier_of(&*entity.read());
        if !current.is_null() {
            tracing::trace!(id = %current, "identifier already set");
            return Outcome::Ok(IdentifierGenerationOutcome::Value(current));
        }

        match &mapping.identifier.strategy {
            IdentifierStrategy::Assigned => Outcome::Err(Error::persist(
                PersistErrorKind::IdentifierGeneration,
                &mapping.name,
                None,
                "identifier of an entity with an assigned identifier must be set before saving",
            )),
            IdentifierStrategy::Identity => Outcome::Ok(IdentifierGenerationOutcome::PostInsert),
            IdentifierStrategy::Generated(generator) => {
                match generator.generate(cx, executor, entity).await {
                    Outcome::Ok(Some(value)) if !value.is_null() => {
                        tracing::debug!(
                            generator = generator.name(),
                            id = %value,
                            "identifier generated"
                        );
                        Outcome::Ok(IdentifierGenerationOutcome::Value(value))
                    }
                    Outcome::Ok(_) => Outcome::Err(Error::persist(
                        PersistErrorKind::IdentifierGeneration,
                        &mapping.name,
                        None,
                        format!("generator '{}' returned no identifier", generator.name()),
                    )),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
        }
    }
}

// ============================================================================
// Value pools
// ============================================================================

/// Block of reserved values not yet handed out.
#[derive(Debug, Default)]
struct Pool {
    next: i64,
    remaining: i64,
}

impl Pool {
    fn take(&mut self) -> Option<i64> {
        if self.remaining <= 0 {
            return None;
        }
        let value = self.next;
        self.next += 1;
        self.remaining -= 1;
        Some(value)
    }

    fn install(&mut self, next: i64, remaining: i64) {
        self.next = next;
        self.remaining = remaining.max(0);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Sequence
// ============================================================================

/// Database sequence with a pooled-lo optimizer.
///
/// Each round-trip reserves `allocation_size` values starting at the value
/// the sequence returned, so the sequence must be declared with a matching
/// `INCREMENT BY`.
#[derive(Debug)]
pub struct SequenceGenerator {
    sequence: String,
    allocation_size: i64,
    pool: Mutex<Pool>,
}

impl SequenceGenerator {
    pub fn new(sequence: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
            allocation_size: 1,
            pool: Mutex::new(Pool::default()),
        }
    }

    /// Reserve `size` values per round-trip.
    #[must_use]
    pub fn with_allocation_size(mut self, size: i64) -> Self {
        self.allocation_size = size.max(1);
        self
    }

    /// Sequence name.
    pub fn sequence(&self) -> &str {
        &self.sequence
    }
}

impl IdentifierGenerator for SequenceGenerator {
    fn name(&self) -> &str {
        "sequence"
    }

    fn generate<'a>(
        &'a self,
        cx: &'a Cx,
        executor: &'a dyn QueryExecutor,
        _entity: &'a EntityRef,
    ) -> BoxFuture<'a, Outcome<Option<Value>, Error>> {
        Box::pin(async move {
            if let Some(value) = lock(&self.pool).take() {
                return Outcome::Ok(Some(Value::BigInt(value)));
            }

            let Some(sql) = executor
                .executor_dialect()
                .sequence_next_value_sql(&self.sequence)
            else {
                return Outcome::Err(Error::mapping(
                    MappingErrorKind::UnsupportedStrategy,
                    &self.sequence,
                    "the dialect has no sequences",
                ));
            };

            let row = match executor.query_one_boxed(cx, &sql, &[]).await {
                Outcome::Ok(row) => row,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let Some(lo) = row.as_ref().and_then(|r| r.get(0)).and_then(Value::as_i64) else {
                return Outcome::Ok(None);
            };

            lock(&self.pool).install(lo + 1, self.allocation_size - 1);
            tracing::debug!(
                sequence = %self.sequence,
                lo,
                allocation_size = self.allocation_size,
                "sequence block reserved"
            );
            Outcome::Ok(Some(Value::BigInt(lo)))
        })
    }
}

// ============================================================================
// Table
// ============================================================================

/// Hi-value table generator.
///
/// Reads the segment's current value and advances it with a compare-and-set
/// UPDATE. A lost race is retried up to `max_attempts` times.
#[derive(Debug)]
pub struct TableGenerator {
    table: String,
    segment_column: String,
    value_column: String,
    segment: String,
    initial_value: i64,
    allocation_size: i64,
    max_attempts: usize,
    pool: Mutex<Pool>,
}

impl TableGenerator {
    /// Generator for `segment` in the default hi-value table.
    pub fn new(segment: impl Into<String>) -> Self {
        Self {
            table: DEFAULT_TABLE_NAME.to_string(),
            segment_column: "sequence_name".to_string(),
            value_column: "next_val".to_string(),
            segment: segment.into(),
            initial_value: 1,
            allocation_size: 1,
            max_attempts: 5,
            pool: Mutex::new(Pool::default()),
        }
    }

    /// Use a different table layout.
    #[must_use]
    pub fn with_table(
        mut self,
        table: impl Into<String>,
        segment_column: impl Into<String>,
        value_column: impl Into<String>,
    ) -> Self {
        self.table = table.into();
        self.segment_column = segment_column.into();
        self.value_column = value_column.into();
        self
    }

    /// Reserve `size` values per round-trip.
    #[must_use]
    pub fn with_allocation_size(mut self, size: i64) -> Self {
        self.allocation_size = size.max(1);
        self
    }

    /// Value seeded into a missing segment row.
    #[must_use]
    pub fn with_initial_value(mut self, value: i64) -> Self {
        self.initial_value = value;
        self
    }

    /// Attempts before giving up on a contended segment.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    fn select_sql(&self, dialect: Dialect) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            dialect.quote_identifier(&self.value_column),
            dialect.quote_identifier(&self.table),
            dialect.quote_identifier(&self.segment_column),
            dialect.placeholder(1)
        )
    }

    fn insert_sql(&self, dialect: Dialect) -> String {
        format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {})",
            dialect.quote_identifier(&self.table),
            dialect.quote_identifier(&self.segment_column),
            dialect.quote_identifier(&self.value_column),
            dialect.placeholder(1),
            dialect.placeholder(2)
        )
    }

    fn update_sql(&self, dialect: Dialect) -> String {
        format!(
            "UPDATE {} SET {} = {} WHERE {} = {} AND {} = {}",
            dialect.quote_identifier(&self.table),
            dialect.quote_identifier(&self.value_column),
            dialect.placeholder(1),
            dialect.quote_identifier(&self.segment_column),
            dialect.placeholder(2),
            dialect.quote_identifier(&self.value_column),
            dialect.placeholder(3)
        )
    }
}

impl IdentifierGenerator for TableGenerator {
    fn name(&self) -> &str {
        "table"
    }

    fn generate<'a>(
        &'a self,
        cx: &'a Cx,
        executor: &'a dyn QueryExecutor,
        entity: &'a EntityRef,
    ) -> BoxFuture<'a, Outcome<Option<Value>, Error>> {
        Box::pin(async move {
            if let Some(value) = lock(&self.pool).take() {
                return Outcome::Ok(Some(Value::BigInt(value)));
            }

            let dialect = executor.executor_dialect();
            let select = self.select_sql(dialect);
            let segment = [Value::Text(self.segment.clone())];

            for attempt in 1..=self.max_attempts {
                let row = match executor.query_one_boxed(cx, &select, &segment).await {
                    Outcome::Ok(row) => row,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };

                let Some(current) = row.as_ref().and_then(|r| r.get(0)).and_then(Value::as_i64)
                else {
                    tracing::debug!(segment = %self.segment, "seeding hi-value segment");
                    let params = [
                        Value::Text(self.segment.clone()),
                        Value::BigInt(self.initial_value),
                    ];
                    match executor
                        .execute_boxed(cx, &self.insert_sql(dialect), &params)
                        .await
                    {
                        Outcome::Ok(_) => continue,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                };

                let params = [
                    Value::BigInt(current + self.allocation_size),
                    Value::Text(self.segment.clone()),
                    Value::BigInt(current),
                ];
                let updated = match executor
                    .execute_boxed(cx, &self.update_sql(dialect), &params)
                    .await
                {
                    Outcome::Ok(n) => n,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };

                if updated == 1 {
                    lock(&self.pool).install(current + 1, self.allocation_size - 1);
                    return Outcome::Ok(Some(Value::BigInt(current)));
                }
                tracing::trace!(segment = %self.segment, attempt, "hi-value update lost a race");
            }

            Outcome::Err(Error::persist(
                PersistErrorKind::IdentifierGeneration,
                entity.entity_name(),
                None,
                format!(
                    "could not reserve a value from segment '{}' after {} attempts",
                    self.segment, self.max_attempts
                ),
            ))
        })
    }
}

// ============================================================================
// Increment
// ============================================================================

/// Seeds from `max(column)` once, then counts in memory.
///
/// Only safe when no other process inserts into the table.
#[derive(Debug)]
pub struct IncrementGenerator {
    table: String,
    column: String,
    next: Mutex<Option<i64>>,
}

impl IncrementGenerator {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            next: Mutex::new(None),
        }
    }

    fn take(&self) -> Option<i64> {
        let mut next = lock(&self.next);
        let value = (*next)?;
        *next = Some(value + 1);
        Some(value)
    }
}

impl IdentifierGenerator for IncrementGenerator {
    fn name(&self) -> &str {
        "increment"
    }

    fn generate<'a>(
        &'a self,
        cx: &'a Cx,
        executor: &'a dyn QueryExecutor,
        _entity: &'a EntityRef,
    ) -> BoxFuture<'a, Outcome<Option<Value>, Error>> {
        Box::pin(async move {
            if let Some(value) = self.take() {
                return Outcome::Ok(Some(Value::BigInt(value)));
            }

            let dialect = executor.executor_dialect();
            let sql = format!(
                "SELECT max({}) FROM {}",
                dialect.quote_identifier(&self.column),
                dialect.quote_identifier(&self.table)
            );
            let row = match executor.query_one_boxed(cx, &sql, &[]).await {
                Outcome::Ok(row) => row,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let max = row
                .as_ref()
                .and_then(|r| r.get(0))
                .and_then(Value::as_i64)
                .unwrap_or(0);

            {
                let mut next = lock(&self.next);
                if next.is_none() {
                    tracing::debug!(table = %self.table, max, "increment generator seeded");
                    *next = Some(max + 1);
                }
            }
            Outcome::Ok(self.take().map(Value::BigInt))
        })
    }
}

// ============================================================================
// UUID
// ============================================================================

/// Random (version 4) UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl UuidGenerator {
    /// A fresh random UUID.
    pub fn next_uuid() -> [u8; 16] {
        let mut bytes: [u8; 16] = rand::random();
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        bytes
    }
}

impl IdentifierGenerator for UuidGenerator {
    fn name(&self) -> &str {
        "uuid"
    }

    fn generate<'a>(
        &'a self,
        _cx: &'a Cx,
        _executor: &'a dyn QueryExecutor,
        _entity: &'a EntityRef,
    ) -> BoxFuture<'a, Outcome<Option<Value>, Error>> {
        Box::pin(async move { Outcome::Ok(Some(Value::Uuid(Self::next_uuid()))) })
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Application-supplied generator that needs no database access.
pub struct InMemoryGenerator<F> {
    name: String,
    generate: F,
}

impl<F> InMemoryGenerator<F>
where
    F: Fn(&EntityRef) -> Option<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, generate: F) -> Self {
        Self {
            name: name.into(),
            generate,
        }
    }
}

impl<F> fmt::Debug for InMemoryGenerator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryGenerator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<F> IdentifierGenerator for InMemoryGenerator<F>
where
    F: Fn(&EntityRef) -> Option<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn generate<'a>(
        &'a self,
        _cx: &'a Cx,
        _executor: &'a dyn QueryExecutor,
        entity: &'a EntityRef,
    ) -> BoxFuture<'a, Outcome<Option<Value>, Error>> {
        let value = (self.generate)(entity);
        Box::pin(async move { Outcome::Ok(value) })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// How a requested strategy name maps to a generator instance name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasPolicy {
    /// The instance name is the requested name, so a generator registered
    /// under `sequence` or `increment` is honoured.
    #[default]
    Verbatim,
    /// `sequence` and `increment` resolve to an anonymous built-in instance
    /// (empty generator name), ignoring registered generators of that name.
    LegacyAnonymous,
}

/// Strategy name to generator resolution, done at configuration time.
#[derive(Debug, Clone)]
pub struct GeneratorRegistry {
    dialect: Dialect,
    policy: AliasPolicy,
    named: HashMap<String, Arc<dyn IdentifierGenerator>>,
}

impl GeneratorRegistry {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            policy: AliasPolicy::default(),
            named: HashMap::new(),
        }
    }

    /// Set the alias policy.
    #[must_use]
    pub fn with_policy(mut self, policy: AliasPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a generator under `name`.
    #[must_use]
    pub fn register(mut self, name: impl Into<String>, generator: Arc<dyn IdentifierGenerator>) -> Self {
        self.named.insert(name.into(), generator);
        self
    }

    /// Active alias policy.
    pub fn policy(&self) -> AliasPolicy {
        self.policy
    }

    /// Dialect the registry resolves `native` for.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Resolve an entity identifier strategy by name.
    ///
    /// `native` becomes a sequence on dialects with sequences and an identity
    /// column elsewhere.
    pub fn entity_strategy(
        &self,
        entity: &str,
        strategy: &str,
        table: &str,
        column: &str,
    ) -> Result<IdentifierStrategy, Error> {
        match strategy {
            "assigned" => Ok(IdentifierStrategy::Assigned),
            "identity" => Ok(IdentifierStrategy::Identity),
            "native" if self.dialect.supports_sequences() => Ok(IdentifierStrategy::Generated(
                Arc::new(SequenceGenerator::new(DEFAULT_SEQUENCE_NAME)),
            )),
            "native" => Ok(IdentifierStrategy::Identity),
            other => self
                .generator(other, other, table, column)
                .map(IdentifierStrategy::Generated)
                .ok_or_else(|| unknown_generator(entity, other)),
        }
    }

    /// Resolve the generator of an id-bag collection identifier.
    ///
    /// Fills in `id.generator_name` according to the alias policy.
    pub fn collection_id_generator(
        &self,
        role: &str,
        link: &LinkTable,
        id: &mut CollectionId,
    ) -> Result<Arc<dyn IdentifierGenerator>, Error> {
        let unsupported = |what: &str| {
            Error::mapping(
                MappingErrorKind::UnsupportedStrategy,
                role,
                format!("{what} generation not supported for collection identifiers"),
            )
        };
        let name = match (self.policy, id.generator.as_str()) {
            (_, "identity") => return Err(unsupported("IDENTITY")),
            (_, "assigned") => return Err(unsupported("Assigned")),
            (_, "native") => return Err(unsupported("Native")),
            (AliasPolicy::LegacyAnonymous, "sequence" | "increment") => String::new(),
            (_, requested) => requested.to_string(),
        };

        let generator = self
            .generator(&id.generator, &name, &link.table, &id.column)
            .ok_or_else(|| unknown_generator(role, &id.generator))?;
        tracing::trace!(
            role,
            strategy = %id.generator,
            generator_name = %name,
            "collection identifier generator resolved"
        );
        id.generator_name = Some(name);
        Ok(generator)
    }

    fn generator(
        &self,
        strategy: &str,
        name: &str,
        table: &str,
        column: &str,
    ) -> Option<Arc<dyn IdentifierGenerator>> {
        if !name.is_empty() {
            if let Some(generator) = self.named.get(name) {
                return Some(Arc::clone(generator));
            }
        }
        let instance = if name.is_empty() || name == strategy {
            None
        } else {
            Some(name)
        };
        match strategy {
            "sequence" => Some(Arc::new(SequenceGenerator::new(
                instance.unwrap_or(DEFAULT_SEQUENCE_NAME),
            ))),
            "table" => Some(Arc::new(TableGenerator::new(instance.unwrap_or(table)))),
            "increment" => Some(Arc::new(IncrementGenerator::new(table, column))),
            "uuid" => Some(Arc::new(UuidGenerator)),
            _ => None,
        }
    }
}

fn unknown_generator(owner: &str, strategy: &str) -> Error {
    Error::mapping(
        MappingErrorKind::UnsupportedStrategy,
        owner,
        format!("no identifier generator named '{strategy}'"),
    )
}
