//! Read-back of generated attribute values.
//!
//! After an INSERT or UPDATE executes, attributes produced by the database
//! are unknown in memory. The processor built for a (mapping, event) pair
//! selects exactly those columns by primary key and copies them into the
//! state array and the entity.

use asupersync::{Cx, Outcome};
use keel_core::{
    Connection, Dialect, EntityMapping, EntityRef, Error, GenerationEvent, GenerationKind,
    PersistErrorKind, Value,
};

/// Where a generated value is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueResolver {
    /// Column position in the follow-up query's row.
    FromRow(usize),
    /// Already present in the state array at this index.
    FromState(usize),
}

/// One generated attribute and how to resolve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedValueDescriptor {
    /// Attribute name.
    pub attribute: String,
    /// Index in the state array.
    pub state_index: usize,
    pub resolver: ValueResolver,
}

/// Generated-value reconciliation for one mapping and one event.
///
/// The follow-up SELECT is rendered for the connection it runs on.
#[derive(Debug, Clone)]
pub struct GeneratedValuesProcessor {
    entity: String,
    event: GenerationEvent,
    descriptors: Vec<GeneratedValueDescriptor>,
    table: String,
    id_column: String,
    /// Database-generated columns, in row position order.
    columns: Vec<String>,
}

impl GeneratedValuesProcessor {
    /// Inspect `mapping` and build the processor for `event`.
    pub fn new(mapping: &EntityMapping, event: GenerationEvent) -> Self {
        let mut descriptors = Vec::new();
        let mut columns = Vec::new();

        for (index, attribute) in mapping.attributes.iter().enumerate() {
            let Some(generation) = &attribute.generation else {
                continue;
            };
            if !generation.timing.includes(event) {
                continue;
            }
            let resolver = match generation.kind {
                GenerationKind::Database { .. } => {
                    columns.push(attribute.column.clone());
                    ValueResolver::FromRow(columns.len() - 1)
                }
                GenerationKind::InMemory(_) => ValueResolver::FromState(index),
            };
            descriptors.push(GeneratedValueDescriptor {
                attribute: attribute.name.clone(),
                state_index: index,
                resolver,
            });
        }

        Self {
            entity: mapping.name.clone(),
            event,
            descriptors,
            table: mapping.table.clone(),
            id_column: mapping.identifier.column.clone(),
            columns,
        }
    }

    /// No database-generated column applies: no query is ever issued.
    pub fn is_inert(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn event(&self) -> GenerationEvent {
        self.event
    }

    pub fn descriptors(&self) -> &[GeneratedValueDescriptor] {
        &self.descriptors
    }

    /// The follow-up query in `dialect`, if any.
    pub fn select_sql(&self, dialect: Dialect) -> Option<String> {
        if self.columns.is_empty() {
            return None;
        }
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| dialect.quote_identifier(c))
            .collect();
        Some(format!(
            "SELECT {} FROM {} WHERE {} = {}",
            columns.join(", "),
            dialect.quote_identifier(&self.table),
            dialect.quote_identifier(&self.id_column),
            dialect.placeholder(1)
        ))
    }

    /// Read the generated values of the row identified by `id` into `state`
    /// and `entity`.
    ///
    /// Anything other than exactly one row is a consistency failure; neither
    /// `state` nor `entity` is modified in that case.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, entity, state), fields(entity = %self.entity, event = ?self.event))]
    pub async fn process_generated_values<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        entity: &EntityRef,
        id: &Value,
        state: &mut [Value],
    ) -> Outcome<(), Error> {
        let Some(sql) = self.select_sql(conn.dialect()) else {
            return Outcome::Ok(());
        };

        let rows = match conn.query(cx, &sql, std::slice::from_ref(id)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if rows.len() != 1 {
            return Outcome::Err(Error::persist(
                PersistErrorKind::GeneratedValueConsistency,
                &self.entity,
                Some(id.to_string()),
                format!(
                    "reading generated values expected exactly one row, found {}",
                    rows.len()
                ),
            ));
        }
        let row = &rows[0];

        let mut resolved = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let value = match descriptor.resolver {
                ValueResolver::FromRow(position) => row.get(position).cloned(),
                ValueResolver::FromState(index) => state.get(index).cloned(),
            };
            let Some(value) = value else {
                return Outcome::Err(Error::persist(
                    PersistErrorKind::GeneratedValueConsistency,
                    &self.entity,
                    Some(id.to_string()),
                    format!("no generated value for attribute '{}'", descriptor.attribute),
                ));
            };
            resolved.push(value);
        }

        let mut guard = entity.write();
        for (descriptor, value) in self.descriptors.iter().zip(resolved) {
            if let Some(slot) = state.get_mut(descriptor.state_index) {
                slot.clone_from(&value);
            }
            guard.set(&descriptor.attribute, value);
        }
        drop(guard);

        tracing::trace!(count = self.descriptors.len(), "generated values applied");
        Outcome::Ok(())
    }
}

/// Run in-memory generators applicable to `event`, updating `state` and
/// `entity`.
pub fn apply_in_memory_generation(
    mapping: &EntityMapping,
    event: GenerationEvent,
    entity: &EntityRef,
    state: &mut [Value],
) {
    for (index, attribute) in mapping.attributes.iter().enumerate() {
        let Some(generation) = &attribute.generation else {
            continue;
        };
        let GenerationKind::InMemory(generator) = &generation.kind else {
            continue;
        };
        if !generation.timing.includes(event) {
            continue;
        }
        let Some(slot) = state.get_mut(index) else {
            continue;
        };
        let value = generator.generate(event, slot);
        entity.set(&attribute.name, value.clone());
        *slot = value;
    }
}
