//! Entity mapping metadata.
//!
//! A mapping describes how one entity type is laid out in one table: its
//! identifier and how that identifier is obtained, its attributes with their
//! per-attribute value generation, its associations and its optimistic-lock
//! configuration. Mappings are built once, validated, and then shared
//! read-only (`Arc<EntityMapping>`) by every session.

use crate::association::AssociationMapping;
use crate::connection::{BoxFuture, QueryExecutor};
use crate::entity::{Entity, EntityRef};
use crate::error::{Error, MappingErrorKind, Result};
use crate::generation::{GenerationEvent, ValueGeneration};
use crate::value::Value;
use asupersync::{Cx, Outcome};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Produces identifier values for a mapping.
///
/// Generators are shared by every session using the mapping, so any internal
/// state must be synchronized by the generator itself.
pub trait IdentifierGenerator: Send + Sync + fmt::Debug {
    /// Strategy name, used in diagnostics.
    fn name(&self) -> &str;

    /// Generate the next identifier for `entity`.
    ///
    /// `Outcome::Ok(None)` means the generator produced nothing, which the
    /// caller treats as a fatal identifier generation failure.
    fn generate<'a>(
        &'a self,
        cx: &'a Cx,
        executor: &'a dyn QueryExecutor,
        entity: &'a EntityRef,
    ) -> BoxFuture<'a, Outcome<Option<Value>, Error>>;
}

/// How an entity obtains its identifier.
#[derive(Debug, Clone)]
pub enum IdentifierStrategy {
    /// The application sets the identifier before saving.
    Assigned,
    /// An identity column assigns it while the INSERT executes.
    Identity,
    /// A generator produces it before the INSERT.
    Generated(Arc<dyn IdentifierGenerator>),
}

impl IdentifierStrategy {
    /// Is the value known only after the INSERT runs?
    pub const fn is_post_insert(&self) -> bool {
        matches!(self, IdentifierStrategy::Identity)
    }

    /// Strategy name for diagnostics.
    pub fn name(&self) -> &str {
        match self {
            IdentifierStrategy::Assigned => "assigned",
            IdentifierStrategy::Identity => "identity",
            IdentifierStrategy::Generated(generator) => generator.name(),
        }
    }
}

/// The identifier attribute of a mapping.
#[derive(Debug, Clone)]
pub struct IdentifierMapping {
    /// Attribute name on the entity.
    pub attribute: String,
    /// Primary key column.
    pub column: String,
    /// How values are obtained.
    pub strategy: IdentifierStrategy,
}

impl IdentifierMapping {
    pub fn new(
        attribute: impl Into<String>,
        column: impl Into<String>,
        strategy: IdentifierStrategy,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            column: column.into(),
            strategy,
        }
    }
}

/// A basic (non-association, non-identifier) attribute.
#[derive(Debug, Clone)]
pub struct AttributeMapping {
    /// Attribute name on the entity.
    pub name: String,
    /// Column name.
    pub column: String,
    /// May the column hold NULL?
    pub nullable: bool,
    /// Is the column part of INSERT statements?
    pub insertable: bool,
    /// Is the column part of UPDATE statements?
    pub updatable: bool,
    /// Value generation, if any.
    pub generation: Option<ValueGeneration>,
}

impl AttributeMapping {
    /// A nullable, insertable, updatable attribute.
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            nullable: true,
            insertable: true,
            updatable: true,
            generation: None,
        }
    }

    /// Mark the column NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Exclude the column from INSERT statements.
    #[must_use]
    pub fn insertable(mut self, value: bool) -> Self {
        self.insertable = value;
        self
    }

    /// Exclude the column from UPDATE statements.
    #[must_use]
    pub fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    /// Attach value generation.
    #[must_use]
    pub fn generated(mut self, generation: ValueGeneration) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Is the value produced by the database on `event`?
    pub fn is_database_generated_on(&self, event: GenerationEvent) -> bool {
        self.generation
            .as_ref()
            .is_some_and(|g| g.is_database_generated() && g.timing.includes(event))
    }
}

/// Optimistic locking style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptimisticLockStyle {
    /// No optimistic locking.
    None,
    /// Restrict on the version attribute.
    #[default]
    Version,
    /// Restrict on the previous values of the changed columns.
    Dirty,
    /// Restrict on the previous values of all columns.
    All,
}

/// Complete mapping of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMapping {
    /// Entity name, as returned by [`Entity::entity_name`].
    pub name: String,
    /// Table name.
    pub table: String,
    /// Identifier mapping.
    pub identifier: IdentifierMapping,
    /// Basic attributes, in state-array order.
    pub attributes: Vec<AttributeMapping>,
    /// Associations.
    pub associations: Vec<AssociationMapping>,
    /// Name of the version attribute.
    pub version: Option<String>,
    /// Optimistic locking style.
    pub optimistic_lock: OptimisticLockStyle,
    /// Discriminator column and value written on insert and restricted on update.
    pub discriminator: Option<(String, Value)>,
}

impl EntityMapping {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        identifier: IdentifierMapping,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            identifier,
            attributes: Vec::new(),
            associations: Vec::new(),
            version: None,
            optimistic_lock: OptimisticLockStyle::Version,
            discriminator: None,
        }
    }

    /// Add a basic attribute (builder pattern).
    #[must_use]
    pub fn attribute(mut self, attribute: AttributeMapping) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Add an association (builder pattern).
    #[must_use]
    pub fn association(mut self, association: AssociationMapping) -> Self {
        self.associations.push(association);
        self
    }

    /// Use `attribute` as the version attribute.
    #[must_use]
    pub fn version(mut self, attribute: impl Into<String>) -> Self {
        self.version = Some(attribute.into());
        self
    }

    /// Set the optimistic locking style.
    #[must_use]
    pub fn optimistic_lock(mut self, style: OptimisticLockStyle) -> Self {
        self.optimistic_lock = style;
        self
    }

    /// Set the discriminator column and value.
    #[must_use]
    pub fn discriminator(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.discriminator = Some((column.into(), value.into()));
        self
    }

    /// Position of `name` in the state array.
    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    /// Position of the version attribute in the state array.
    pub fn version_index(&self) -> Option<usize> {
        self.version
            .as_deref()
            .and_then(|name| self.attribute_index(name))
    }

    /// Look up an association by name.
    pub fn find_association(&self, name: &str) -> Option<&AssociationMapping> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Attribute names in state-array order.
    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|a| a.name.as_str()).collect()
    }

    /// Any attribute produced by the database on `event`?
    pub fn has_database_generated(&self, event: GenerationEvent) -> bool {
        self.attributes
            .iter()
            .any(|a| a.is_database_generated_on(event))
    }

    /// Read the identifier attribute.
    pub fn identifier_of(&self, entity: &dyn Entity) -> Value {
        entity.get(&self.identifier.attribute)
    }

    /// Read every basic attribute, in state-array order.
    pub fn extract_state(&self, entity: &dyn Entity) -> Vec<Value> {
        self.attributes.iter().map(|a| entity.get(&a.name)).collect()
    }

    /// Write a state array back into the entity.
    pub fn apply_state(&self, entity: &mut dyn Entity, state: &[Value]) {
        for (attribute, value) in self.attributes.iter().zip(state) {
            entity.set(&attribute.name, value.clone());
        }
    }

    /// Structural validation of this mapping in isolation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Error::mapping(MappingErrorKind::Invalid, &self.name, message);

        for name in [&self.table, &self.identifier.column] {
            if !is_valid_sql_name(name) {
                return Err(invalid(format!("'{name}' is not a valid SQL name")));
            }
        }

        let mut columns = HashSet::new();
        columns.insert(self.identifier.column.as_str());
        let mut names = HashSet::new();
        names.insert(self.identifier.attribute.as_str());

        for attribute in &self.attributes {
            if !is_valid_sql_name(&attribute.column) {
                return Err(invalid(format!(
                    "column '{}' of attribute '{}' is not a valid SQL name",
                    attribute.column, attribute.name
                )));
            }
            if !names.insert(attribute.name.as_str()) {
                return Err(invalid(format!("attribute '{}' is mapped twice", attribute.name)));
            }
            if !columns.insert(attribute.column.as_str()) {
                return Err(invalid(format!("column '{}' is mapped twice", attribute.column)));
            }
        }

        for association in &self.associations {
            if !names.insert(association.name.as_str()) {
                return Err(invalid(format!(
                    "association '{}' clashes with another attribute",
                    association.name
                )));
            }
            if let Some(column) = association.owner_column() {
                if !columns.insert(column) {
                    return Err(invalid(format!("column '{column}' is mapped twice")));
                }
            }
            if association.kind.is_single_valued() && association.column.is_none() {
                return Err(invalid(format!(
                    "association '{}' needs a foreign key column",
                    association.name
                )));
            }
        }

        if let Some(version) = &self.version {
            if self.attribute_index(version).is_none() {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownAttribute,
                    &self.name,
                    format!("version attribute '{version}' is not mapped"),
                ));
            }
        } else if self.optimistic_lock == OptimisticLockStyle::Version {
            tracing::trace!(
                entity = %self.name,
                "no version attribute, optimistic locking is effectively disabled"
            );
        }

        Ok(())
    }
}

fn sql_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)?$")
            .unwrap_or_else(|e| unreachable!("static pattern failed to compile: {e}"))
    })
}

/// Is `name` a plain (optionally schema-qualified) SQL identifier?
pub fn is_valid_sql_name(name: &str) -> bool {
    sql_name_pattern().is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::AssociationMapping;
    use crate::entity::DynamicEntity;
    use crate::generation::GenerationTiming;

    fn order_mapping() -> EntityMapping {
        EntityMapping::new(
            "Order",
            "orders",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned),
        )
        .attribute(AttributeMapping::new("status", "status").not_null())
        .attribute(AttributeMapping::new("version", "version"))
        .attribute(
            AttributeMapping::new("created_at", "created_at").generated(ValueGeneration::database(
                GenerationTiming::Insert,
                false,
                None,
            )),
        )
        .association(AssociationMapping::many_to_one(
            "customer",
            "Customer",
            "customer_id",
        ))
        .version("version")
    }

    #[test]
    fn test_state_round_trip() {
        let mapping = order_mapping();
        let entity = DynamicEntity::new("Order")
            .with("id", 1_i64)
            .with("status", "open")
            .with("version", 3_i64);
        let state = mapping.extract_state(&entity);
        assert_eq!(
            state,
            vec![Value::Text("open".into()), Value::BigInt(3), Value::Null]
        );
        assert_eq!(mapping.version_index(), Some(1));
        assert_eq!(mapping.identifier_of(&entity), Value::BigInt(1));

        let mut other = DynamicEntity::new("Order");
        mapping.apply_state(&mut other, &state);
        assert_eq!(other.get("status"), Value::Text("open".into()));
    }

    #[test]
    fn test_database_generated_detection() {
        let mapping = order_mapping();
        assert!(mapping.has_database_generated(GenerationEvent::Insert));
        assert!(!mapping.has_database_generated(GenerationEvent::Update));
    }

    #[test]
    fn test_validate_accepts_well_formed_mapping() {
        assert!(order_mapping().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_column() {
        let mapping = order_mapping().attribute(AttributeMapping::new("state", "status"));
        let err = mapping.validate().unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::Invalid));
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let mapping = order_mapping().version("revision");
        let err = mapping.validate().unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::UnknownAttribute));
    }

    #[test]
    fn test_sql_name_validation() {
        assert!(is_valid_sql_name("orders"));
        assert!(is_valid_sql_name("sales.orders"));
        assert!(!is_valid_sql_name("orders; drop table x"));
        assert!(!is_valid_sql_name("1orders"));
    }
}
