//! Per-attribute value generation metadata.
//!
//! An attribute may be generated in memory right before the statement is
//! built, or by the database while the statement executes. Database
//! generated values are read back after the mutation by the session's
//! generated-values processor.

use crate::dialect::Dialect;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// The mutation that triggered generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenerationEvent {
    /// The row was inserted.
    Insert,
    /// The row was updated.
    Update,
}

/// When an attribute value is (re)generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationTiming {
    /// Never generated.
    #[default]
    Never,
    /// Generated on insert only.
    Insert,
    /// Generated on insert and on every update.
    Always,
}

impl GenerationTiming {
    /// Does this timing regenerate on `event`?
    pub const fn includes(self, event: GenerationEvent) -> bool {
        match self {
            GenerationTiming::Never => false,
            GenerationTiming::Insert => matches!(event, GenerationEvent::Insert),
            GenerationTiming::Always => true,
        }
    }

    /// True for anything but `Never`.
    pub const fn is_generated(self) -> bool {
        !matches!(self, GenerationTiming::Never)
    }
}

/// Generates an attribute value in memory.
pub trait ValueGenerator: Send + Sync + fmt::Debug {
    /// Produce the value for `event`, given the attribute's current value.
    fn generate(&self, event: GenerationEvent, current: &Value) -> Value;
}

/// Stamps `Value::Timestamp` from the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmTimestampGenerator;

impl ValueGenerator for VmTimestampGenerator {
    fn generate(&self, _event: GenerationEvent, _current: &Value) -> Value {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX));
        Value::Timestamp(micros)
    }
}

/// Where a timestamp value comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampSource {
    /// The application's clock.
    Vm,
    /// The database's `current_timestamp`.
    #[default]
    Db,
}

/// How the value is produced.
#[derive(Debug, Clone)]
pub enum GenerationKind {
    /// The database produces the value.
    Database {
        /// Whether the column appears in the mutation's column list.
        writable: bool,
        /// SQL expression written in place of a parameter. Implies `writable`.
        sql: Option<String>,
    },
    /// The value is produced in memory before the statement is built.
    InMemory(Arc<dyn ValueGenerator>),
}

/// Generation metadata of one attribute.
#[derive(Debug, Clone)]
pub struct ValueGeneration {
    /// When the value is generated.
    pub timing: GenerationTiming,
    /// How it is generated.
    pub kind: GenerationKind,
}

impl ValueGeneration {
    /// Database generated value. A SQL expression makes the column writable.
    pub fn database(timing: GenerationTiming, writable: bool, sql: Option<String>) -> Self {
        let writable = writable || sql.is_some();
        Self {
            timing,
            kind: GenerationKind::Database { writable, sql },
        }
    }

    /// In-memory generated value.
    pub fn in_memory(timing: GenerationTiming, generator: Arc<dyn ValueGenerator>) -> Self {
        Self {
            timing,
            kind: GenerationKind::InMemory(generator),
        }
    }

    /// Creation timestamp: generated once, on insert.
    pub fn creation_timestamp(source: TimestampSource, dialect: Dialect) -> Self {
        Self::current_timestamp(GenerationTiming::Insert, source, dialect)
    }

    /// Current timestamp generated with `timing`.
    pub fn current_timestamp(
        timing: GenerationTiming,
        source: TimestampSource,
        dialect: Dialect,
    ) -> Self {
        match source {
            TimestampSource::Vm => Self::in_memory(timing, Arc::new(VmTimestampGenerator)),
            TimestampSource::Db => Self::database(
                timing,
                true,
                Some(dialect.current_timestamp_sql().to_string()),
            ),
        }
    }

    /// Is the value produced by the database?
    pub const fn is_database_generated(&self) -> bool {
        matches!(self.kind, GenerationKind::Database { .. })
    }

    /// Does the column appear in the mutation's column list?
    pub fn references_column_in_sql(&self) -> bool {
        match &self.kind {
            GenerationKind::Database { writable, .. } => *writable,
            GenerationKind::InMemory(_) => true,
        }
    }

    /// SQL expression to render instead of a bound parameter.
    pub fn referenced_column_value(&self) -> Option<&str> {
        match &self.kind {
            GenerationKind::Database { sql, .. } => sql.as_deref(),
            GenerationKind::InMemory(_) => None,
        }
    }

    /// Is the entity's own property value bound as a parameter?
    pub fn writes_property_value(&self) -> bool {
        match &self.kind {
            GenerationKind::Database { writable, sql } => *writable && sql.is_none(),
            GenerationKind::InMemory(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_includes() {
        assert!(GenerationTiming::Insert.includes(GenerationEvent::Insert));
        assert!(!GenerationTiming::Insert.includes(GenerationEvent::Update));
        assert!(GenerationTiming::Always.includes(GenerationEvent::Update));
        assert!(!GenerationTiming::Never.includes(GenerationEvent::Insert));
    }

    #[test]
    fn test_database_generation_flags() {
        let plain = ValueGeneration::database(GenerationTiming::Insert, false, None);
        assert!(!plain.references_column_in_sql());
        assert!(!plain.writes_property_value());

        let writable = ValueGeneration::database(GenerationTiming::Always, true, None);
        assert!(writable.references_column_in_sql());
        assert!(writable.writes_property_value());

        let with_sql =
            ValueGeneration::database(GenerationTiming::Insert, false, Some("now()".into()));
        assert!(with_sql.references_column_in_sql());
        assert!(!with_sql.writes_property_value());
        assert_eq!(with_sql.referenced_column_value(), Some("now()"));
    }

    #[test]
    fn test_creation_timestamp_sources() {
        let db = ValueGeneration::creation_timestamp(TimestampSource::Db, Dialect::H2);
        assert!(db.is_database_generated());
        assert_eq!(db.timing, GenerationTiming::Insert);
        assert_eq!(db.referenced_column_value(), Some("current_timestamp"));

        let vm = ValueGeneration::creation_timestamp(TimestampSource::Vm, Dialect::H2);
        assert!(!vm.is_database_generated());
        let GenerationKind::InMemory(generator) = &vm.kind else {
            panic!("expected in-memory generation");
        };
        assert!(matches!(
            generator.generate(GenerationEvent::Insert, &Value::Null),
            Value::Timestamp(t) if t > 0
        ));
    }
}
