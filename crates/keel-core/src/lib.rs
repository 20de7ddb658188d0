//! Core types and traits for Keel.
//!
//! This crate provides the foundational abstractions shared by the write path:
//!
//! - `Value` and `Row` for dynamically typed SQL data
//! - `Entity` trait and the shared `EntityRef` handle
//! - Mapping metadata (`EntityMapping`, `AssociationMapping`, `ValueGeneration`)
//! - `Connection` trait for database connections and the `Dialect` it speaks
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod association;
pub mod connection;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod generation;
pub mod mapping;
pub mod row;
pub mod value;

pub use association::{
    AssociationKind, AssociationMapping, CascadeAction, CascadeStyle, CollectionId, LinkTable,
    OnDeleteAction,
};
pub use connection::{BoxFuture, Connection, QueryExecutor};
pub use dialect::Dialect;
pub use entity::{Associated, DynamicEntity, Entity, EntityId, EntityRef, LifecycleVerdict};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, MappingError, MappingErrorKind,
    PersistError, PersistErrorKind, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind,
};
pub use generation::{
    GenerationEvent, GenerationKind, GenerationTiming, TimestampSource, ValueGeneration,
    ValueGenerator, VmTimestampGenerator,
};
pub use mapping::{
    AttributeMapping, EntityMapping, IdentifierGenerator, IdentifierMapping, IdentifierStrategy,
    OptimisticLockStyle, is_valid_sql_name,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
