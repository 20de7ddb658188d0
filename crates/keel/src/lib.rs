//! Keel - the write path of an object-relational mapper.
//!
//! Keel takes an in-memory object graph and makes it persistent:
//!
//! - Identifier resolution with assigned, identity, sequence, table,
//!   increment, UUID and user-supplied generators
//! - A persistence context holding one entry per managed instance
//! - Cascading saves and deletes along associations, in foreign-key order
//! - An action queue flushing INSERTs, UPDATEs, link rows and DELETEs with
//!   row-count checks and optimistic locking
//! - Read-back of database-generated columns
//!
//! # Quick Start
//!
//! ```ignore
//! use keel::prelude::*;
//!
//! let metamodel = Metamodel::builder(Dialect::Postgres)
//!     .entity_with_strategy(
//!         EntityMapping::new("Author", "authors", IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned))
//!             .attribute(AttributeMapping::new("name", "name").not_null()),
//!         "sequence",
//!     )
//!     .build()?;
//!
//! let mut session = Session::new(conn, Arc::new(metamodel));
//! let author = DynamicEntity::new("Author").with("name", "Le Guin").into_ref();
//!
//! let id = session.save(&cx, &author).await;
//! session.commit(&cx).await;
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: every database operation takes a `Cx` and
//!   returns an asupersync `Outcome`
//! - **Dialects**: PostgreSQL, SQLite, MySQL and H2 statement rendering
//! - **Bring your own driver**: implement [`Connection`] for any client

// Re-export all public types from sub-crates
pub use keel_core::{
    // Entities
    Associated,
    // Mappings
    AssociationKind,
    AssociationMapping,
    AttributeMapping,
    CascadeAction,
    CascadeStyle,
    CollectionId,
    // Core types
    Connection,
    Cx,
    Dialect,
    DynamicEntity,
    Entity,
    EntityId,
    EntityMapping,
    EntityRef,
    Error,
    GenerationEvent,
    GenerationKind,
    GenerationTiming,
    IdentifierGenerator,
    IdentifierMapping,
    IdentifierStrategy,
    LifecycleVerdict,
    LinkTable,
    MappingErrorKind,
    OnDeleteAction,
    OptimisticLockStyle,
    Outcome,
    PersistErrorKind,
    QueryExecutor,
    Result,
    Row,
    TimestampSource,
    TransactionError,
    TransactionErrorKind,
    Value,
    ValueGeneration,
    ValueGenerator,
};

pub use keel_session::{
    AliasPolicy, CascadeContext, CascadePoint, CascadeVisits, EntityEntry, EntityKey, FlushResult,
    GeneratorRegistry, InMemoryGenerator, IncrementGenerator, Interceptor, LockMode, Metamodel,
    MetamodelBuilder, PendingCounts, SequenceGenerator, Session, SessionConfig,
    SessionDebugInfo, SessionEvent, Status, TableGenerator, UuidGenerator,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use keel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AssociationMapping, AttributeMapping, CascadeStyle, Connection, Cx, Dialect,
        DynamicEntity, Entity, EntityMapping, EntityRef, Error, IdentifierMapping,
        IdentifierStrategy, LinkTable, Metamodel, OptimisticLockStyle, Outcome, Session,
        SessionConfig, Status, Value,
    };
    pub use std::sync::Arc;
}
