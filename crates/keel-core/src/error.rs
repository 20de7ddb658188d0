//! Error types for Keel operations.

use std::fmt;

/// The primary error type for all Keel operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Query execution errors
    Query(QueryError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Write-path failures raised while saving, flushing or deleting entities
    Persist(PersistError),
    /// Mapping errors, raised while the metamodel is being resolved
    Mapping(MappingError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// No transaction is active
    NotActive,
    /// Begin was attempted while a transaction is active
    AlreadyActive,
    /// An aborted save left rows in the transaction; only rollback is allowed
    RollbackOnly,
}

/// A failure raised by the write pipeline for one entity.
#[derive(Debug)]
pub struct PersistError {
    pub kind: PersistErrorKind,
    /// Entity name of the instance being persisted.
    pub entity: String,
    /// Identifier rendered for diagnostics, when one is known.
    pub identifier: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistErrorKind {
    /// The identifier generator produced no value
    IdentifierGeneration,
    /// Another live instance is already registered under the same key
    DuplicateKey,
    /// An UPDATE or DELETE matched no row
    OptimisticLock,
    /// The read-back of database generated values did not find exactly one row
    GeneratedValueConsistency,
    /// An association references an entity that has no identifier yet
    TransientReference,
    /// The entity is not managed by this session
    NotManaged,
    /// A statement affected a different number of rows than expected
    UnexpectedRowCount,
    /// The version attribute cannot be incremented any further
    VersionExhausted,
}

/// A configuration-time error found while resolving mappings.
#[derive(Debug)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    /// Entity (or collection role) the error belongs to.
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// The requested generation strategy is not legal in this position
    UnsupportedStrategy,
    /// No mapping is registered under the entity name
    UnknownEntity,
    /// The mapping does not declare the attribute
    UnknownAttribute,
    /// Structurally invalid mapping
    Invalid,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a persist error for `entity`.
    pub fn persist(
        kind: PersistErrorKind,
        entity: impl Into<String>,
        identifier: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Persist(PersistError {
            kind,
            entity: entity.into(),
            identifier,
            message: message.into(),
            source: None,
        })
    }

    /// Build a mapping error for `entity`.
    pub fn mapping(
        kind: MappingErrorKind,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Mapping(MappingError {
            kind,
            entity: entity.into(),
            message: message.into(),
        })
    }

    /// Kind of the persist error, if this is one.
    pub fn persist_kind(&self) -> Option<PersistErrorKind> {
        match self {
            Error::Persist(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Kind of the mapping error, if this is one.
    pub fn mapping_kind(&self) -> Option<MappingErrorKind> {
        match self {
            Error::Mapping(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Did an UPDATE/DELETE lose an optimistic-lock race?
    pub fn is_optimistic_lock_failure(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::OptimisticLock)
    }

    /// Was a second instance registered under a live key?
    pub fn is_duplicate_key(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::DuplicateKey)
    }

    /// Can the caller expect a retry of the whole transaction to succeed?
    ///
    /// Keel never retries internally; this only classifies the failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::Persist(p) => p.kind == PersistErrorKind::OptimisticLock,
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::Disconnected),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Persist(e) => write!(f, "Persist error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Persist(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(id) => write!(f, "{} [{}#{}]", self.message, self.entity, id),
            None => write!(f, "{} [{}]", self.message, self.entity),
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PersistError> for Error {
    fn from(err: PersistError) -> Self {
        Error::Persist(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, Error>;
