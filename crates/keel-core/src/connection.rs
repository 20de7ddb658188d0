//! Database connection traits.
//!
//! - [`Connection`] - the driver-facing trait used by the session to execute
//!   mutations and read back generated values
//! - [`QueryExecutor`] - a dyn-compatible view of a connection, handed to
//!   identifier generators that need a database round-trip
//!
//! All operations integrate with asupersync's structured concurrency via `Cx` context
//! for proper cancellation and timeout handling.

use crate::dialect::Dialect;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A database connection.
///
/// Drivers translate nothing themselves: the session hands them finished SQL
/// text in the connection's [`Dialect`] together with the bound parameters.
///
/// # Example
///
/// ```rust,ignore
/// let affected = conn
///     .execute(&cx, "UPDATE orders SET status = $1 WHERE id = $2", &[
///         Value::Text("shipped".into()),
///         Value::BigInt(7),
///     ])
///     .await;
/// ```
pub trait Connection: Send + Sync {
    /// The SQL dialect statements for this connection are rendered in.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute an INSERT and return the generated key of the new row.
    ///
    /// This is the generated-key channel used for identity columns.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;

    /// Execute multiple statements in a batch.
    ///
    /// Returns the number of rows affected by each statement, in order.
    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, crate::Error>> + Send;
}

/// Object-safe subset of [`Connection`].
///
/// Identifier generators are stored as trait objects inside shared mappings,
/// so they cannot be generic over the connection type. They receive a
/// `&dyn QueryExecutor` instead.
pub trait QueryExecutor: Send + Sync {
    /// The SQL dialect of the underlying connection.
    fn executor_dialect(&self) -> Dialect;

    /// Execute a query and return the first row.
    fn query_one_boxed<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Option<Row>, crate::Error>>;

    /// Execute a statement.
    fn execute_boxed<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<u64, crate::Error>>;
}

impl<C: Connection> QueryExecutor for C {
    fn executor_dialect(&self) -> Dialect {
        self.dialect()
    }

    fn query_one_boxed<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Option<Row>, crate::Error>> {
        Box::pin(self.query_one(cx, sql, params))
    }

    fn execute_boxed<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<u64, crate::Error>> {
        Box::pin(self.execute(cx, sql, params))
    }
}
