//! SQL dialects.
//!
//! Only the pieces the write path needs: placeholders, identifier quoting,
//! sequence access and identity-column support strings.

use serde::{Deserialize, Serialize};

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
    /// H2 dialect (uses ? placeholders)
    H2,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql | Dialect::H2 => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are escaped by doubling them.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite | Dialect::H2 => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Does the database have native sequences?
    pub const fn supports_sequences(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::H2)
    }

    /// Query returning the next value of `sequence`, or `None` without sequence support.
    pub fn sequence_next_value_sql(self, sequence: &str) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!(
                "SELECT nextval('{}')",
                sequence.replace('\'', "''")
            )),
            Dialect::H2 => Some(format!(
                "SELECT NEXT VALUE FOR {}",
                self.quote_identifier(sequence)
            )),
            Dialect::Sqlite | Dialect::Mysql => None,
        }
    }

    /// Column definition fragment for an identity column.
    pub const fn identity_column_string(self) -> &'static str {
        match self {
            Dialect::Postgres => "generated by default as identity",
            Dialect::Sqlite => "primary key autoincrement",
            Dialect::Mysql => "auto_increment",
            Dialect::H2 => "generated by default as identity",
        }
    }

    /// Statement that reads back the last generated identity value.
    pub const fn identity_select_string(self) -> &'static str {
        match self {
            Dialect::Postgres => "select lastval()",
            Dialect::Sqlite => "select last_insert_rowid()",
            Dialect::Mysql => "select last_insert_id()",
            Dialect::H2 => "call identity()",
        }
    }

    /// Value placed in the identity column of an INSERT that lists it.
    pub const fn identity_insert_string(self) -> &'static str {
        match self {
            Dialect::Postgres | Dialect::Mysql | Dialect::H2 => "default",
            Dialect::Sqlite => "null",
        }
    }

    /// SQL expression for the database's current timestamp.
    pub const fn current_timestamp_sql(self) -> &'static str {
        "current_timestamp"
    }
}
