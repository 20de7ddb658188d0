//! Structural model of a single-table mutation.
//!
//! A [`TableMutation`] holds what a statement does, not its text: the value
//! bindings of the column list, the key restrictions identifying the row and
//! the optimistic-lock restrictions appended to the WHERE clause. Rendering
//! to SQL happens once, against the connection's dialect.

use keel_core::{Dialect, Value};
use std::fmt::Write as _;

/// Statement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl MutationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

/// Right-hand side of a binding.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingExpr {
    /// Bound parameter; index into the mutation's parameter slots.
    Parameter(usize),
    /// SQL expression rendered verbatim.
    Literal(String),
    /// `IS NULL` restriction. Binds nothing.
    IsNull,
}

/// One column and what it is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBinding {
    pub column: String,
    pub expr: BindingExpr,
}

/// Single-table INSERT, UPDATE or DELETE.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMutation {
    kind: MutationKind,
    table: String,
    values: Vec<ColumnBinding>,
    key_restrictions: Vec<ColumnBinding>,
    optimistic_lock_restrictions: Vec<ColumnBinding>,
    slots: Vec<Value>,
}

impl TableMutation {
    pub fn new(kind: MutationKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            values: Vec::new(),
            key_restrictions: Vec::new(),
            optimistic_lock_restrictions: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Column-list bindings (INSERT columns, UPDATE SET clause).
    pub fn values(&self) -> &[ColumnBinding] {
        &self.values
    }

    /// Row-identifying restrictions.
    pub fn key_restrictions(&self) -> &[ColumnBinding] {
        &self.key_restrictions
    }

    /// Optimistic-lock restrictions.
    pub fn optimistic_lock_restrictions(&self) -> &[ColumnBinding] {
        &self.optimistic_lock_restrictions
    }

    fn slot(&mut self, value: Value) -> BindingExpr {
        self.slots.push(value);
        BindingExpr::Parameter(self.slots.len() - 1)
    }

    fn restriction(&mut self, column: String, value: Value) -> ColumnBinding {
        let expr = if value.is_null() {
            BindingExpr::IsNull
        } else {
            self.slot(value)
        };
        ColumnBinding { column, expr }
    }

    /// Bind `column` to a parameter.
    pub fn add_value(&mut self, column: impl Into<String>, value: Value) {
        let expr = self.slot(value);
        self.values.push(ColumnBinding {
            column: column.into(),
            expr,
        });
    }

    /// Bind `column` to a SQL expression.
    pub fn add_value_literal(&mut self, column: impl Into<String>, sql: impl Into<String>) {
        self.values.push(ColumnBinding {
            column: column.into(),
            expr: BindingExpr::Literal(sql.into()),
        });
    }

    /// Restrict on `column = value`, or `column IS NULL`.
    pub fn add_key_restriction(&mut self, column: impl Into<String>, value: Value) {
        let binding = self.restriction(column.into(), value);
        self.key_restrictions.push(binding);
    }

    /// Restrict on the previous value of `column`.
    pub fn add_optimistic_lock_restriction(&mut self, column: impl Into<String>, value: Value) {
        let binding = self.restriction(column.into(), value);
        self.optimistic_lock_restrictions.push(binding);
    }

    /// Replace the parameter bound to value column `column`.
    ///
    /// Returns `false` when the column is not bound to a parameter.
    pub fn rebind_value(&mut self, column: &str, value: Value) -> bool {
        let slot = self.values.iter().find_map(|b| match b.expr {
            BindingExpr::Parameter(index) if b.column == column => Some(index),
            _ => None,
        });
        match slot.and_then(|index| self.slots.get_mut(index)) {
            Some(current) => {
                *current = value;
                true
            }
            None => false,
        }
    }

    /// Current value bound to value column `column`.
    pub fn value_of(&self, column: &str) -> Option<&Value> {
        self.values.iter().find_map(|b| match b.expr {
            BindingExpr::Parameter(index) if b.column == column => self.slots.get(index),
            _ => None,
        })
    }

    fn bindings(&self) -> impl Iterator<Item = &ColumnBinding> {
        self.values
            .iter()
            .chain(&self.key_restrictions)
            .chain(&self.optimistic_lock_restrictions)
    }

    /// Bound parameters in placeholder order: values, then keys, then locks.
    pub fn parameters(&self) -> Vec<Value> {
        self.bindings()
            .filter_map(|b| match b.expr {
                BindingExpr::Parameter(index) => self.slots.get(index).cloned(),
                _ => None,
            })
            .collect()
    }

    /// Does the UPDATE have nothing to set?
    pub fn is_empty_update(&self) -> bool {
        self.kind == MutationKind::Update && self.values.is_empty()
    }

    /// Render the statement.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        let mut next = 0_usize;
        let mut render = |expr: &BindingExpr| -> String {
            match expr {
                BindingExpr::Parameter(_) => {
                    next += 1;
                    dialect.placeholder(next)
                }
                BindingExpr::Literal(sql) => sql.clone(),
                BindingExpr::IsNull => String::new(),
            }
        };

        let table = dialect.quote_identifier(&self.table);
        let mut sql = match self.kind {
            MutationKind::Insert if self.values.is_empty() => match dialect {
                Dialect::Mysql => format!("INSERT INTO {table} () VALUES ()"),
                _ => format!("INSERT INTO {table} DEFAULT VALUES"),
            },
            MutationKind::Insert => {
                let columns: Vec<String> = self
                    .values
                    .iter()
                    .map(|b| dialect.quote_identifier(&b.column))
                    .collect();
                let values: Vec<String> = self.values.iter().map(|b| render(&b.expr)).collect();
                format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    columns.join(", "),
                    values.join(", ")
                )
            }
            MutationKind::Update => {
                let set: Vec<String> = self
                    .values
                    .iter()
                    .map(|b| format!("{} = {}", dialect.quote_identifier(&b.column), render(&b.expr)))
                    .collect();
                format!("UPDATE {table} SET {}", set.join(", "))
            }
            MutationKind::Delete => format!("DELETE FROM {table}"),
        };

        let predicates: Vec<String> = self
            .key_restrictions
            .iter()
            .chain(&self.optimistic_lock_restrictions)
            .map(|b| {
                let column = dialect.quote_identifier(&b.column);
                match &b.expr {
                    BindingExpr::IsNull => format!("{column} IS NULL"),
                    expr => format!("{column} = {}", render(expr)),
                }
            })
            .collect();
        if !predicates.is_empty() {
            let _ = write!(sql, " WHERE {}", predicates.join(" AND "));
        }
        sql
    }
}
