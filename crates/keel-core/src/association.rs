//! Association metadata.
//!
//! Associations connect one entity mapping to another. The write path uses
//! them for two things: cascading persistence actions to related instances,
//! and filling foreign-key columns from the related instance's identifier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The type of association between two entity mappings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationKind {
    /// Many-to-one: many `OrderLine`s belong to one `Order`.
    #[default]
    ManyToOne,
    /// One-to-one owned through a local foreign key.
    OneToOne,
    /// One-to-many: one `Order` has many `OrderLine`s.
    OneToMany,
    /// Many-to-many through a link table.
    ManyToMany,
}

impl AssociationKind {
    /// Single-valued associations hold the foreign key on the owner's row.
    pub const fn is_single_valued(self) -> bool {
        matches!(self, AssociationKind::ManyToOne | AssociationKind::OneToOne)
    }

    /// Collection-valued associations.
    pub const fn is_collection(self) -> bool {
        !self.is_single_valued()
    }
}

/// A persistence action that can be cascaded along an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CascadeAction {
    /// save / persist / update
    SaveUpdate,
    /// delete
    Delete,
}

impl fmt::Display for CascadeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeAction::SaveUpdate => write!(f, "save-update"),
            CascadeAction::Delete => write!(f, "delete"),
        }
    }
}

/// Set of cascaded actions configured on an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeStyle {
    save_update: bool,
    delete: bool,
}

impl CascadeStyle {
    /// Nothing cascades.
    pub const NONE: CascadeStyle = CascadeStyle {
        save_update: false,
        delete: false,
    };
    /// Saves and updates cascade.
    pub const SAVE_UPDATE: CascadeStyle = CascadeStyle {
        save_update: true,
        delete: false,
    };
    /// Deletes cascade.
    pub const DELETE: CascadeStyle = CascadeStyle {
        save_update: false,
        delete: true,
    };
    /// Everything cascades.
    pub const ALL: CascadeStyle = CascadeStyle {
        save_update: true,
        delete: true,
    };

    /// Does this style cascade `action`?
    pub const fn includes(self, action: CascadeAction) -> bool {
        match action {
            CascadeAction::SaveUpdate => self.save_update,
            CascadeAction::Delete => self.delete,
        }
    }

    /// Parse a comma separated cascade list such as `"save-update, delete"`.
    ///
    /// Accepts `all`, `none`, `save-update`, `persist`, `merge`, `delete` and
    /// `remove`; returns `None` for any other token.
    pub fn parse(list: &str) -> Option<Self> {
        let mut style = CascadeStyle::NONE;
        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "all" => style = CascadeStyle::ALL,
                "none" => {}
                "save-update" | "save_update" | "persist" | "merge" => style.save_update = true,
                "delete" | "remove" => style.delete = true,
                _ => return None,
            }
        }
        Some(style)
    }
}

/// Foreign key ON DELETE behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnDeleteAction {
    /// Raise an error if referencing rows exist.
    #[default]
    NoAction,
    /// Delete referencing rows.
    Cascade,
    /// Like `NoAction`, checked immediately.
    Restrict,
    /// Null out the referencing columns.
    SetNull,
    /// Reset the referencing columns to their defaults.
    SetDefault,
}

impl OnDeleteAction {
    const ALL: [OnDeleteAction; 5] = [
        OnDeleteAction::NoAction,
        OnDeleteAction::Cascade,
        OnDeleteAction::Restrict,
        OnDeleteAction::SetNull,
        OnDeleteAction::SetDefault,
    ];

    /// Upper-case variant name (`NO_ACTION`, `SET_NULL`, ...).
    pub const fn name(self) -> &'static str {
        match self {
            OnDeleteAction::NoAction => "NO_ACTION",
            OnDeleteAction::Cascade => "CASCADE",
            OnDeleteAction::Restrict => "RESTRICT",
            OnDeleteAction::SetNull => "SET_NULL",
            OnDeleteAction::SetDefault => "SET_DEFAULT",
        }
    }

    /// Hyphenated spelling (`no-action`, `set-null`, ...).
    pub fn alternative_name(self) -> String {
        self.name().to_ascii_lowercase().replace('_', "-")
    }

    /// Clause text as it appears in DDL.
    pub fn to_sql(self) -> String {
        self.name().to_ascii_lowercase().replace('_', " ")
    }

    /// Parse the exact variant name, or the hyphenated spelling in any case.
    pub fn from_external_form(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.name() == value)
            .or_else(|| {
                Self::ALL
                    .into_iter()
                    .find(|action| action.alternative_name().eq_ignore_ascii_case(value))
            })
    }
}

/// Link table of a many-to-many association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTable {
    /// Table name.
    pub table: String,
    /// Column referencing the owner.
    pub owner_column: String,
    /// Column referencing the element.
    pub element_column: String,
    /// Surrogate row identifier (id-bag semantics).
    pub collection_id: Option<CollectionId>,
}

impl LinkTable {
    /// Create a link table definition.
    pub fn new(
        table: impl Into<String>,
        owner_column: impl Into<String>,
        element_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_column: owner_column.into(),
            element_column: element_column.into(),
            collection_id: None,
        }
    }

    /// Give every link row a generated surrogate identifier.
    #[must_use]
    pub fn with_collection_id(
        mut self,
        column: impl Into<String>,
        generator: impl Into<String>,
    ) -> Self {
        self.collection_id = Some(CollectionId {
            column: column.into(),
            generator: generator.into(),
            generator_name: None,
        });
        self
    }
}

/// Surrogate identifier column of an id-bag link table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionId {
    /// Identifier column.
    pub column: String,
    /// Requested generator strategy (e.g. `"sequence"`, `"uuid"`, a custom name).
    pub generator: String,
    /// Generator instance name after alias resolution. Filled in by the metamodel.
    pub generator_name: Option<String>,
}

/// An association attribute of an entity mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationMapping {
    /// Attribute name on the owning entity.
    pub name: String,
    /// Association kind.
    pub kind: AssociationKind,
    /// Target entity name.
    pub target: String,
    /// Foreign key column. For single-valued associations it lives on the
    /// owner's table; for one-to-many it lives on the target's table.
    pub column: Option<String>,
    /// Actions cascaded to the associated instances.
    pub cascade: CascadeStyle,
    /// Database-side ON DELETE behaviour of the foreign key.
    pub on_delete: OnDeleteAction,
    /// Link table for many-to-many.
    pub link: Option<LinkTable>,
    /// May the association be empty at insert time?
    pub optional: bool,
}

impl AssociationMapping {
    /// Create an association with no cascading and an optional target.
    pub fn new(name: impl Into<String>, kind: AssociationKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            column: None,
            cascade: CascadeStyle::NONE,
            on_delete: OnDeleteAction::NoAction,
            link: None,
            optional: true,
        }
    }

    /// Many-to-one through `column` on the owner's table.
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self::new(name, AssociationKind::ManyToOne, target).column(column)
    }

    /// One-to-many through `column` on the target's table.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self::new(name, AssociationKind::OneToMany, target).column(column)
    }

    /// Many-to-many through a link table.
    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>, link: LinkTable) -> Self {
        let mut mapping = Self::new(name, AssociationKind::ManyToMany, target);
        mapping.link = Some(link);
        mapping
    }

    /// Set the foreign key column.
    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Set the cascade style.
    #[must_use]
    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    /// Set the ON DELETE behaviour.
    #[must_use]
    pub fn on_delete(mut self, action: OnDeleteAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Require a target at insert time.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    /// Foreign key column stored on the owner's own row, if any.
    pub fn owner_column(&self) -> Option<&str> {
        if self.kind.is_single_valued() {
            self.column.as_deref()
        } else {
            None
        }
    }
}
