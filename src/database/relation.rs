//! Relation identity
//!
//! This module defines how database relations are identified inside the
//! cache (`ReferenceKey`), what kind of object they are (`RelationKind`), and
//! the descriptor values callers store alongside cache entries.

use crate::error::{RelcacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cache key for a relation: `(schema, identifier)`.
///
/// Case-sensitive as stored; callers normalize case before building one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceKey {
    pub schema: String,
    pub identifier: String,
}

impl ReferenceKey {
    pub fn new(schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.identifier)
    }
}

/// The kind of database object a relation is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Physical table
    Table,
    /// View
    View,
    /// Common table expression (never physically created)
    Cte,
    /// Materialized view
    MaterializedView,
    /// Externally managed table
    External,
}

impl RelationKind {
    /// Name used in DDL and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Table => "table",
            RelationKind::View => "view",
            RelationKind::Cte => "cte",
            RelationKind::MaterializedView => "materialized view",
            RelationKind::External => "external",
        }
    }

    /// Map the type names warehouses report in their catalogs
    /// (`information_schema.tables.table_type`, `sqlite_master.type`,
    /// `pg_class.relkind`) to a kind.
    pub fn from_catalog(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "base table" | "table" | "r" | "p" => Some(RelationKind::Table),
            "view" | "v" => Some(RelationKind::View),
            "materialized view" | "materializedview" | "m" => Some(RelationKind::MaterializedView),
            "foreign table" | "foreign" | "external" | "f" => Some(RelationKind::External),
            "cte" => Some(RelationKind::Cte),
            _ => None,
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RelationKind {
    type Err = RelcacheError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RelationKind::from_catalog(s)
            .ok_or_else(|| RelcacheError::runtime(format!("Unknown relation kind: {}", s)))
    }
}

/// A relation description stored as the payload of a cache node.
///
/// The cache never looks inside it; it only asks for a copy pointing at a
/// new location when the relation is renamed.
pub trait RelationDescriptor: Clone + fmt::Debug + Send + Sync + 'static {
    /// Return a copy of this descriptor with its schema and identifier replaced
    fn with_path(&self, schema: &str, identifier: &str) -> Self;
}

/// Which path components are quoted (or included) when rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub database: bool,
    pub schema: bool,
    pub identifier: bool,
}

impl Policy {
    pub fn all() -> Self {
        Self {
            database: true,
            schema: true,
            identifier: true,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::all()
    }
}

/// Fully qualified relation with its quoting rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRelation {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub identifier: Option<String>,
    /// Name used when rendering; usually the identifier
    pub table_name: Option<String>,
    pub kind: Option<RelationKind>,
    pub quote_policy: Policy,
    pub include_policy: Policy,
    pub quote_character: char,
}

impl BaseRelation {
    /// Create a relation at the given path with default policies
    pub fn create(
        database: Option<&str>,
        schema: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            database: database.map(str::to_string),
            schema: Some(schema.into()),
            table_name: Some(identifier.clone()),
            identifier: Some(identifier),
            kind: None,
            quote_policy: Policy::all(),
            include_policy: Policy::all(),
            quote_character: '"',
        }
    }

    /// Set the relation kind
    pub fn with_kind(mut self, kind: RelationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Replace the quote policy
    pub fn with_quote_policy(mut self, policy: Policy) -> Self {
        self.quote_policy = policy;
        self
    }

    /// Replace the include policy
    pub fn with_include_policy(mut self, policy: Policy) -> Self {
        self.include_policy = policy;
        self
    }

    /// Use a different quote character (e.g. a backtick)
    pub fn with_quote_character(mut self, quote: char) -> Self {
        self.quote_character = quote;
        self
    }

    pub fn is_view(&self) -> bool {
        self.kind == Some(RelationKind::View)
    }

    /// The cache key for this relation, if it has a full path
    pub fn key(&self) -> Option<ReferenceKey> {
        match (&self.schema, &self.identifier) {
            (Some(schema), Some(identifier)) => Some(ReferenceKey::new(schema, identifier)),
            _ => None,
        }
    }

    /// True when every given component equals ours exactly
    pub fn matches(
        &self,
        database: Option<&str>,
        schema: Option<&str>,
        identifier: Option<&str>,
    ) -> Result<bool> {
        if database.is_none() && schema.is_none() && identifier.is_none() {
            return Err(RelcacheError::runtime(
                "Tried to match relation, but no search path was passed!",
            ));
        }
        let checks = [
            (database, self.database.as_deref()),
            (schema, self.schema.as_deref()),
            (identifier, self.identifier.as_deref()),
        ];
        Ok(checks
            .iter()
            .all(|(wanted, ours)| wanted.map_or(true, |w| Some(w) == *ours)))
    }

    /// Wrap a single name in the quote character
    pub fn quoted(&self, name: &str) -> String {
        quote_identifier(name, self.quote_character)
    }

    /// Render the dotted path honoring include and quote policies
    pub fn render(&self) -> Result<String> {
        let identifier = self.table_name.as_ref().or(self.identifier.as_ref());
        let parts = [
            (self.include_policy.database, self.quote_policy.database, self.database.as_ref()),
            (self.include_policy.schema, self.quote_policy.schema, self.schema.as_ref()),
            (self.include_policy.identifier, self.quote_policy.identifier, identifier),
        ];

        let rendered: Vec<String> = parts
            .iter()
            .filter(|(include, _, _)| *include)
            .filter_map(|(_, quote, part)| {
                part.map(|p| if *quote { self.quoted(p) } else { p.clone() })
            })
            .collect();

        if rendered.is_empty() {
            return Err(RelcacheError::runtime(
                "No path parts are included! Nothing to render.",
            ));
        }
        Ok(rendered.join("."))
    }
}

/// Wrap `name` in `quote`, doubling any embedded quote characters
pub fn quote_identifier(name: &str, quote: char) -> String {
    let escaped = name.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}

impl RelationDescriptor for BaseRelation {
    fn with_path(&self, schema: &str, identifier: &str) -> Self {
        let mut renamed = self.clone();
        renamed.schema = Some(schema.to_string());
        renamed.identifier = Some(identifier.to_string());
        renamed.table_name = Some(identifier.to_string());
        renamed
    }
}

impl fmt::Display for BaseRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Ok(rendered) => write!(f, "{}", rendered),
            Err(_) => write!(f, "<empty relation>"),
        }
    }
}
