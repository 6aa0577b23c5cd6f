//! Warehouse driver interface
//!
//! `ConnectionDriver` is the primitive the connection manager drives: open a
//! handle, run SQL on it, manage transactions, close it, and optionally cancel
//! it from another session. It also carries the small amount of dialect SQL
//! the adapter needs to keep the relation cache in step with the warehouse.

use crate::config::Credentials;
use crate::database::connection::DatabaseBackend;
use crate::database::relation::{quote_identifier, BaseRelation, ReferenceKey, RelationKind};
use crate::error::{RelcacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of one statement, with every cell rendered as text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Driver status line, e.g. `SELECT 3`
    pub status: String,
    pub rows_affected: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    /// A result for a statement that returned no rows
    pub fn affected(sql: &str, rows_affected: u64) -> Self {
        Self {
            status: format!("{} {}", statement_verb(sql), rows_affected),
            rows_affected,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// A result for a statement that returned rows
    pub fn fetched(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            status: format!("SELECT {}", rows.len()),
            rows_affected: rows.len() as u64,
            columns,
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Cell at `row` in the named column
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)?.as_deref()
    }
}

/// First keyword of a statement, uppercased
fn statement_verb(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .map(|word| word.trim_end_matches(';').to_uppercase())
        .unwrap_or_else(|| "OK".to_string())
}

/// One relation as reported by the warehouse catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRelation {
    pub schema: String,
    pub identifier: String,
    pub kind: Option<RelationKind>,
}

impl CatalogRelation {
    /// Read `schema`, `name`, `type` rows from a listing query
    pub fn from_result(result: &QueryResult) -> Result<Vec<Self>> {
        let mut relations = Vec::with_capacity(result.rows.len());
        for row in 0..result.rows.len() {
            let schema = required(result, row, "schema")?;
            let identifier = required(result, row, "name")?;
            let kind = result.get(row, "type").and_then(RelationKind::from_catalog);
            relations.push(Self {
                schema: schema.to_string(),
                identifier: identifier.to_string(),
                kind,
            });
        }
        Ok(relations)
    }
}

/// A dependency edge: `dependent` selects from `referenced`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationLink {
    pub referenced: ReferenceKey,
    pub dependent: ReferenceKey,
}

impl RelationLink {
    /// Read `referenced_schema`, `referenced_name`, `dependent_schema`,
    /// `dependent_name` rows from a link query
    pub fn from_result(result: &QueryResult) -> Result<Vec<Self>> {
        let mut links = Vec::with_capacity(result.rows.len());
        for row in 0..result.rows.len() {
            links.push(Self {
                referenced: ReferenceKey::new(
                    required(result, row, "referenced_schema")?,
                    required(result, row, "referenced_name")?,
                ),
                dependent: ReferenceKey::new(
                    required(result, row, "dependent_schema")?,
                    required(result, row, "dependent_name")?,
                ),
            });
        }
        Ok(links)
    }
}

fn required<'a>(result: &'a QueryResult, row: usize, column: &str) -> Result<&'a str> {
    result.get(row, column).ok_or_else(|| {
        RelcacheError::database(format!(
            "catalog query returned no \"{}\" value in row {}",
            column, row
        ))
    })
}

/// Escape a value for use inside a single-quoted SQL literal
pub(crate) fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A warehouse connection primitive.
///
/// Calls block the current thread. Implementations translate their own
/// failures into [`RelcacheError::Database`] or
/// [`RelcacheError::FailedToConnect`].
pub trait ConnectionDriver: Send + Sync + 'static {
    /// An open session
    type Handle: Send + 'static;
    /// What another session needs to cancel this one
    type CancelKey: Clone + fmt::Debug + Send + Sync + 'static;

    fn backend(&self) -> DatabaseBackend;

    fn type_name(&self) -> &'static str {
        self.backend().type_name()
    }

    /// Open a new session
    fn open(&self, credentials: &Credentials) -> Result<Self::Handle>;

    /// Run one statement; when `fetch` is set the rows are returned
    fn execute(&self, handle: &mut Self::Handle, sql: &str, fetch: bool) -> Result<QueryResult>;

    fn begin(&self, handle: &mut Self::Handle) -> Result<()> {
        self.execute(handle, "BEGIN", false).map(|_| ())
    }

    fn commit(&self, handle: &mut Self::Handle) -> Result<()> {
        self.execute(handle, "COMMIT", false).map(|_| ())
    }

    fn rollback(&self, handle: &mut Self::Handle) -> Result<()> {
        self.execute(handle, "ROLLBACK", false).map(|_| ())
    }

    /// Whether handles have an explicit close; when false they are dropped
    fn supports_close(&self) -> bool {
        true
    }

    fn close(&self, handle: Self::Handle) -> Result<()> {
        drop(handle);
        Ok(())
    }

    /// Key used by [`cancel`](Self::cancel), if this backend can cancel
    fn cancel_key(&self, _handle: &mut Self::Handle) -> Result<Option<Self::CancelKey>> {
        Ok(None)
    }

    /// Cancel the session identified by `key` from a fresh session
    fn cancel(&self, _credentials: &Credentials, key: &Self::CancelKey) -> Result<()> {
        Err(RelcacheError::not_supported(format!(
            "{} cannot cancel {:?}",
            self.backend(),
            key
        )))
    }

    /// Query returning `schema`, `name`, `type` for every relation in `schema`
    fn list_relations_sql(&self, schema: &str) -> String;

    /// Query returning every dependency edge, if the backend records them
    fn relation_links_sql(&self) -> Option<String> {
        None
    }

    /// Object type named in DDL for `kind`
    fn ddl_kind(&self, kind: RelationKind) -> Result<&'static str> {
        match kind {
            RelationKind::Cte | RelationKind::External => Err(RelcacheError::not_supported(
                format!("{} relations cannot be dropped on {}", kind, self.type_name()),
            )),
            other => Ok(other.as_str()),
        }
    }

    fn drop_relation_sql(&self, relation: &BaseRelation) -> Result<String> {
        let kind = self.ddl_kind(relation.kind.unwrap_or(RelationKind::Table))?;
        let cascade = if self.backend().supports_cascade() {
            " cascade"
        } else {
            ""
        };
        Ok(format!(
            "drop {} if exists {}{}",
            kind,
            relation.render()?,
            cascade
        ))
    }

    fn rename_relation_sql(&self, from: &BaseRelation, to: &BaseRelation) -> Result<String> {
        let identifier = to.identifier.as_deref().ok_or_else(|| {
            RelcacheError::runtime(format!("Cannot rename {} to a relation without identifier", from))
        })?;
        Ok(format!(
            "alter table {} rename to {}",
            from.render()?,
            to.quoted(identifier)
        ))
    }

    /// DDL creating `schema`; `None` when the schema always exists
    fn create_schema_sql(&self, schema: &str) -> Result<Option<String>> {
        Ok(Some(format!(
            "create schema if not exists {}",
            quote_identifier(schema, '"')
        )))
    }

    /// DDL dropping `schema` and its contents
    fn drop_schema_sql(&self, schema: &str) -> Result<Option<String>> {
        let cascade = if self.backend().supports_cascade() {
            " cascade"
        } else {
            ""
        };
        Ok(Some(format!(
            "drop schema if exists {}{}",
            quote_identifier(schema, '"'),
            cascade
        )))
    }
}
