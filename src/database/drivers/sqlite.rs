//! SQLite driver
//!
//! Every relation lives in an attached database; `main` plays the role of the
//! default schema. In-memory databases are private to one connection.

use crate::config::Credentials;
use crate::database::connection::DatabaseBackend;
use crate::database::driver::{sql_literal, ConnectionDriver, QueryResult};
use crate::database::drivers::{database_error, driver_runtime, rows_to_result};
use crate::database::relation::{quote_identifier, BaseRelation};
use crate::error::{RelcacheError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::ConnectOptions;
use std::str::FromStr;
use tokio::runtime::Runtime;

const MEMORY_DATABASE: &str = ":memory:";

/// SQLite sessions over sqlx
pub struct SqliteDriver {
    runtime: Runtime,
}

impl SqliteDriver {
    pub fn new() -> Result<Self> {
        Ok(Self {
            runtime: driver_runtime("sqlite")?,
        })
    }

    fn connect_options(credentials: &Credentials) -> Result<SqliteConnectOptions> {
        if credentials.database == MEMORY_DATABASE {
            return SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| RelcacheError::failed_to_connect(e.to_string()));
        }
        Ok(SqliteConnectOptions::new()
            .filename(&credentials.database)
            .create_if_missing(true))
    }
}

impl ConnectionDriver for SqliteDriver {
    type Handle = SqliteConnection;
    type CancelKey = ();

    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Sqlite
    }

    fn open(&self, credentials: &Credentials) -> Result<SqliteConnection> {
        let options = Self::connect_options(credentials)?;
        let timeout = credentials.connect_timeout();

        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, options.connect()).await {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(RelcacheError::failed_to_connect(format!(
                    "{}: {}",
                    credentials.database, e
                ))),
                Err(_) => Err(RelcacheError::failed_to_connect(format!(
                    "timed out after {}s opening {}",
                    timeout.as_secs(),
                    credentials.database
                ))),
            }
        })
    }

    fn execute(
        &self,
        handle: &mut SqliteConnection,
        sql: &str,
        fetch: bool,
    ) -> Result<QueryResult> {
        self.runtime.block_on(async {
            if fetch {
                let rows = sqlx::raw_sql(sql)
                    .fetch_all(&mut *handle)
                    .await
                    .map_err(database_error)?;
                rows_to_result(&rows)
            } else {
                let done = sqlx::raw_sql(sql)
                    .execute(&mut *handle)
                    .await
                    .map_err(database_error)?;
                Ok(QueryResult::affected(sql, done.rows_affected()))
            }
        })
    }

    fn close(&self, handle: SqliteConnection) -> Result<()> {
        self.runtime
            .block_on(sqlx::Connection::close(handle))
            .map_err(database_error)
    }

    fn list_relations_sql(&self, schema: &str) -> String {
        format!(
            "select {} as schema, name, type from {}.sqlite_master \
             where type in ('table', 'view') and name not like 'sqlite\\_%' escape '\\' \
             order by name",
            sql_literal(schema),
            quote_identifier(schema, '"')
        )
    }

    fn rename_relation_sql(&self, from: &BaseRelation, to: &BaseRelation) -> Result<String> {
        if from.is_view() {
            return Err(RelcacheError::not_supported(format!(
                "SQLite cannot rename view {}",
                from
            )));
        }
        let identifier = to.identifier.as_deref().ok_or_else(|| {
            RelcacheError::runtime(format!("Cannot rename {} to a relation without identifier", from))
        })?;
        Ok(format!(
            "alter table {} rename to {}",
            from.render()?,
            to.quoted(identifier)
        ))
    }

    fn create_schema_sql(&self, schema: &str) -> Result<Option<String>> {
        if schema.eq_ignore_ascii_case(self.backend().default_schema()) {
            return Ok(None);
        }
        Err(RelcacheError::not_supported(format!(
            "SQLite cannot create schema \"{}\"; attach a database instead",
            schema
        )))
    }

    fn drop_schema_sql(&self, schema: &str) -> Result<Option<String>> {
        Err(RelcacheError::not_supported(format!(
            "SQLite cannot drop schema \"{}\"",
            schema
        )))
    }
}
