//! PostgreSQL driver

use crate::config::Credentials;
use crate::database::connection::DatabaseBackend;
use crate::database::driver::{sql_literal, ConnectionDriver, QueryResult};
use crate::database::drivers::{database_error, driver_runtime, rows_to_result};
use crate::database::relation::RelationKind;
use crate::error::{RelcacheError, Result};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::ConnectOptions;
use tokio::runtime::Runtime;
use tracing::debug;

/// Dependency edges between relations, read from view rewrite rules
const RELATION_LINKS_SQL: &str = r#"
    select distinct
        referenced_ns.nspname as referenced_schema,
        referenced_class.relname as referenced_name,
        dependent_ns.nspname as dependent_schema,
        dependent_class.relname as dependent_name
    from pg_rewrite
    join pg_depend
        on pg_depend.classid = 'pg_rewrite'::regclass
        and pg_depend.objid = pg_rewrite.oid
        and pg_depend.refclassid = 'pg_class'::regclass
    join pg_class as dependent_class on dependent_class.oid = pg_rewrite.ev_class
    join pg_class as referenced_class on referenced_class.oid = pg_depend.refobjid
    join pg_namespace as dependent_ns on dependent_ns.oid = dependent_class.relnamespace
    join pg_namespace as referenced_ns on referenced_ns.oid = referenced_class.relnamespace
    where referenced_class.oid <> dependent_class.oid
        and referenced_class.relkind in ('r', 'p', 'v', 'm', 'f')
        and dependent_ns.nspname <> 'information_schema'
        and dependent_ns.nspname not like 'pg\_%'
    order by 1, 2, 3, 4
"#;

/// PostgreSQL sessions over sqlx
pub struct PostgresDriver {
    runtime: Runtime,
}

impl PostgresDriver {
    pub fn new() -> Result<Self> {
        Ok(Self {
            runtime: driver_runtime("postgres")?,
        })
    }

    fn connect_options(credentials: &Credentials) -> Result<PgConnectOptions> {
        let mut options = PgConnectOptions::new()
            .host(credentials.host.as_deref().unwrap_or("localhost"))
            .port(
                credentials
                    .port
                    .unwrap_or(DatabaseBackend::Postgres.default_port()),
            )
            .database(&credentials.database)
            .application_name("relcache");

        if let Some(user) = &credentials.user {
            options = options.username(user);
        }
        if let Some(password) = credentials.resolved_password()? {
            options = options.password(&password);
        }
        if let Some(search_path) = &credentials.search_path {
            options = options.options([("search_path", search_path.as_str())]);
        }
        if let Some(idle) = credentials.keepalives_idle {
            debug!("keepalives_idle={} is left to the operating system", idle);
        }

        Ok(options)
    }
}

impl ConnectionDriver for PostgresDriver {
    type Handle = PgConnection;
    type CancelKey = i32;

    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
    }

    fn open(&self, credentials: &Credentials) -> Result<PgConnection> {
        let options = Self::connect_options(credentials)?;
        let timeout = credentials.connect_timeout();

        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, options.connect()).await {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(RelcacheError::failed_to_connect(e.to_string())),
                Err(_) => Err(RelcacheError::failed_to_connect(format!(
                    "timed out after {}s connecting to {}",
                    timeout.as_secs(),
                    credentials.database
                ))),
            }
        })
    }

    fn execute(&self, handle: &mut PgConnection, sql: &str, fetch: bool) -> Result<QueryResult> {
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

    fn close(&self, handle: PgConnection) -> Result<()> {
        self.runtime
            .block_on(sqlx::Connection::close(handle))
            .map_err(database_error)
    }

    fn cancel_key(&self, handle: &mut PgConnection) -> Result<Option<i32>> {
        let pid: i32 = self.runtime.block_on(async {
            sqlx::query_scalar("select pg_backend_pid()")
                .fetch_one(&mut *handle)
                .await
                .map_err(database_error)
        })?;
        Ok(Some(pid))
    }

    fn cancel(&self, credentials: &Credentials, key: &i32) -> Result<()> {
        let mut conn = self.open(credentials)?;
        let outcome = self.runtime.block_on(async {
            sqlx::query("select pg_terminate_backend($1)")
                .bind(*key)
                .execute(&mut conn)
                .await
                .map_err(database_error)
        });
        if let Err(e) = self.close(conn) {
            debug!("Error closing cancel connection: {}", e);
        }
        outcome.map(|_| ())
    }

    fn list_relations_sql(&self, schema: &str) -> String {
        let schema = sql_literal(schema);
        format!(
            r#"
    select table_schema as schema, table_name as name, table_type as type
    from information_schema.tables
    where table_schema ilike {schema}
    union all
    select schemaname as schema, matviewname as name, 'materialized view' as type
    from pg_matviews
    where schemaname ilike {schema}
"#
        )
    }

    fn relation_links_sql(&self) -> Option<String> {
        Some(RELATION_LINKS_SQL.to_string())
    }

    fn ddl_kind(&self, kind: RelationKind) -> Result<&'static str> {
        match kind {
            RelationKind::External => Ok("foreign table"),
            RelationKind::Cte => Err(RelcacheError::not_supported("a cte cannot be dropped")),
            other => Ok(other.as_str()),
        }
    }
}
