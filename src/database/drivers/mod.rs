//! sqlx-backed warehouse drivers
//!
//! Each driver owns a small tokio runtime and blocks on it, so worker
//! threads can use them through the synchronous `ConnectionDriver` trait.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

use crate::database::driver::QueryResult;
use crate::error::{RelcacheError, Result};
use sqlx::{Column, Row};
use tokio::runtime::Runtime;

/// Runtime the driver's futures are driven on
pub(crate) fn driver_runtime(name: &str) -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(format!("relcache-{}", name))
        .enable_all()
        .build()?)
}

/// Translate a statement failure into the crate's database error
pub(crate) fn database_error(err: sqlx::Error) -> RelcacheError {
    RelcacheError::from(err).into_database_error()
}

/// Render fetched rows as text cells
pub(crate) fn rows_to_result<R>(rows: &[R]) -> Result<QueryResult>
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    for<'r> Option<String>: sqlx::Decode<'r, R::Database>,
{
    let columns = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect()
        })
        .unwrap_or_default();

    let mut cells = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(row.len());
        for index in 0..row.len() {
            let value: Option<String> = row.try_get_unchecked(index).map_err(database_error)?;
            values.push(value);
        }
        cells.push(values);
    }

    Ok(QueryResult::fetched(columns, cells))
}
