//! Configuration module
//!
//! This module holds the warehouse credentials and the resolved profile a
//! build runs with. Loading profiles from disk lives in [`storage`].

pub mod storage;

use crate::database::connection::DatabaseBackend;
use crate::error::{RelcacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use storage::{ProfileEntry, ProfilesFile, TargetConfig};

/// Default connect timeout, in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connections kept beyond one per worker thread: one for hooks and
/// other work outside the build graph, one spare.
const OVERHEAD_CONNECTIONS: usize = 2;

/// Warehouse credentials for one target
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Backend type
    #[serde(rename = "type")]
    pub backend: DatabaseBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Name of an environment variable holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// Database name, or the file path for SQLite (`:memory:` for in-memory)
    pub database: String,
    /// Schema models are built into
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalives_idle: Option<u64>,
}

impl Credentials {
    /// Credentials for a local Postgres database
    pub fn postgres(
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            backend: DatabaseBackend::Postgres,
            host: Some(host.into()),
            port: Some(DatabaseBackend::Postgres.default_port()),
            user: Some(user.into()),
            password: None,
            password_env: None,
            database: database.into(),
            schema: schema.into(),
            search_path: None,
            connect_timeout_secs: None,
            keepalives_idle: None,
        }
    }

    /// Credentials for a SQLite database file
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            host: None,
            port: None,
            user: None,
            password: None,
            password_env: None,
            database: path.into(),
            schema: DatabaseBackend::Sqlite.default_schema().to_string(),
            search_path: None,
            connect_timeout_secs: None,
            keepalives_idle: None,
        }
    }

    /// Credentials for a private in-memory SQLite database
    pub fn sqlite_memory() -> Self {
        Self::sqlite(":memory:")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    /// The password, reading `password_env` when no literal password is set
    pub fn resolved_password(&self) -> Result<Option<String>> {
        if let Some(password) = &self.password {
            return Ok(Some(password.clone()));
        }
        match &self.password_env {
            Some(var) => std::env::var(var).map(Some).map_err(|_| {
                RelcacheError::Config(format!(
                    "Environment variable {} (password_env) is not set",
                    var
                ))
            }),
            None => Ok(None),
        }
    }

    /// Printable key/value pairs for diagnostics; never includes secrets
    pub fn connection_info(&self) -> Vec<(&'static str, String)> {
        let mut info = vec![("type", self.backend.type_name().to_string())];
        if let Some(host) = &self.host {
            info.push(("host", host.clone()));
        }
        if let Some(port) = self.port {
            info.push(("port", port.to_string()));
        }
        if let Some(user) = &self.user {
            info.push(("user", user.clone()));
        }
        info.push(("database", self.database.clone()));
        info.push(("schema", self.schema.clone()));
        if let Some(search_path) = &self.search_path {
            info.push(("search_path", search_path.clone()));
        }
        info
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("type", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("search_path", &self.search_path)
            .finish()
    }
}

/// A resolved profile: which target to build against, with how many threads
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub target: String,
    pub threads: usize,
    pub credentials: Credentials,
}

impl Profile {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        threads: usize,
        credentials: Credentials,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            threads,
            credentials,
        }
    }

    /// Upper bound on concurrently registered connections
    pub fn max_connections(&self) -> usize {
        self.threads + OVERHEAD_CONNECTIONS
    }
}
