//! Database connection abstraction
//!
//! This module provides the backend enum, the connection lifecycle states and
//! the `Connection` value the connection manager hands out per thread.

use crate::config::Credentials;
use crate::error::{RelcacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Supported database backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    /// PostgreSQL
    Postgres,
    /// SQLite
    Sqlite,
}

impl DatabaseBackend {
    /// Get the default port for this database
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseBackend::Postgres => 5432,
            DatabaseBackend::Sqlite => 0, // No port for file-based DB
        }
    }

    /// Short type tag stored on connections and used in logs
    pub fn type_name(&self) -> &'static str {
        match self {
            DatabaseBackend::Postgres => "postgres",
            DatabaseBackend::Sqlite => "sqlite",
        }
    }

    /// Get the name of this database backend
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseBackend::Postgres => "PostgreSQL",
            DatabaseBackend::Sqlite => "SQLite",
        }
    }

    /// Get the default schema name for this backend
    pub fn default_schema(&self) -> &'static str {
        match self {
            DatabaseBackend::Postgres => "public",
            DatabaseBackend::Sqlite => "main",
        }
    }

    /// Whether `DROP ... CASCADE` is understood
    pub fn supports_cascade(&self) -> bool {
        matches!(self, DatabaseBackend::Postgres)
    }
}

impl FromStr for DatabaseBackend {
    type Err = RelcacheError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(DatabaseBackend::Postgres),
            "sqlite" | "sqlite3" => Ok(DatabaseBackend::Sqlite),
            _ => Err(RelcacheError::UnsupportedDatabaseType(s.to_string())),
        }
    }
}

impl fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lifecycle of a connection: `Init -> Open -> Closed`, or `-> Fail` when
/// opening throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, no usable handle
    Init,
    /// Handle attached and usable
    Open,
    /// Handle released
    Closed,
    /// The open attempt failed
    Fail,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Init => "init",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Fail => "fail",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One warehouse session.
///
/// `transaction_open` is only ever true while the state is `Open`, and only
/// an `Open` connection carries a handle.
pub struct Connection<H> {
    type_name: &'static str,
    pub(crate) name: Option<String>,
    pub(crate) state: ConnectionState,
    pub(crate) transaction_open: bool,
    pub(crate) handle: Option<H>,
    pub(crate) opened_at: Option<DateTime<Utc>>,
    credentials: Arc<Credentials>,
}

impl<H> Connection<H> {
    /// A fresh, unnamed connection in the `Init` state
    pub fn new(type_name: &'static str, credentials: Arc<Credentials>) -> Self {
        Self {
            type_name,
            name: None,
            state: ConnectionState::Init,
            transaction_open: false,
            handle: None,
            opened_at: None,
            credentials,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for log lines; unnamed connections show as `<unnamed>`
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn transaction_open(&self) -> bool {
        self.transaction_open
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    /// The driver handle, or a runtime error when the connection is not open
    pub fn handle_mut(&mut self) -> Result<&mut H> {
        if self.state != ConnectionState::Open {
            return Err(RelcacheError::runtime(format!(
                "Connection \"{}\" is not open (state: {})",
                self.display_name(),
                self.state
            )));
        }
        let name = self.display_name().to_string();
        self.handle
            .as_mut()
            .ok_or_else(|| RelcacheError::runtime(format!("Connection \"{}\" has no handle", name)))
    }

    /// Attach a freshly opened handle
    pub(crate) fn attach(&mut self, handle: H) {
        self.handle = Some(handle);
        self.state = ConnectionState::Open;
        self.transaction_open = false;
        self.opened_at = Some(Utc::now());
    }

    /// Record a failed open
    pub(crate) fn mark_failed(&mut self) {
        self.handle = None;
        self.state = ConnectionState::Fail;
        self.transaction_open = false;
    }
}

impl<H> fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("type", &self.type_name)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("transaction_open", &self.transaction_open)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}
