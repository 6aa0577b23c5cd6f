//! Connection Manager
//!
//! This module implements the per-thread connection registry. Every worker
//! thread owns at most one [`Connection`], keyed by process and thread id.
//!
//! The registry lock only guards the map itself. Opening, executing and
//! closing happen under the connection's own lock, so a slow round trip on one
//! thread never blocks another thread from registering its connection.

use crate::config::{Credentials, Profile};
use crate::database::connection::{Connection, ConnectionState};
use crate::database::driver::{ConnectionDriver, QueryResult};
use crate::error::{RelcacheError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Name given to a connection acquired without one
pub const DEFAULT_CONNECTION_NAME: &str = "master";

/// Identity of one concurrent execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub process_id: u32,
    pub thread_id: ThreadId,
}

impl ThreadKey {
    pub fn new(process_id: u32, thread_id: ThreadId) -> Self {
        Self {
            process_id,
            thread_id,
        }
    }

    /// Key of the calling thread in this process
    pub fn current() -> Self {
        Self::new(std::process::id(), std::thread::current().id())
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.process_id, self.thread_id)
    }
}

/// What other threads may read without waiting on a busy connection
struct SlotMeta<K> {
    name: Option<String>,
    cancel_key: Option<K>,
}

/// A registered connection
pub struct ThreadConnection<D: ConnectionDriver> {
    conn: Mutex<Connection<D::Handle>>,
    meta: Mutex<SlotMeta<D::CancelKey>>,
}

impl<D: ConnectionDriver> ThreadConnection<D> {
    fn new(conn: Connection<D::Handle>) -> Self {
        Self {
            conn: Mutex::new(conn),
            meta: Mutex::new(SlotMeta {
                name: None,
                cancel_key: None,
            }),
        }
    }

    /// Lock the connection for use by the calling thread
    pub fn lock(&self) -> MutexGuard<'_, Connection<D::Handle>> {
        self.conn.lock()
    }

    /// Current name, readable while the connection is busy
    pub fn name(&self) -> Option<String> {
        self.meta.lock().name.clone()
    }
}

/// Diagnostic snapshot of one registered connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub name: Option<String>,
    pub state: ConnectionState,
    pub transaction_open: bool,
    pub opened_at: Option<DateTime<Utc>>,
}

type ThreadIdentity = Box<dyn Fn() -> ThreadKey + Send + Sync>;

/// Per-thread connection registry
pub struct ConnectionManager<D: ConnectionDriver> {
    driver: Arc<D>,
    credentials: Arc<Credentials>,
    max_connections: usize,
    thread_connections: Mutex<HashMap<ThreadKey, Arc<ThreadConnection<D>>>>,
    thread_identity: ThreadIdentity,
}

impl<D: ConnectionDriver> ConnectionManager<D> {
    /// Creates a manager allowing at most `max_connections` registered threads
    pub fn new(driver: D, credentials: Credentials, max_connections: usize) -> Self {
        Self {
            driver: Arc::new(driver),
            credentials: Arc::new(credentials),
            max_connections,
            thread_connections: Mutex::new(HashMap::new()),
            thread_identity: Box::new(ThreadKey::current),
        }
    }

    /// Creates a manager sized for the profile's thread count
    pub fn from_profile(driver: D, profile: &Profile) -> Self {
        Self::new(driver, profile.credentials.clone(), profile.max_connections())
    }

    /// Replace the function identifying the calling thread
    pub fn with_thread_identity<F>(mut self, identity: F) -> Self
    where
        F: Fn() -> ThreadKey + Send + Sync + 'static,
    {
        self.thread_identity = Box::new(identity);
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.thread_connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn thread_key(&self) -> ThreadKey {
        (self.thread_identity)()
    }

    fn lookup(&self, key: &ThreadKey) -> Option<Arc<ThreadConnection<D>>> {
        self.thread_connections.lock().get(key).cloned()
    }

    fn set_thread_connection(&self, key: ThreadKey, slot: Arc<ThreadConnection<D>>) -> Result<()> {
        let mut connections = self.thread_connections.lock();
        if connections.contains_key(&key) {
            return Err(RelcacheError::internal(format!(
                "In set_thread_connection, existing connection exists for {}",
                key
            )));
        }
        if connections.len() >= self.max_connections {
            return Err(RelcacheError::internal(format!(
                "Cannot open a connection for {}: all {} connections are in use",
                key, self.max_connections
            )));
        }
        connections.insert(key, slot);
        Ok(())
    }

    fn clear_thread_connection(&self, key: &ThreadKey) {
        self.thread_connections.lock().remove(key);
    }

    /// The calling thread's connection
    pub fn get_thread_connection(&self) -> Result<Arc<ThreadConnection<D>>> {
        let key = self.thread_key();
        self.lookup(&key).ok_or_else(|| {
            RelcacheError::runtime(format!(
                "connection never acquired for thread {}",
                key
            ))
        })
    }

    /// The calling thread's connection, if it has one
    pub fn get_if_exists(&self) -> Option<Arc<ThreadConnection<D>>> {
        self.lookup(&self.thread_key())
    }

    /// Acquire or re-use the calling thread's connection under `name`
    /// (`"master"` when `None`), opening it if needed.
    #[instrument(level = "debug", skip(self))]
    pub fn set_connection_name(&self, name: Option<&str>) -> Result<Arc<ThreadConnection<D>>> {
        let conn_name = name.unwrap_or(DEFAULT_CONNECTION_NAME);
        let key = self.thread_key();

        let slot = match self.lookup(&key) {
            Some(slot) => slot,
            None => {
                let slot = Arc::new(ThreadConnection::new(Connection::new(
                    self.driver.type_name(),
                    self.credentials.clone(),
                )));
                self.set_thread_connection(key, slot.clone())?;
                slot
            }
        };

        {
            let mut conn = slot.lock();
            if conn.name() == Some(conn_name) && conn.is_open() {
                return Ok(slot.clone());
            }

            if conn.is_open() {
                debug!(
                    "Re-using an available connection from the pool (formerly {}).",
                    conn.display_name()
                );
            } else {
                debug!(
                    "Opening a new connection, currently in state {}",
                    conn.state()
                );
                self.open_connection(&slot, &mut conn)?;
            }

            conn.name = Some(conn_name.to_string());
        }
        slot.meta.lock().name = Some(conn_name.to_string());

        Ok(slot)
    }

    fn open_connection(
        &self,
        slot: &ThreadConnection<D>,
        conn: &mut Connection<D::Handle>,
    ) -> Result<()> {
        match self.driver.open(&self.credentials) {
            Ok(mut handle) => {
                let cancel_key = self.driver.cancel_key(&mut handle).unwrap_or_else(|e| {
                    debug!("Could not read a cancel key: {}", e);
                    None
                });
                conn.attach(handle);
                slot.meta.lock().cancel_key = cancel_key;
                Ok(())
            }
            Err(e) => {
                debug!(
                    "Got an error when attempting to open a {} connection: '{}'",
                    self.driver.type_name(),
                    e
                );
                conn.mark_failed();
                Err(e)
            }
        }
    }

    /// Give back the calling thread's connection: roll back an open
    /// transaction, or close it if it is not open.
    ///
    /// When that cleanup fails the thread's entry is removed before the error
    /// is returned, so the next acquire on this thread starts fresh.
    #[instrument(level = "debug", skip(self))]
    pub fn release(&self) -> Result<()> {
        let key = self.thread_key();
        let Some(slot) = self.lookup(&key) else {
            return Ok(());
        };

        let outcome = {
            let mut conn = slot.lock();
            if conn.is_open() {
                if conn.transaction_open() {
                    self.rollback(&mut conn)
                } else {
                    Ok(())
                }
            } else {
                Self::close(&self.driver, &mut conn)
            }
        };

        if let Err(e) = outcome {
            self.clear_thread_connection(&key);
            return Err(e);
        }
        Ok(())
    }

    /// Close every registered connection and empty the registry
    #[instrument(level = "debug", skip(self))]
    pub fn cleanup_all(&self) {
        let slots: Vec<Arc<ThreadConnection<D>>> = {
            let mut connections = self.thread_connections.lock();
            connections.drain().map(|(_, slot)| slot).collect()
        };

        for slot in slots {
            let mut conn = slot.lock();
            if conn.state() != ConnectionState::Closed {
                debug!("Connection '{}' was left open.", conn.display_name());
            } else {
                debug!("Connection '{}' was properly closed.", conn.display_name());
            }
            if let Err(e) = Self::close(&self.driver, &mut conn) {
                warn!("Error closing connection '{}': {}", conn.display_name(), e);
            }
        }
    }

    /// Begin a transaction on the calling thread's connection
    pub fn begin(&self) -> Result<()> {
        let slot = self.get_thread_connection()?;
        let mut conn = slot.lock();
        self.begin_on(&mut conn)
    }

    /// Commit the calling thread's open transaction
    pub fn commit(&self) -> Result<()> {
        let slot = self.get_thread_connection()?;
        let mut conn = slot.lock();
        self.commit_on(&mut conn)
    }

    /// Commit only when the calling thread has an open transaction
    pub fn commit_if_has_connection(&self) -> Result<()> {
        if let Some(slot) = self.get_if_exists() {
            let mut conn = slot.lock();
            if conn.transaction_open() {
                self.commit_on(&mut conn)?;
            }
        }
        Ok(())
    }

    /// Roll back any dangling transaction, then run an empty one
    #[instrument(level = "debug", skip(self))]
    pub fn clear_transaction(&self) -> Result<()> {
        if let Some(slot) = self.get_if_exists() {
            let mut conn = slot.lock();
            if conn.transaction_open() {
                self.rollback(&mut conn)?;
            }
        }
        self.begin()?;
        self.commit()
    }

    fn begin_on(&self, conn: &mut Connection<D::Handle>) -> Result<()> {
        if conn.transaction_open() {
            return Err(RelcacheError::internal(format!(
                "Tried to begin a new transaction on connection \"{}\", but it already had one open!",
                conn.display_name()
            )));
        }
        debug!("On {}: BEGIN", conn.display_name());
        self.driver.begin(conn.handle_mut()?)?;
        conn.transaction_open = true;
        Ok(())
    }

    fn commit_on(&self, conn: &mut Connection<D::Handle>) -> Result<()> {
        if !conn.transaction_open() {
            return Err(RelcacheError::internal(format!(
                "Tried to commit transaction on connection \"{}\", but it does not have one open!",
                conn.display_name()
            )));
        }
        debug!("On {}: COMMIT", conn.display_name());
        self.driver.commit(conn.handle_mut()?)?;
        conn.transaction_open = false;
        Ok(())
    }

    fn rollback(&self, conn: &mut Connection<D::Handle>) -> Result<()> {
        if !conn.transaction_open() {
            return Err(RelcacheError::internal(format!(
                "Tried to rollback transaction on connection \"{}\", but it does not have one open!",
                conn.display_name()
            )));
        }
        debug!("On {}: ROLLBACK", conn.display_name());
        let outcome = self.driver.rollback(conn.handle_mut()?);
        conn.transaction_open = false;
        outcome
    }

    /// Close `connection`, rolling back any open transaction first.
    ///
    /// Connections that are not open are left alone. The connection ends up
    /// `Closed` even when the rollback or close fails; the first failure is
    /// returned.
    pub fn close(driver: &D, connection: &mut Connection<D::Handle>) -> Result<()> {
        if connection.state() != ConnectionState::Open {
            return Ok(());
        }

        let mut outcome = Ok(());
        if let Some(mut handle) = connection.handle.take() {
            if connection.transaction_open() {
                debug!("On {}: ROLLBACK", connection.display_name());
                outcome = driver.rollback(&mut handle);
            }
            if driver.supports_close() {
                let closed = driver.close(handle);
                if outcome.is_ok() {
                    outcome = closed;
                }
            } else {
                debug!(
                    "On {}: {} handles have no close, dropping",
                    connection.display_name(),
                    driver.type_name()
                );
            }
        }

        connection.transaction_open = false;
        connection.state = ConnectionState::Closed;
        outcome
    }

    /// Cancel every other thread's connection; returns the cancelled names
    #[instrument(level = "debug", skip(self))]
    pub fn cancel_open(&self) -> Vec<String> {
        let this = self.thread_key();
        let others: Vec<Arc<ThreadConnection<D>>> = {
            let connections = self.thread_connections.lock();
            connections
                .iter()
                .filter(|(key, _)| **key != this)
                .map(|(_, slot)| slot.clone())
                .collect()
        };

        let mut names = Vec::new();
        for slot in others {
            let (name, cancel_key) = {
                let meta = slot.meta.lock();
                (meta.name.clone(), meta.cancel_key.clone())
            };
            let name = name.unwrap_or_else(|| "<unnamed>".to_string());
            let Some(cancel_key) = cancel_key else {
                debug!("Connection '{}' has nothing to cancel", name);
                continue;
            };
            match self.driver.cancel(&self.credentials, &cancel_key) {
                Ok(()) => {
                    debug!("Cancel query '{}': {:?}", name, cancel_key);
                    names.push(name);
                }
                Err(e) => warn!("Failed to cancel connection '{}': {}", name, e),
            }
        }
        names.sort();
        names
    }

    /// Run `sql` on the calling thread's connection.
    ///
    /// With `auto_begin` a transaction is opened first if none is. On failure
    /// the connection is released and the statement's error returned.
    #[instrument(level = "debug", skip(self, sql))]
    pub fn execute(&self, sql: &str, auto_begin: bool, fetch: bool) -> Result<QueryResult> {
        let slot = self.get_thread_connection()?;
        match self.execute_on(&slot, sql, auto_begin, fetch) {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Err(cleanup) = self.release() {
                    debug!("Failed to release connection: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn execute_on(
        &self,
        slot: &ThreadConnection<D>,
        sql: &str,
        auto_begin: bool,
        fetch: bool,
    ) -> Result<QueryResult> {
        let mut conn = slot.lock();
        if auto_begin && !conn.transaction_open() {
            self.begin_on(&mut conn)?;
        }

        debug!("On {}: {}", conn.display_name(), sql);
        let started = Instant::now();
        let result = self.driver.execute(conn.handle_mut()?, sql, fetch)?;
        debug!(
            "SQL status: {} in {:.2} seconds",
            result.status,
            started.elapsed().as_secs_f64()
        );
        Ok(result)
    }

    /// Snapshot of every registered connection, ordered by name
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let slots: Vec<Arc<ThreadConnection<D>>> =
            self.thread_connections.lock().values().cloned().collect();

        let mut infos: Vec<ConnectionInfo> = slots
            .iter()
            .map(|slot| {
                let conn = slot.lock();
                ConnectionInfo {
                    name: conn.name().map(str::to_string),
                    state: conn.state(),
                    transaction_open: conn.transaction_open(),
                    opened_at: conn.opened_at(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

impl<D: ConnectionDriver> Drop for ConnectionManager<D> {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}
