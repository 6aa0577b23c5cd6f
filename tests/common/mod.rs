//! Shared test fixtures: an in-memory warehouse driver that records what it
//! was asked to do and can be told to fail.

#![allow(dead_code)]

use parking_lot::Mutex;
use relcache::config::{Credentials, Profile};
use relcache::database::{ConnectionDriver, DatabaseBackend, QueryResult};
use relcache::error::{RelcacheError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

pub const LINKS_SQL: &str = "list links";

/// Driver operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Begin,
    Commit,
    Rollback,
    Execute,
    Close,
    Cancel,
}

/// Holds one driver call in place until the test lets it go
pub struct Gate {
    entered: Barrier,
    release: Barrier,
}

impl Gate {
    fn new() -> Self {
        Self {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }

    /// Wait until the parked call is inside the driver
    pub fn wait_entered(&self) {
        self.entered.wait();
    }

    /// Let the parked call return
    pub fn release(&self) {
        self.release.wait();
    }

    fn park(&self) {
        self.entered.wait();
        self.release.wait();
    }
}

#[derive(Default)]
pub struct MockDriver {
    pub opens: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub closes: AtomicUsize,
    failures: Mutex<HashSet<Operation>>,
    gates: Mutex<HashMap<Operation, Arc<Gate>>>,
    statements: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<u64>>,
    /// `(schema, name, type)` rows returned by relation listings
    catalog: Mutex<Vec<(String, String, String)>>,
    /// `(referenced_schema, referenced_name, dependent_schema, dependent_name)`
    links: Mutex<Vec<(String, String, String, String)>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, operation: Operation) {
        self.failures.lock().insert(operation);
    }

    pub fn succeed(&self, operation: Operation) {
        self.failures.lock().remove(&operation);
    }

    /// Park the next call of `operation` until the returned gate is released
    pub fn park_next(&self, operation: Operation) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.gates.lock().insert(operation, gate.clone());
        gate
    }

    fn pass_gate(&self, operation: Operation) {
        let gate = self.gates.lock().remove(&operation);
        if let Some(gate) = gate {
            gate.park();
        }
    }

    fn check(&self, operation: Operation) -> Result<()> {
        if self.failures.lock().contains(&operation) {
            return Err(match operation {
                Operation::Open => RelcacheError::failed_to_connect("connection refused"),
                other => RelcacheError::database(format!("{:?} failed", other)),
            });
        }
        Ok(())
    }

    pub fn count(&self, counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<u64> {
        let mut cancelled = self.cancelled.lock().clone();
        cancelled.sort();
        cancelled
    }

    pub fn add_catalog_relation(&self, schema: &str, name: &str, kind: &str) {
        self.catalog
            .lock()
            .push((schema.to_string(), name.to_string(), kind.to_string()));
    }

    pub fn add_catalog_link(
        &self,
        referenced_schema: &str,
        referenced_name: &str,
        dependent_schema: &str,
        dependent_name: &str,
    ) {
        self.links.lock().push((
            referenced_schema.to_string(),
            referenced_name.to_string(),
            dependent_schema.to_string(),
            dependent_name.to_string(),
        ));
    }

    fn listing(&self, schema: &str) -> QueryResult {
        let rows = self
            .catalog
            .lock()
            .iter()
            .filter(|(s, _, _)| s.eq_ignore_ascii_case(schema))
            .map(|(s, n, t)| vec![Some(s.clone()), Some(n.clone()), Some(t.clone())])
            .collect();
        QueryResult::fetched(
            vec!["schema".into(), "name".into(), "type".into()],
            rows,
        )
    }

    fn link_rows(&self) -> QueryResult {
        let rows = self
            .links
            .lock()
            .iter()
            .map(|(rs, rn, ds, dn)| {
                vec![
                    Some(rs.clone()),
                    Some(rn.clone()),
                    Some(ds.clone()),
                    Some(dn.clone()),
                ]
            })
            .collect();
        QueryResult::fetched(
            vec![
                "referenced_schema".into(),
                "referenced_name".into(),
                "dependent_schema".into(),
                "dependent_name".into(),
            ],
            rows,
        )
    }
}

impl ConnectionDriver for MockDriver {
    type Handle = u64;
    type CancelKey = u64;

    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
    }

    fn open(&self, _credentials: &Credentials) -> Result<u64> {
        self.pass_gate(Operation::Open);
        self.check(Operation::Open)?;
        Ok(self.opens.fetch_add(1, Ordering::SeqCst) as u64 + 1)
    }

    fn execute(&self, _handle: &mut u64, sql: &str, _fetch: bool) -> Result<QueryResult> {
        self.pass_gate(Operation::Execute);
        self.statements.lock().push(sql.to_string());
        self.check(Operation::Execute)?;
        if let Some(schema) = sql.strip_prefix("list relations in ") {
            return Ok(self.listing(schema));
        }
        if sql == LINKS_SQL {
            return Ok(self.link_rows());
        }
        Ok(QueryResult::affected(sql, 0))
    }

    fn begin(&self, _handle: &mut u64) -> Result<()> {
        self.statements.lock().push("BEGIN".to_string());
        self.check(Operation::Begin)?;
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self, _handle: &mut u64) -> Result<()> {
        self.statements.lock().push("COMMIT".to_string());
        self.check(Operation::Commit)?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self, _handle: &mut u64) -> Result<()> {
        self.statements.lock().push("ROLLBACK".to_string());
        self.check(Operation::Rollback)?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, _handle: u64) -> Result<()> {
        self.check(Operation::Close)?;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel_key(&self, handle: &mut u64) -> Result<Option<u64>> {
        Ok(Some(*handle))
    }

    fn cancel(&self, _credentials: &Credentials, key: &u64) -> Result<()> {
        self.check(Operation::Cancel)?;
        self.cancelled.lock().push(*key);
        Ok(())
    }

    fn list_relations_sql(&self, schema: &str) -> String {
        format!("list relations in {}", schema)
    }

    fn relation_links_sql(&self) -> Option<String> {
        Some(LINKS_SQL.to_string())
    }
}

/// A profile pointing at the mock warehouse
pub fn profile(threads: usize) -> Profile {
    Profile::new(
        "test",
        "dev",
        threads,
        Credentials::postgres("localhost", "dbt", "analytics", "staging"),
    )
}
