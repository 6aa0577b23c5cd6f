//! SQL adapter
//!
//! `SqlAdapter` composes the connection manager and the relation cache: it
//! runs DDL through the calling thread's connection and, once the warehouse
//! has accepted it, applies the same change to the cache.
//!
//! Cache keys are lowercased; descriptors keep the caller's casing.

use crate::config::Profile;
use crate::database::cache::RelationsCache;
use crate::database::connection::DatabaseBackend;
use crate::database::driver::{CatalogRelation, ConnectionDriver, QueryResult, RelationLink};
use crate::database::manager::{ConnectionManager, DEFAULT_CONNECTION_NAME};
use crate::database::relation::{BaseRelation, ReferenceKey};
use crate::error::{RelcacheError, Result};
use std::collections::HashSet;
use tracing::{debug, info};

/// Operations an adapter exposes to the layers that drive a build
pub trait RelationAdapter {
    /// Drop a relation (with cascade where supported) and its dependents from the cache
    fn drop_relation(&self, relation: &BaseRelation) -> Result<()>;

    /// Rename `from` to `to` and repoint cached references
    fn rename_relation(&self, from: &BaseRelation, to: &BaseRelation) -> Result<()>;

    fn create_schema(&self, schema: &str) -> Result<()>;

    fn drop_schema(&self, schema: &str) -> Result<()>;

    /// Record a relation the caller just created
    fn cache_new_relation(&self, relation: BaseRelation) -> Result<()>;

    /// Relations in `schema`, from the cache when the schema is cached
    fn list_relations(&self, schema: &str) -> Result<Vec<BaseRelation>>;

    /// Relations in `schema`, always read from the warehouse
    fn list_relations_without_caching(&self, schema: &str) -> Result<Vec<BaseRelation>>;

    /// Run SQL on the calling thread's connection
    fn execute(&self, sql: &str, auto_begin: bool, fetch: bool) -> Result<QueryResult>;
}

/// Adapter over one warehouse driver
pub struct SqlAdapter<D: ConnectionDriver> {
    database: Option<String>,
    connections: ConnectionManager<D>,
    cache: RelationsCache<BaseRelation>,
}

impl<D: ConnectionDriver> SqlAdapter<D> {
    /// Create an adapter for the profile's target
    pub fn new(driver: D, profile: &Profile) -> Self {
        let database = match driver.backend() {
            DatabaseBackend::Postgres => Some(profile.credentials.database.clone()),
            DatabaseBackend::Sqlite => None,
        };
        let cache = match &database {
            Some(database) => RelationsCache::for_database(database.clone()),
            None => RelationsCache::new(),
        };

        Self {
            database,
            connections: ConnectionManager::from_profile(driver, profile),
            cache,
        }
    }

    pub fn connections(&self) -> &ConnectionManager<D> {
        &self.connections
    }

    pub fn cache(&self) -> &RelationsCache<BaseRelation> {
        &self.cache
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// A relation at `schema.identifier` in this adapter's database
    pub fn relation(&self, schema: &str, identifier: &str) -> BaseRelation {
        BaseRelation::create(self.database.as_deref(), schema, identifier)
    }

    /// Run `f` with the calling thread's connection named `name`, releasing
    /// it afterwards.
    pub fn connection_named<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.connections.set_connection_name(Some(name))?;
        let outcome = f();
        let released = self.connections.release();
        let value = outcome?;
        released?;
        Ok(value)
    }

    /// Read the given schemas from the warehouse and load them into the
    /// cache with the dependency edges between them. Returns the number of
    /// relations cached.
    pub fn populate_cache<I, S>(&self, schemas: I, clear: bool) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let schemas: Vec<String> = schemas
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        let wanted: HashSet<String> = schemas.iter().map(|s| s.to_lowercase()).collect();

        let (found, links) = self.connection_named(DEFAULT_CONNECTION_NAME, || {
            let mut found = Vec::new();
            for schema in &schemas {
                found.extend(self.list_relations_without_caching(schema)?);
            }
            let links = match self.connections.driver().relation_links_sql() {
                Some(sql) => RelationLink::from_result(&self.execute(&sql, false, true)?)?,
                None => Vec::new(),
            };
            Ok((found, links))
        })?;

        let count = found.len();
        self.cache.populate(clear, |writer| {
            writer.update_schemas(&schemas);
            for relation in found {
                let key = cache_key(&relation)?;
                writer.add(&key.schema, &key.identifier, relation.kind, Some(relation))?;
            }
            for link in links {
                let referenced = lowercase_key(&link.referenced);
                let dependent = lowercase_key(&link.dependent);
                if !wanted.contains(&referenced.schema)
                    || !writer.contains_relation(&referenced.schema, &referenced.identifier)
                    || !writer.contains_relation(&dependent.schema, &dependent.identifier)
                {
                    continue;
                }
                writer.add_link(
                    &referenced.schema,
                    &referenced.identifier,
                    &dependent.schema,
                    &dependent.identifier,
                )?;
            }
            Ok(())
        })?;

        info!(
            "Cached {} relations in {} schema(s)",
            count,
            schemas.len()
        );
        Ok(count)
    }

    /// Close every connection
    pub fn cleanup_connections(&self) {
        self.connections.cleanup_all();
    }
}

fn lowercase_key(key: &ReferenceKey) -> ReferenceKey {
    ReferenceKey::new(key.schema.to_lowercase(), key.identifier.to_lowercase())
}

fn cache_key(relation: &BaseRelation) -> Result<ReferenceKey> {
    relation.key().map(|key| lowercase_key(&key)).ok_or_else(|| {
        RelcacheError::runtime(format!(
            "Relation {} needs a schema and identifier to be cached",
            relation
        ))
    })
}

impl<D: ConnectionDriver> RelationAdapter for SqlAdapter<D> {
    fn drop_relation(&self, relation: &BaseRelation) -> Result<()> {
        if relation.kind.is_none() {
            return Err(RelcacheError::runtime(format!(
                "Tried to drop relation {}, but its type is null.",
                relation
            )));
        }
        let key = cache_key(relation)?;
        let sql = self.connections.driver().drop_relation_sql(relation)?;
        self.execute(&sql, true, false)?;

        let removed = self.cache.drop_relation(&key.schema, &key.identifier);
        debug!("Dropped {} cached relation(s) with {}", removed.len(), key);
        Ok(())
    }

    fn rename_relation(&self, from: &BaseRelation, to: &BaseRelation) -> Result<()> {
        let from_key = cache_key(from)?;
        let to_key = cache_key(to)?;
        let sql = self.connections.driver().rename_relation_sql(from, to)?;
        self.execute(&sql, true, false)?;

        self.cache.rename(
            &from_key.schema,
            &from_key.identifier,
            &to_key.schema,
            &to_key.identifier,
        )
    }

    fn create_schema(&self, schema: &str) -> Result<()> {
        debug!("Creating schema \"{}\"", schema);
        if let Some(sql) = self.connections.driver().create_schema_sql(schema)? {
            self.execute(&sql, true, false)?;
            self.connections.commit_if_has_connection()?;
        }
        self.cache.add_schema(schema);
        Ok(())
    }

    fn drop_schema(&self, schema: &str) -> Result<()> {
        debug!("Dropping schema \"{}\"", schema);
        if let Some(sql) = self.connections.driver().drop_schema_sql(schema)? {
            self.execute(&sql, true, false)?;
            self.connections.commit_if_has_connection()?;
        }
        self.cache.drop_schema(&schema.to_lowercase());
        Ok(())
    }

    fn cache_new_relation(&self, relation: BaseRelation) -> Result<()> {
        let key = cache_key(&relation)?;
        self.cache
            .add(&key.schema, &key.identifier, relation.kind, Some(relation))
    }

    fn list_relations(&self, schema: &str) -> Result<Vec<BaseRelation>> {
        if self.cache.contains(self.database.as_deref(), schema) {
            return Ok(self.cache.get_relations(schema));
        }
        let relations = self.list_relations_without_caching(schema)?;
        debug!(
            "with database={:?}, schema={}, relations={}",
            self.database,
            schema,
            relations.len()
        );
        Ok(relations)
    }

    fn list_relations_without_caching(&self, schema: &str) -> Result<Vec<BaseRelation>> {
        let sql = self.connections.driver().list_relations_sql(schema);
        let result = self.execute(&sql, false, true)?;

        Ok(CatalogRelation::from_result(&result)?
            .into_iter()
            .map(|found| {
                let relation = self.relation(&found.schema, &found.identifier);
                match found.kind {
                    Some(kind) => relation.with_kind(kind),
                    None => relation,
                }
            })
            .collect())
    }

    fn execute(&self, sql: &str, auto_begin: bool, fetch: bool) -> Result<QueryResult> {
        self.connections.execute(sql, auto_begin, fetch)
    }
}
