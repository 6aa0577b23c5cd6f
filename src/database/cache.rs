//! Relations Cache
//!
//! In-memory mirror of the relations that exist in the warehouse, with the
//! dependency edges between them. Drops and renames are applied the way the
//! warehouse applies `DROP ... CASCADE` and `ALTER ... RENAME`, so the cache
//! can be updated optimistically after each DDL statement instead of being
//! re-read from the catalog.
//!
//! All state sits behind one lock. The graph algorithms are plain functions on
//! the guarded state, so batch fills ([`RelationsCache::populate`]) can
//! reuse them without re-entering the lock.

use crate::database::relation::{BaseRelation, ReferenceKey, RelationDescriptor, RelationKind};
use crate::error::{RelcacheError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, Level};

/// One relation believed to exist in the warehouse.
///
/// `referenced_by` holds the keys of the relations that depend on this one:
/// dropping this relation with `CASCADE` drops them too.
#[derive(Debug, Clone)]
pub struct CachedRelation<R> {
    schema: String,
    identifier: String,
    kind: Option<RelationKind>,
    referenced_by: HashSet<ReferenceKey>,
    inner: Option<R>,
}

impl<R: RelationDescriptor> CachedRelation<R> {
    pub fn new(
        schema: impl Into<String>,
        identifier: impl Into<String>,
        kind: Option<RelationKind>,
        inner: Option<R>,
    ) -> Self {
        Self {
            schema: schema.into(),
            identifier: identifier.into(),
            kind,
            referenced_by: HashSet::new(),
            inner,
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn kind(&self) -> Option<RelationKind> {
        self.kind
    }

    /// The descriptor stored for this relation, absent for placeholders
    pub fn inner(&self) -> Option<&R> {
        self.inner.as_ref()
    }

    pub fn key(&self) -> ReferenceKey {
        ReferenceKey::new(&self.schema, &self.identifier)
    }

    /// Keys of the relations that depend on this one
    pub fn referenced_by(&self) -> impl Iterator<Item = &ReferenceKey> {
        self.referenced_by.iter()
    }

    pub fn is_referenced_by(&self, key: &ReferenceKey) -> bool {
        self.referenced_by.contains(key)
    }

    fn add_reference(&mut self, referrer: ReferenceKey) {
        self.referenced_by.insert(referrer);
    }

    /// Forget references to any of `keys`. Not recursive.
    fn release_references(&mut self, keys: &HashSet<ReferenceKey>) {
        self.referenced_by.retain(|key| !keys.contains(key));
    }

    /// Merge what another `add` observed about this relation.
    fn merge(&mut self, kind: Option<RelationKind>, inner: Option<R>) -> Result<()> {
        match (self.kind, kind) {
            (Some(existing), Some(new)) if existing != new => {
                return Err(RelcacheError::cache_inconsistent(format!(
                    "relation {} was cached as a {} but was added again as a {}",
                    self.key(),
                    existing,
                    new
                )));
            }
            (None, Some(new)) => self.kind = Some(new),
            _ => {}
        }

        if self.inner.is_none() {
            self.inner = inner;
        }
        Ok(())
    }

    /// Move this node to a new name. Every referrer must be repointed
    /// separately with [`CachedRelation::rename_key`].
    fn rename(&mut self, new_key: &ReferenceKey) {
        self.schema = new_key.schema.clone();
        self.identifier = new_key.identifier.clone();
        if let Some(inner) = &self.inner {
            self.inner = Some(inner.with_path(&new_key.schema, &new_key.identifier));
        }
    }

    /// Repoint a reference that may or may not exist.
    fn rename_key(&mut self, old_key: &ReferenceKey, new_key: &ReferenceKey) -> Result<()> {
        if self.referenced_by.contains(new_key) {
            return Err(RelcacheError::cache_inconsistent(format!(
                "in rename of \"{}\" -> \"{}\", new name is in the cache already",
                old_key, new_key
            )));
        }
        if self.referenced_by.remove(old_key) {
            self.referenced_by.insert(new_key.clone());
        }
        Ok(())
    }

    /// Dot-separated keys of all referrers, sorted
    pub fn dump_graph_entry(&self) -> Vec<String> {
        let mut entry: Vec<String> = self.referenced_by.iter().map(|k| k.to_string()).collect();
        entry.sort();
        entry
    }
}

impl<R> fmt::Display for CachedRelation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CachedRelation(schema={}, identifier={}, kind={})",
            self.schema,
            self.identifier,
            self.kind.map(|k| k.as_str()).unwrap_or("unknown")
        )
    }
}

/// The guarded contents of a [`RelationsCache`].
#[derive(Debug, Clone)]
struct CacheState<R> {
    relations: HashMap<ReferenceKey, CachedRelation<R>>,
    /// Lowercased schema names
    schemas: HashSet<String>,
}

impl<R> Default for CacheState<R> {
    fn default() -> Self {
        Self {
            relations: HashMap::new(),
            schemas: HashSet::new(),
        }
    }
}

impl<R: RelationDescriptor> CacheState<R> {
    fn clear(&mut self) {
        self.relations.clear();
        self.schemas.clear();
    }

    fn add(
        &mut self,
        schema: &str,
        identifier: &str,
        kind: Option<RelationKind>,
        inner: Option<R>,
    ) -> Result<()> {
        self.schemas.insert(schema.to_lowercase());
        let key = ReferenceKey::new(schema, identifier);
        match self.relations.get_mut(&key) {
            Some(existing) => existing.merge(kind, inner),
            None => {
                self.relations
                    .insert(key, CachedRelation::new(schema, identifier, kind, inner));
                Ok(())
            }
        }
    }

    fn add_link(&mut self, referenced: &ReferenceKey, dependent: &ReferenceKey) -> Result<()> {
        if !self.relations.contains_key(dependent) {
            return Err(RelcacheError::cache_inconsistent(format!(
                "in add_link, dependent link key {} not in cache!",
                dependent
            )));
        }
        let referenced_node = self.relations.get_mut(referenced).ok_or_else(|| {
            RelcacheError::cache_inconsistent(format!(
                "in add_link, referenced link key {} not in cache!",
                referenced
            ))
        })?;
        referenced_node.add_reference(dependent.clone());
        Ok(())
    }

    /// Everything a `DROP ... CASCADE` of `root` would take with it,
    /// `root` included. Cycles are tolerated.
    fn collect_consequences(&self, root: &ReferenceKey) -> HashSet<ReferenceKey> {
        let mut consequences = HashSet::new();
        let mut pending = vec![root.clone()];

        while let Some(key) = pending.pop() {
            if !consequences.insert(key.clone()) {
                continue;
            }
            if let Some(relation) = self.relations.get(&key) {
                pending.extend(
                    relation
                        .referenced_by
                        .iter()
                        .filter(|dependent| !consequences.contains(*dependent))
                        .cloned(),
                );
            }
        }
        consequences
    }

    /// Remove `keys` and every reference to them. Does not cascade.
    fn remove_refs(&mut self, keys: &HashSet<ReferenceKey>) -> Vec<ReferenceKey> {
        let mut removed: Vec<ReferenceKey> = keys
            .iter()
            .filter(|key| self.relations.remove(*key).is_some())
            .cloned()
            .collect();
        for cached in self.relations.values_mut() {
            cached.release_references(keys);
        }
        removed.sort();
        removed
    }

    fn drop_cascade(&mut self, dropped: &ReferenceKey) -> Vec<ReferenceKey> {
        if !self.relations.contains_key(dropped) {
            // drop-if-exists of something we never saw is routine
            debug!("dropped a nonexistent relationship: {}", dropped);
            return Vec::new();
        }
        let consequences = self.collect_consequences(dropped);
        debug!(
            "drop {} is cascading to {} relation(s): {:?}",
            dropped,
            consequences.len(),
            consequences
        );
        self.remove_refs(&consequences)
    }

    fn rename(&mut self, old_key: &ReferenceKey, new_key: &ReferenceKey) -> Result<()> {
        if !self.relations.contains_key(old_key) {
            // created and renamed within this run before we ever saw it
            debug!(
                "old key {} not found in relations, assuming temporary",
                old_key
            );
            return Ok(());
        }
        if self.relations.contains_key(new_key) {
            let mut known: Vec<String> = self.relations.keys().map(|k| k.to_string()).collect();
            known.sort();
            return Err(RelcacheError::cache_inconsistent(format!(
                "in rename, new key {} already in cache: [{}]",
                new_key,
                known.join(", ")
            )));
        }
        // check every referrer before touching anything so a failure leaves
        // the cache as it was
        if let Some(conflict) = self
            .relations
            .values()
            .find(|cached| cached.is_referenced_by(old_key) && cached.is_referenced_by(new_key))
        {
            return Err(RelcacheError::cache_inconsistent(format!(
                "in rename of \"{}\" -> \"{}\", {} already references the new name",
                old_key,
                new_key,
                conflict.key()
            )));
        }

        let mut relation = match self.relations.remove(old_key) {
            Some(relation) => relation,
            None => return Ok(()),
        };
        relation.rename(new_key);
        relation.rename_key(old_key, new_key)?;

        for cached in self.relations.values_mut() {
            if cached.is_referenced_by(old_key) {
                debug!(
                    "updated reference from {} -> {} to {} -> {}",
                    old_key,
                    cached.key(),
                    new_key,
                    cached.key()
                );
                cached.rename_key(old_key, new_key)?;
            }
        }

        self.relations.insert(new_key.clone(), relation);
        Ok(())
    }

    fn keys_in_schema(&self, schema: &str) -> Vec<ReferenceKey> {
        let schema = schema.to_lowercase();
        let mut keys: Vec<ReferenceKey> = self
            .relations
            .keys()
            .filter(|key| key.schema.to_lowercase() == schema)
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

/// Write access to the cache handed to [`RelationsCache::populate`].
pub struct CacheWriter<'a, R> {
    state: &'a mut CacheState<R>,
}

impl<R: RelationDescriptor> CacheWriter<'_, R> {
    pub fn add(
        &mut self,
        schema: &str,
        identifier: &str,
        kind: Option<RelationKind>,
        inner: Option<R>,
    ) -> Result<()> {
        self.state.add(schema, identifier, kind, inner)
    }

    pub fn add_link(
        &mut self,
        referenced_schema: &str,
        referenced_identifier: &str,
        dependent_schema: &str,
        dependent_identifier: &str,
    ) -> Result<()> {
        self.state.add_link(
            &ReferenceKey::new(referenced_schema, referenced_identifier),
            &ReferenceKey::new(dependent_schema, dependent_identifier),
        )
    }

    pub fn update_schemas<I, S>(&mut self, schemas: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.state
            .schemas
            .extend(schemas.into_iter().map(|s| s.as_ref().to_lowercase()));
    }

    pub fn contains_relation(&self, schema: &str, identifier: &str) -> bool {
        self.state
            .relations
            .contains_key(&ReferenceKey::new(schema, identifier))
    }
}

/// Thread-safe cache of the relations known to exist in one database.
pub struct RelationsCache<R> {
    database: Option<String>,
    state: Mutex<CacheState<R>>,
}

impl<R: RelationDescriptor> RelationsCache<R> {
    /// Create an empty cache that is not tied to a database name
    pub fn new() -> Self {
        Self {
            database: None,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Create an empty cache scoped to one database
    pub fn for_database(database: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Record that a relation exists, merging with what is already known.
    ///
    /// A differing non-empty `kind` is an internal error. `inner` is only
    /// adopted when the node has none yet.
    pub fn add(
        &self,
        schema: &str,
        identifier: &str,
        kind: Option<RelationKind>,
        inner: Option<R>,
    ) -> Result<()> {
        debug!(
            "Adding relation: {}.{} ({})",
            schema,
            identifier,
            kind.map(|k| k.as_str()).unwrap_or("unknown")
        );
        self.trace_graph("before adding");
        self.state.lock().add(schema, identifier, kind, inner)?;
        self.trace_graph("after adding");
        Ok(())
    }

    /// Record that the dependent relation selects from the referenced one,
    /// so dropping the referenced relation with `CASCADE` drops the dependent.
    ///
    /// Both relations must already be cached.
    pub fn add_link(
        &self,
        referenced_schema: &str,
        referenced_identifier: &str,
        dependent_schema: &str,
        dependent_identifier: &str,
    ) -> Result<()> {
        let referenced = ReferenceKey::new(referenced_schema, referenced_identifier);
        let dependent = ReferenceKey::new(dependent_schema, dependent_identifier);
        debug!("adding link, {} references {}", dependent, referenced);
        self.trace_graph("before adding link");
        self.state.lock().add_link(&referenced, &dependent)?;
        self.trace_graph("after adding link");
        Ok(())
    }

    /// Drop a relation and everything that depends on it.
    ///
    /// Dropping an unknown relation is a no-op. Returns the removed keys.
    pub fn drop_relation(&self, schema: &str, identifier: &str) -> Vec<ReferenceKey> {
        let dropped = ReferenceKey::new(schema, identifier);
        debug!("Dropping relation: {}", dropped);
        self.trace_graph("before drop");
        let removed = self.state.lock().drop_cascade(&dropped);
        self.trace_graph("after drop");
        removed
    }

    /// Rename a relation and repoint everything that referenced it.
    ///
    /// Renaming an unknown relation is a no-op; renaming onto a cached name
    /// is an internal error and leaves the cache untouched.
    pub fn rename(
        &self,
        old_schema: &str,
        old_identifier: &str,
        new_schema: &str,
        new_identifier: &str,
    ) -> Result<()> {
        let old_key = ReferenceKey::new(old_schema, old_identifier);
        let new_key = ReferenceKey::new(new_schema, new_identifier);
        debug!("Renaming relation {} to {}", old_key, new_key);
        self.trace_graph("before rename");
        self.state.lock().rename(&old_key, &new_key)?;
        self.trace_graph("after rename");
        Ok(())
    }

    /// Descriptors of every relation in `schema` (case-insensitive), sorted by key.
    ///
    /// Placeholder nodes without a descriptor are skipped.
    pub fn get_relations(&self, schema: &str) -> Vec<R> {
        let state = self.state.lock();
        state
            .keys_in_schema(schema)
            .iter()
            .filter_map(|key| state.relations.get(key))
            .filter_map(|relation| relation.inner.clone())
            .collect()
    }

    /// A copy of the cached node for an exact (case-sensitive) key
    pub fn get_relation(&self, schema: &str, identifier: &str) -> Option<CachedRelation<R>> {
        self.state
            .lock()
            .relations
            .get(&ReferenceKey::new(schema, identifier))
            .cloned()
    }

    /// Mark a schema as cached
    pub fn add_schema(&self, schema: &str) {
        self.state.lock().schemas.insert(schema.to_lowercase());
    }

    /// Mark several schemas as cached
    pub fn update_schemas<I, S>(&self, schemas: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let schemas: Vec<String> = schemas
            .into_iter()
            .map(|s| s.as_ref().to_lowercase())
            .collect();
        self.state.lock().schemas.extend(schemas);
    }

    /// Whether `schema` has been cached. When both the cache and the caller
    /// name a database they must agree.
    pub fn contains(&self, database: Option<&str>, schema: &str) -> bool {
        if let (Some(ours), Some(theirs)) = (self.database.as_deref(), database) {
            if !ours.eq_ignore_ascii_case(theirs) {
                return false;
            }
        }
        self.state.lock().schemas.contains(&schema.to_lowercase())
    }

    /// Cached schema names, sorted
    pub fn schemas(&self) -> Vec<String> {
        let mut schemas: Vec<String> = self.state.lock().schemas.iter().cloned().collect();
        schemas.sort();
        schemas
    }

    /// Drop every relation in `schema` (with cascade) and forget the schema
    pub fn drop_schema(&self, schema: &str) -> Vec<ReferenceKey> {
        debug!("Dropping schema: {}", schema);
        let mut removed = {
            let mut state = self.state.lock();
            let mut removed = Vec::new();
            for key in state.keys_in_schema(schema) {
                removed.extend(state.drop_cascade(&key));
            }
            state.schemas.remove(&schema.to_lowercase());
            removed
        };
        self.trace_graph("after drop schema");
        removed.sort();
        removed
    }

    /// Fill the cache in one step.
    ///
    /// `fill` runs with the lock held against a working copy that replaces
    /// the cache only when `fill` succeeds. It must touch the cache only
    /// through the [`CacheWriter`]: calling back into this `RelationsCache`
    /// deadlocks, as the lock is not reentrant. It must not do warehouse I/O.
    pub fn populate<F>(&self, clear: bool, fill: F) -> Result<()>
    where
        F: FnOnce(&mut CacheWriter<'_, R>) -> Result<()>,
    {
        {
            let mut state = self.state.lock();
            let mut working = if clear {
                CacheState::default()
            } else {
                state.clone()
            };
            fill(&mut CacheWriter {
                state: &mut working,
            })?;
            *state = working;
        }
        self.trace_graph("after populate");
        Ok(())
    }

    /// Every relation with the relations that reference it, dot-separated
    pub fn dump_graph(&self) -> BTreeMap<String, Vec<String>> {
        let state = self.state.lock();
        state
            .relations
            .iter()
            .map(|(key, relation)| (key.to_string(), relation.dump_graph_entry()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().relations.is_empty()
    }

    /// Forget every relation and schema
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    fn trace_graph(&self, stage: &str) {
        if tracing::enabled!(Level::TRACE) {
            let graph = self.dump_graph();
            tracing::trace!(stage = stage, graph = ?graph, "relation cache graph");
        }
    }
}

impl RelationsCache<BaseRelation> {
    /// Cache a fully described relation under its own path
    pub fn add_relation(&self, relation: BaseRelation) -> Result<()> {
        let key = relation.key().ok_or_else(|| {
            RelcacheError::internal(format!(
                "Attempted to cache relation {} without a schema and identifier",
                relation
            ))
        })?;
        self.add(&key.schema, &key.identifier, relation.kind, Some(relation))
    }
}

impl<R: RelationDescriptor> Default for RelationsCache<R> {
    fn default() -> Self {
        Self::new()
    }
}
