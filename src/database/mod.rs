//! Database module
//!
//! This module provides the relation cache, the per-thread connection
//! manager, the warehouse drivers, and the adapter that ties them together.

pub mod adapter;
pub mod cache;
pub mod connection;
pub mod driver;
pub mod drivers;
pub mod manager;
pub mod relation;

// Re-exports
pub use adapter::{RelationAdapter, SqlAdapter};
pub use cache::{CacheWriter, CachedRelation, RelationsCache};
pub use connection::{Connection, ConnectionState, DatabaseBackend};
pub use driver::{CatalogRelation, ConnectionDriver, QueryResult, RelationLink};
pub use drivers::{PostgresDriver, SqliteDriver};
pub use manager::{ConnectionInfo, ConnectionManager, ThreadConnection, ThreadKey};
pub use relation::{
    quote_identifier, BaseRelation, Policy, ReferenceKey, RelationDescriptor, RelationKind,
};
