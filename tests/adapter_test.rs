//! Integration tests for the adapter: SQL first, then the cache

mod common;

use common::{profile, MockDriver, Operation, LINKS_SQL};
use relcache::database::{BaseRelation, RelationAdapter, RelationKind, SqlAdapter};
use relcache::error::RelcacheError;

/// An adapter over a warehouse holding:
/// `staging.orders <- staging.orders_v <- marts.revenue` and `staging.customers`.
fn adapter() -> SqlAdapter<MockDriver> {
    let driver = MockDriver::new();
    driver.add_catalog_relation("staging", "orders", "BASE TABLE");
    driver.add_catalog_relation("staging", "orders_v", "VIEW");
    driver.add_catalog_relation("staging", "customers", "BASE TABLE");
    driver.add_catalog_relation("marts", "revenue", "VIEW");
    driver.add_catalog_link("staging", "orders", "staging", "orders_v");
    driver.add_catalog_link("staging", "orders_v", "marts", "revenue");
    // endpoint outside the cached schemas
    driver.add_catalog_link("staging", "customers", "scratch", "customer_dump");

    let adapter = SqlAdapter::new(driver, &profile(2));
    adapter.connections().set_connection_name(None).unwrap();
    adapter
}

fn statements(adapter: &SqlAdapter<MockDriver>) -> Vec<String> {
    adapter.connections().driver().statements()
}

fn identifiers(relations: &[BaseRelation]) -> Vec<String> {
    relations
        .iter()
        .filter_map(|r| r.identifier.clone())
        .collect()
}

#[test]
fn test_populate_cache_loads_relations_and_links() {
    let adapter = adapter();
    let cached = adapter.populate_cache(["staging", "marts"], true).unwrap();
    assert_eq!(cached, 4);

    let graph = adapter.cache().dump_graph();
    assert_eq!(graph["staging.orders"], vec!["staging.orders_v".to_string()]);
    assert_eq!(graph["staging.orders_v"], vec!["marts.revenue".to_string()]);
    assert!(graph["staging.customers"].is_empty());
    assert!(!graph.contains_key("scratch.customer_dump"));

    assert!(adapter.cache().contains(Some("ANALYTICS"), "Staging"));
    assert!(!adapter.cache().contains(Some("other"), "staging"));
    assert_eq!(
        statements(&adapter).last().map(String::as_str),
        Some(LINKS_SQL)
    );
}

#[test]
fn test_list_relations_uses_cache_when_schema_cached() {
    let adapter = adapter();
    adapter.populate_cache(["staging"], true).unwrap();
    let before = statements(&adapter).len();

    let relations = adapter.list_relations("staging").unwrap();
    assert_eq!(identifiers(&relations), vec!["customers", "orders", "orders_v"]);
    assert_eq!(statements(&adapter).len(), before);

    let uncached = adapter.list_relations("marts").unwrap();
    assert_eq!(identifiers(&uncached), vec!["revenue"]);
    assert_eq!(statements(&adapter).len(), before + 1);
    assert!(!adapter.cache().contains(None, "marts"));
}

#[test]
fn test_drop_relation_cascades_in_cache() {
    let adapter = adapter();
    adapter.populate_cache(["staging", "marts"], true).unwrap();

    let orders = adapter.relation("staging", "orders").with_kind(RelationKind::Table);
    adapter.drop_relation(&orders).unwrap();

    let statements = statements(&adapter);
    assert_eq!(
        statements[statements.len() - 2..],
        [
            "BEGIN".to_string(),
            r#"drop table if exists "analytics"."staging"."orders" cascade"#.to_string()
        ]
    );
    assert_eq!(
        identifiers(&adapter.list_relations("staging").unwrap()),
        vec!["customers"]
    );
    assert!(adapter.list_relations("marts").unwrap().is_empty());
}

#[test]
fn test_failed_drop_leaves_cache_untouched() {
    let adapter = adapter();
    adapter.populate_cache(["staging"], true).unwrap();
    adapter.connections().driver().fail(Operation::Execute);

    let orders = adapter.relation("staging", "orders").with_kind(RelationKind::Table);
    let err = adapter.drop_relation(&orders).unwrap_err();
    assert!(matches!(err, RelcacheError::Database(_)));
    assert_eq!(adapter.cache().len(), 3);
}

#[test]
fn test_rename_relation_repoints_dependents() {
    let adapter = adapter();
    adapter.populate_cache(["staging", "marts"], true).unwrap();

    let from = adapter.relation("staging", "orders").with_kind(RelationKind::Table);
    let to = adapter.relation("staging", "orders_old");
    adapter.rename_relation(&from, &to).unwrap();

    let renamed = adapter.cache().get_relation("staging", "orders_old").unwrap();
    assert!(renamed.is_referenced_by(&relcache::database::ReferenceKey::new(
        "staging", "orders_v"
    )));
    assert_eq!(
        renamed.inner().unwrap().render().unwrap(),
        r#""analytics"."staging"."orders_old""#
    );
    assert!(adapter.cache().get_relation("staging", "orders").is_none());
}

#[test]
fn test_rename_onto_cached_name_is_internal() {
    let adapter = adapter();
    adapter.populate_cache(["staging"], true).unwrap();

    let from = adapter.relation("staging", "orders").with_kind(RelationKind::Table);
    let to = adapter.relation("staging", "customers");
    let before = adapter.cache().dump_graph();
    assert!(adapter.rename_relation(&from, &to).unwrap_err().is_internal());
    assert_eq!(adapter.cache().dump_graph(), before);
}

#[test]
fn test_schema_lifecycle() {
    let adapter = adapter();
    adapter.create_schema("scratch").unwrap();
    assert!(adapter.cache().contains(None, "scratch"));

    adapter
        .cache_new_relation(adapter.relation("scratch", "Tmp").with_kind(RelationKind::Table))
        .unwrap();
    assert_eq!(adapter.list_relations("scratch").unwrap().len(), 1);

    adapter.drop_schema("scratch").unwrap();
    assert!(!adapter.cache().contains(None, "scratch"));
    assert!(adapter.cache().get_relation("scratch", "tmp").is_none());

    let driver = adapter.connections().driver();
    assert_eq!(driver.count(&driver.commits), 2);
    assert!(driver
        .statements()
        .contains(&r#"drop schema if exists "scratch" cascade"#.to_string()));
}

