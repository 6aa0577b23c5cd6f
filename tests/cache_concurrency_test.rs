//! Concurrency tests for the relation cache
//!
//! Worker threads mutate disjoint parts of one shared cache; the result must
//! match running the same operations one thread at a time.

use relcache::database::{BaseRelation, RelationKind, RelationsCache};
use std::sync::Arc;
use std::thread;

const WORKERS: usize = 8;

fn relation(schema: &str, identifier: &str) -> BaseRelation {
    BaseRelation::create(Some("analytics"), schema, identifier).with_kind(RelationKind::Table)
}

/// One worker's build: a small chain, a rename and a cascading drop.
fn build(cache: &RelationsCache<BaseRelation>, worker: usize) {
    let schema = "shared";
    let name = |suffix: &str| format!("w{}_{}", worker, suffix);

    for suffix in ["src", "stg", "mart", "tmp"] {
        let id = name(suffix);
        cache
            .add(schema, &id, Some(RelationKind::Table), Some(relation(schema, &id)))
            .unwrap();
    }
    cache.add_link(schema, &name("src"), schema, &name("stg")).unwrap();
    cache.add_link(schema, &name("stg"), schema, &name("mart")).unwrap();
    cache.add_link(schema, &name("src"), schema, &name("tmp")).unwrap();

    cache.rename(schema, &name("mart"), schema, &name("mart_final")).unwrap();
    cache.drop_relation(schema, &name("tmp"));

    let own_schema = format!("private_{}", worker);
    cache
        .add(&own_schema, "model", None, Some(relation(&own_schema, "model")))
        .unwrap();
    cache.drop_relation(&own_schema, "model");
    cache.drop_relation(&own_schema, "model");
    cache.rename(&own_schema, "model", &own_schema, "other").unwrap();
}

fn identifiers(cache: &RelationsCache<BaseRelation>, schema: &str) -> Vec<String> {
    cache
        .get_relations(schema)
        .into_iter()
        .filter_map(|r| r.identifier)
        .collect()
}

#[test]
fn test_concurrent_builds_converge_to_serial_result() {
    let serial = RelationsCache::new();
    for worker in 0..WORKERS {
        build(&serial, worker);
    }

    let shared = Arc::new(RelationsCache::new());
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let cache = shared.clone();
            thread::spawn(move || build(&cache, worker))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shared.dump_graph(), serial.dump_graph());
    assert_eq!(identifiers(&shared, "shared"), identifiers(&serial, "shared"));
    assert_eq!(shared.len(), WORKERS * 3);

    let graph = shared.dump_graph();
    assert_eq!(
        graph["shared.w3_src"],
        vec!["shared.w3_stg".to_string()]
    );
    assert_eq!(
        graph["shared.w3_stg"],
        vec!["shared.w3_mart_final".to_string()]
    );
}

#[test]
fn test_concurrent_drop_of_shared_root() {
    let cache = Arc::new(RelationsCache::<BaseRelation>::new());
    cache
        .add("s", "root", Some(RelationKind::Table), Some(relation("s", "root")))
        .unwrap();
    for i in 0..WORKERS {
        let id = format!("view_{}", i);
        cache
            .add("s", &id, Some(RelationKind::View), Some(relation("s", &id)))
            .unwrap();
        cache.add_link("s", "root", "s", &id).unwrap();
    }
    cache
        .add("s", "unrelated", Some(RelationKind::Table), Some(relation("s", "unrelated")))
        .unwrap();

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || cache.drop_relation("s", "root").len())
        })
        .collect();
    let removed: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // exactly one drop saw the cascade, the others were no-ops
    assert_eq!(removed.iter().filter(|n| **n == WORKERS + 1).count(), 1);
    assert_eq!(removed.iter().filter(|n| **n == 0).count(), WORKERS - 1);
    assert_eq!(identifiers(&cache, "s"), vec!["unrelated".to_string()]);
}

#[test]
fn test_racing_adds_merge() {
    let cache = Arc::new(RelationsCache::<BaseRelation>::new());
    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let cache = cache.clone();
            thread::spawn(move || {
                if i % 2 == 0 {
                    cache.add("s", "t", None, None)
                } else {
                    cache.add("s", "t", Some(RelationKind::Table), Some(relation("s", "t")))
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let cached = cache.get_relation("s", "t").unwrap();
    assert_eq!(cached.kind(), Some(RelationKind::Table));
    assert!(cached.inner().is_some());
    assert_eq!(cache.len(), 1);
}
