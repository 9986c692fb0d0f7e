mod common;

use butlerdb::{ButlerError, CollectionType, Config, DataIdValue, QueryArgs, Registry};
use common::{insert_all, populated_registry, register, seed, visit_detector};

#[test]
fn test_chain_order_decides_find_first() {
    let mut registry = populated_registry();
    register(&mut registry, "calexp", &["visit", "detector"]);
    let old = insert_all(&mut registry, "calexp", "runs/old");
    let new = insert_all(&mut registry, "calexp", "runs/new");

    registry.register_collection("latest", CollectionType::Chained).unwrap();
    registry.set_collection_chain("latest", &["runs/new", "runs/old"]).unwrap();
    let data_id = visit_detector(&registry, 101, 2);

    let found = registry
        .find_dataset("calexp", &data_id, Some(&["latest"][..]))
        .unwrap()
        .unwrap();
    assert!(new.contains(&found));

    registry.set_collection_chain("latest", &["runs/old", "runs/new"]).unwrap();
    let found = registry
        .find_dataset("calexp", &data_id, Some(&["latest"][..]))
        .unwrap()
        .unwrap();
    assert!(old.contains(&found));

    let every = registry
        .query_datasets("calexp", QueryArgs::new().collections(["latest"]))
        .unwrap()
        .count()
        .unwrap();
    assert_eq!(every, 12);
    let first = registry
        .query_datasets("calexp", QueryArgs::new().collections(["latest"]).find_first(true))
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(first.len(), 6);
    assert!(first.iter().all(|r| r.run() == "runs/old"));
}

#[test]
fn test_chain_cycles_are_rejected() {
    let mut registry = Registry::memory().unwrap();
    registry.register_run("r").unwrap();
    registry.register_collection("a", CollectionType::Chained).unwrap();
    registry.register_collection("b", CollectionType::Chained).unwrap();
    registry.set_collection_chain("a", &["b", "r"]).unwrap();
    assert!(matches!(
        registry.set_collection_chain("b", &["a"]),
        Err(ButlerError::ChainCycle { .. })
    ));
    assert!(matches!(
        registry.set_collection_chain("a", &["a"]),
        Err(ButlerError::ChainCycle { .. })
    ));
    assert_eq!(registry.resolve_collections(&["a"]).unwrap(), vec!["r"]);
}

#[test]
fn test_collections_in_use_cannot_be_removed() {
    let mut registry = populated_registry();
    register(&mut registry, "raw", &["visit", "detector"]);
    let refs = insert_all(&mut registry, "raw", "raw/all");
    registry.register_collection("everything", CollectionType::Chained).unwrap();
    registry.set_collection_chain("everything", &["raw/all"]).unwrap();

    assert!(matches!(
        registry.remove_collection("raw/all"),
        Err(ButlerError::CollectionInUse { .. })
    ));
    registry.remove_collection("everything").unwrap();
    assert!(matches!(
        registry.remove_collection("raw/all"),
        Err(ButlerError::CollectionInUse { .. })
    ));
    registry.remove_datasets(&refs).unwrap();
    registry.remove_collection("raw/all").unwrap();
    assert!(matches!(
        registry.collection_type("raw/all"),
        Err(ButlerError::MissingCollection(_))
    ));
}

#[test]
fn test_tagged_collection_membership() {
    let mut registry = populated_registry();
    register(&mut registry, "raw", &["visit", "detector"]);
    let refs = insert_all(&mut registry, "raw", "raw/all");
    registry.register_collection("good", CollectionType::Tagged).unwrap();

    let picked: Vec<_> = refs
        .iter()
        .filter(|r| r.data_id().value("detector") == Some(&DataIdValue::from(1)))
        .cloned()
        .collect();
    registry.associate("good", &picked).unwrap();
    let tagged = registry
        .query_datasets("raw", QueryArgs::new().collections(["good"]))
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(tagged.len(), 3);

    registry.disassociate("good", &picked[..1]).unwrap();
    let tagged = registry
        .query_datasets("raw", QueryArgs::new().collections(["good"]))
        .unwrap()
        .count()
        .unwrap();
    assert_eq!(tagged, 2);

    // Tagging into a RUN is a type error.
    assert!(matches!(
        registry.associate("raw/all", &picked),
        Err(ButlerError::CollectionTypeMismatch { .. })
    ));
}

#[test]
fn test_glob_patterns_and_defaults() {
    let config = Config::default().with_default_collections(["HSC/runs/*"]);
    let mut registry = Registry::memory_with_config(config).unwrap();
    seed(&mut registry);
    register(&mut registry, "raw", &["visit", "detector"]);
    insert_all(&mut registry, "raw", "HSC/runs/a");
    insert_all(&mut registry, "raw", "HSC/runs/b");
    registry.register_run("other").unwrap();

    let names: Vec<String> = registry
        .query_collections("HSC/*")
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, vec!["HSC/runs/a", "HSC/runs/b"]);

    let count = registry
        .query_datasets("raw", QueryArgs::new())
        .unwrap()
        .count()
        .unwrap();
    assert_eq!(count, 12);

    let found = registry
        .find_dataset::<&str>("raw", &visit_detector(&registry, 102, 1), None)
        .unwrap()
        .unwrap();
    assert_eq!(found.run(), "HSC/runs/a");
}
