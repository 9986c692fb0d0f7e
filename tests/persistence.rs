#![cfg(feature = "snapshot")]

mod common;

use butlerdb::{ButlerError, CollectionType, QueryArgs, Registry, RegistryBuilder};
use common::{insert_all, register, seed, visit_detector};
use tempfile::TempDir;

#[test]
fn test_registry_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.snap");

    let ids = {
        let mut registry = Registry::open(&path).unwrap();
        seed(&mut registry);
        register(&mut registry, "raw", &["visit", "detector"]);
        let refs = insert_all(&mut registry, "raw", "run/a");
        registry.register_collection("chain", CollectionType::Chained).unwrap();
        registry.set_collection_chain("chain", &["run/a"]).unwrap();
        registry.close().unwrap();
        refs.iter().map(|r| r.id()).collect::<Vec<_>>()
    };

    let registry = Registry::open(&path).unwrap();
    assert_eq!(registry.stats().datasets, ids.len());
    assert_eq!(registry.get_collection_chain("chain").unwrap(), vec!["run/a"]);

    let found = registry
        .find_dataset("raw", &visit_detector(&registry, 100, 1), Some(&["chain"][..]))
        .unwrap()
        .unwrap();
    assert_eq!(found.id(), ids[0]);

    let ingest_before = registry.get_ingest_date(ids[0]).unwrap();
    let queried = registry
        .query_datasets("raw", QueryArgs::new().collections(["chain"]))
        .unwrap()
        .count()
        .unwrap();
    assert_eq!(queried, ids.len());
    assert!(ingest_before.tai_nsec() > 0);
}

#[test]
fn test_closed_registry_rejects_operations() {
    let dir = TempDir::new().unwrap();
    let mut registry = RegistryBuilder::new()
        .snapshot_path(dir.path().join("closed.snap"))
        .build()
        .unwrap();
    registry.close().unwrap();
    assert!(registry.is_closed());
    assert!(matches!(
        registry.register_run("late"),
        Err(ButlerError::RegistryClosed)
    ));
    // Closing twice is harmless.
    registry.close().unwrap();
}

#[test]
fn test_failed_transaction_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("txn.snap");
    {
        let mut registry = Registry::open(&path).unwrap();
        registry.register_run("kept").unwrap();
        let result: butlerdb::Result<()> = registry.transaction(|txn| {
            txn.register_run("dropped")?;
            txn.get_dataset_type("missing")?;
            Ok(())
        });
        assert!(result.is_err());
    }

    let registry = Registry::open(&path).unwrap();
    assert_eq!(registry.collection_type("kept").unwrap(), CollectionType::Run);
    assert!(registry.collection_type("dropped").is_err());
}
