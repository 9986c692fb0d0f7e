mod common;

use std::collections::BTreeMap;

use butlerdb::{
    ArtifactIndex, Butler, ButlerError, Config, DataCoordinate, DatasetType, DimensionGroup,
    LogRecords, QueryArgs, TransferMode,
};
use common::{register, seed, visit_detector, DETECTORS, VISITS};
use tempfile::TempDir;

fn butler(root: &std::path::Path) -> Butler {
    let mut butler = Butler::memory(root, Config::default().with_default_run("HSC/run")).unwrap();
    seed(butler.registry_mut());
    register(butler.registry_mut(), "calexp_summary", &["visit", "detector"]);
    butler
}

fn summary(visit: i64, detector: i64) -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("visit".to_string(), visit as f64),
        ("seeing".to_string(), 0.5 + detector as f64 / 10.0),
    ])
}

fn put_all(butler: &mut Butler) {
    for visit in VISITS {
        for detector in DETECTORS {
            let data_id = visit_detector(butler.registry(), visit, detector);
            butler
                .put(&summary(visit, detector), "calexp_summary", &data_id, None)
                .unwrap();
        }
    }
}

#[test]
fn test_put_and_get_by_data_id() {
    let dir = TempDir::new().unwrap();
    let mut butler = butler(dir.path());
    put_all(&mut butler);

    let data_id = visit_detector(butler.registry(), 101, 2);
    let value: BTreeMap<String, f64> = butler
        .get("calexp_summary", &data_id, Some(&["HSC/run"][..]))
        .unwrap();
    assert_eq!(value, summary(101, 2));

    let duplicate = butler.put(&summary(101, 2), "calexp_summary", &data_id, None);
    assert!(matches!(duplicate, Err(ButlerError::ConflictingDataset(_))));
    assert_eq!(butler.datastore().len(), 6);
}

#[test]
fn test_artifacts_move_between_repositories() {
    let source_dir = TempDir::new().unwrap();
    let mut source = butler(source_dir.path());
    put_all(&mut source);

    let refs = source
        .registry()
        .query_datasets(
            "calexp_summary",
            QueryArgs::new()
                .collections(["HSC/run"])
                .where_clause("instrument = 'HSC' AND visit = 100"),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(refs.len(), 2);

    let out = TempDir::new().unwrap();
    let copied = source
        .retrieve_artifacts(&refs, out.path(), false, false)
        .unwrap();
    assert_eq!(copied.len(), 2);
    assert!(copied.iter().all(|p| p.parent() == Some(out.path())));
    let index = ArtifactIndex::read_index(out.path()).unwrap();
    assert_eq!(index.len(), 2);

    // A second retrieval refuses to clobber the files.
    assert!(matches!(
        source.retrieve_artifacts(&refs, out.path(), false, false),
        Err(ButlerError::Artifact(_))
    ));
    source
        .retrieve_artifacts(&refs, out.path(), false, true)
        .unwrap();

    let target_dir = TempDir::new().unwrap();
    let mut target = butler(target_dir.path());
    let imported = target.import_artifacts(out.path(), TransferMode::Move).unwrap();
    assert_eq!(imported.len(), 2);
    for dataset_ref in &imported {
        assert!(refs.contains(dataset_ref));
        let value: BTreeMap<String, f64> = target.get_by_ref(dataset_ref).unwrap();
        let detector = match dataset_ref.data_id().value("detector") {
            Some(butlerdb::DataIdValue::Int(d)) => *d,
            other => panic!("unexpected detector {:?}", other),
        };
        assert_eq!(value, summary(100, detector));
    }
    assert!(copied.iter().all(|p| !p.exists()));

    // Importing the same refs again is idempotent in the registry.
    assert_eq!(target.registry_mut().import_datasets(&imported).unwrap().len(), 2);
}

#[test]
fn test_prune_removes_registry_entry_and_file() {
    let dir = TempDir::new().unwrap();
    let mut butler = butler(dir.path());
    put_all(&mut butler);
    let data_id = visit_detector(butler.registry(), 102, 1);
    let dataset_ref = butler
        .registry()
        .find_dataset("calexp_summary", &data_id, Some(&["HSC/run"][..]))
        .unwrap()
        .unwrap();
    let path = butler.datastore().uri(&dataset_ref).unwrap();
    assert!(path.exists());

    butler.prune_datasets(&[dataset_ref.clone()]).unwrap();
    assert!(!path.exists());
    assert!(matches!(
        butler.get::<BTreeMap<String, f64>, _>("calexp_summary", &data_id, Some(&["HSC/run"][..])),
        Err(ButlerError::DatasetNotFound(_))
    ));
    assert!(matches!(
        butler.get_by_ref::<BTreeMap<String, f64>>(&dataset_ref),
        Err(ButlerError::MissingDataset(_))
    ));
}

#[cfg(feature = "snapshot")]
#[test]
fn test_persistent_butler_reopens() {
    let dir = TempDir::new().unwrap();
    let config = Config::default().with_default_run("HSC/run");
    {
        let mut butler = Butler::open(dir.path(), config.clone()).unwrap();
        seed(butler.registry_mut());
        register(butler.registry_mut(), "calexp_summary", &["visit", "detector"]);
        let data_id = visit_detector(butler.registry(), 100, 1);
        butler
            .put(&summary(100, 1), "calexp_summary", &data_id, None)
            .unwrap();
    }

    let butler = Butler::open(dir.path(), config).unwrap();
    let data_id = visit_detector(butler.registry(), 100, 1);
    let value: BTreeMap<String, f64> = butler
        .get("calexp_summary", &data_id, Some(&["HSC/run"][..]))
        .unwrap();
    assert_eq!(value, summary(100, 1));
}

#[test]
fn test_log_records_stored_as_dataset() {
    let dir = TempDir::new().unwrap();
    let mut butler = butler(dir.path());
    let universe = butler.registry().universe().clone();
    let log_type = DatasetType::new("isr_log", DimensionGroup::empty(&universe), "ButlerLogRecords").unwrap();
    butler.registry_mut().register_dataset_type(&log_type).unwrap();

    let raw = concat!(
        r#"{"name":"isr","asctime":"2024-01-02T03:04:05.678Z","message":"started","levelno":20,"levelname":"INFO","filename":"isr.rs","pathname":"src/isr.rs","lineno":7,"module":"isr","MDC":{"LABEL":"isr"}}"#,
        "\n\n",
        r#"{"name":"isr","asctime":"2024-01-02T03:04:06.000Z","message":"done","levelno":30,"levelname":"WARNING","filename":"isr.rs","pathname":"src/isr.rs","lineno":9,"module":"isr"}"#,
        "\n",
    );
    let records = LogRecords::from_raw(raw).unwrap();
    assert_eq!(records.len(), 2);

    let data_id = DataCoordinate::empty(&universe);
    let dataset_ref = butler.put(&records, "isr_log", &data_id, None).unwrap();
    let back: LogRecords = butler.get_by_ref(&dataset_ref).unwrap();
    assert_eq!(back.len(), 2);
    assert_eq!(back.get(1).map(|r| r.levelname.as_str()), Some("WARNING"));
    assert_eq!(
        back.get(0).unwrap().format("{levelname} {MDC[LABEL]} {message}"),
        "INFO isr started"
    );
    assert!(back.get(1).unwrap().mdc.is_empty());
}
