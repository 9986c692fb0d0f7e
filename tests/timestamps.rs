mod common;

use butlerdb::{AstroTime, ButlerError, DataIdValue, Placement, QueryArgs, TimeScale};
use common::{insert_all, populated_registry, register};

#[test]
fn test_ingest_date_is_a_time_value() {
    let mut registry = populated_registry();
    register(&mut registry, "raw", &["visit", "detector"]);
    let before = AstroTime::now();
    let refs = insert_all(&mut registry, "raw", "run/a");
    let after = AstroTime::now();

    for dataset_ref in &refs {
        let ingested = registry.get_ingest_date(dataset_ref.id()).unwrap();
        assert!(before <= ingested && ingested <= after);
    }

    let results = registry
        .query_datasets("raw", QueryArgs::new().collections(["run/a"]))
        .unwrap()
        .with_ingest_dates()
        .unwrap();
    assert_eq!(results.len(), refs.len());
    for (dataset_ref, ingested) in results {
        assert_eq!(registry.get_ingest_date(dataset_ref.id()).unwrap(), ingested);
    }
}

#[test]
fn test_ingest_date_compares_with_time_literals() {
    let mut registry = populated_registry();
    register(&mut registry, "raw", &["visit", "detector"]);
    let refs = insert_all(&mut registry, "raw", "run/a");
    let target = &refs[0];
    let ingested = registry.get_ingest_date(target.id()).unwrap();

    let tai = format!("T'{}'", ingested.to_iso(TimeScale::Tai));
    let utc = format!("T'{}/utc'", ingested.to_iso(TimeScale::Utc));

    for placement in [Placement::Pushdown, Placement::Postprocess] {
        for literal in [&tai, &utc] {
            let matched = registry
                .query_datasets(
                    "raw",
                    QueryArgs::new()
                        .collections(["run/a"])
                        .where_clause(format!("instrument = 'HSC' AND ingest_date = {} AND visit = 100 AND detector = 1", literal))
                        .placement(placement),
                )
                .unwrap()
                .to_vec()
                .unwrap();
            assert_eq!(matched.len(), 1, "{} with {:?}", literal, placement);
            assert_eq!(matched[0].id(), target.id());
        }

        let all_later = registry
            .query_datasets(
                "raw",
                QueryArgs::new()
                    .collections(["run/a"])
                    .where_clause("raw.ingest_date > T'2000-01-01'")
                    .placement(placement),
            )
            .unwrap()
            .count()
            .unwrap();
        assert_eq!(all_later, refs.len());

        let none_earlier = registry
            .query_datasets(
                "raw",
                QueryArgs::new()
                    .collections(["run/a"])
                    .where_clause("ingest_date < T'2000-01-01/utc'")
                    .placement(placement),
            )
            .unwrap()
            .any()
            .unwrap();
        assert!(!none_earlier);
    }
}

#[test]
fn test_ingest_date_bind_value() {
    let mut registry = populated_registry();
    register(&mut registry, "raw", &["visit", "detector"]);
    insert_all(&mut registry, "raw", "run/a");
    let cutoff = AstroTime::parse_literal("2001-01-01T00:00:00/utc").unwrap();

    let count = registry
        .query_datasets(
            "raw",
            QueryArgs::new()
                .collections(["run/a"])
                .where_clause("ingest_date >= cutoff")
                .bind("cutoff", cutoff),
        )
        .unwrap()
        .count()
        .unwrap();
    assert_eq!(count, 6);
}

#[test]
fn test_run_column_is_queryable() {
    let mut registry = populated_registry();
    register(&mut registry, "raw", &["visit", "detector"]);
    insert_all(&mut registry, "raw", "run/a");
    insert_all(&mut registry, "raw", "run/b");

    let refs = registry
        .query_datasets(
            "raw",
            QueryArgs::new()
                .collections(["run/a", "run/b"])
                .where_clause("raw.run = 'run/b'"),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(refs.len(), 6);
    assert!(refs.iter().all(|r| r.run() == "run/b"));
}

#[test]
fn test_ingest_date_compared_with_integer_is_rejected() {
    let mut registry = populated_registry();
    register(&mut registry, "raw", &["visit", "detector"]);
    insert_all(&mut registry, "raw", "run/a");

    let result = registry
        .query_datasets(
            "raw",
            QueryArgs::new()
                .collections(["run/a"])
                .where_clause("ingest_date > 5"),
        )
        .unwrap()
        .to_vec();
    assert!(matches!(result, Err(ButlerError::Expression(_))));
}

#[test]
fn test_timespan_overlap_with_time_literal() {
    let registry = populated_registry();
    let visits = registry
        .query_data_ids(
            &["visit"],
            QueryArgs::new().where_clause(
                "instrument = 'HSC' AND visit.timespan OVERLAPS T'2024-01-01T01:15:00/utc'",
            ),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(visits.len(), 1);
    assert_eq!(visits[0].value("visit"), Some(&DataIdValue::from(101)));
}
