mod common;

use butlerdb::{
    DataCoordinate, DataIdValue, GraphBuilder, Pipeline, Placement, QueryArgs, Registry, TaskDef,
};
use common::{insert_all, populated_registry, register, DETECTORS};

const PLACEMENTS: [Placement; 2] = [Placement::Pushdown, Placement::Postprocess];

fn sorted(mut data_ids: Vec<DataCoordinate>) -> Vec<DataCoordinate> {
    data_ids.sort();
    data_ids
}

/// Calibrations with dimensions {instrument, detector}: `calib/a` has every
/// detector, `calib/b` only detector 1.
fn with_bias(registry: &mut Registry) {
    register(registry, "bias", &["instrument", "detector"]);
    registry.register_run("calib/a").unwrap();
    registry.register_run("calib/b").unwrap();
    let data_id = |registry: &Registry, detector: i64| {
        registry
            .expand_data_id(
                [
                    ("instrument", DataIdValue::from("HSC")),
                    ("detector", DataIdValue::from(detector)),
                ],
                None,
            )
            .unwrap()
    };
    let all: Vec<DataCoordinate> = DETECTORS.iter().map(|d| data_id(registry, *d)).collect();
    registry.insert_datasets("bias", all, "calib/a", None).unwrap();
    let one = vec![data_id(registry, 1)];
    registry.insert_datasets("bias", one, "calib/b", None).unwrap();
}

#[test]
fn test_data_id_queries_agree() {
    let registry = populated_registry();
    let expressions = [
        "instrument = 'HSC'",
        "instrument = 'HSC' AND detector.purpose = 'SCIENCE'",
        "instrument = 'HSC' AND band = 'r'",
        "instrument = 'HSC' AND physical_filter IN ('HSC-G', 'HSC-I')",
        "instrument = 'HSC' AND visit > 100 AND NOT detector = 2",
        "instrument = 'HSC' AND (visit = 100 OR detector = 2)",
        "instrument = 'HSC' AND visit.timespan OVERLAPS (T'2024-01-01T00:15:00/utc', T'2024-01-01T01:10:00/utc')",
        "instrument = 'HSC' AND visit = 999",
    ];
    for expression in expressions {
        let results: Vec<Vec<DataCoordinate>> = PLACEMENTS
            .iter()
            .map(|placement| {
                sorted(
                    registry
                        .query_data_ids(
                            &["visit", "detector"],
                            QueryArgs::new().where_clause(expression).placement(*placement),
                        )
                        .unwrap()
                        .to_vec()
                        .unwrap(),
                )
            })
            .collect();
        assert_eq!(results[0], results[1], "{}", expression);
    }
}

#[test]
fn test_ordered_limited_queries_agree() {
    let registry = populated_registry();
    let run = |placement| {
        registry
            .query_data_ids(
                &["visit", "detector"],
                QueryArgs::new()
                    .where_clause("instrument = 'HSC'")
                    .order_by(["-visit", "detector"])
                    .limit(3, Some(1))
                    .placement(placement),
            )
            .unwrap()
            .to_vec()
            .unwrap()
    };
    let pushed = run(Placement::Pushdown);
    assert_eq!(pushed.len(), 3);
    assert_eq!(pushed[0].value("visit"), Some(&DataIdValue::from(102)));
    assert_eq!(pushed[0].value("detector"), Some(&DataIdValue::from(2)));
    assert_eq!(pushed, run(Placement::Postprocess));
}

#[test]
fn test_find_first_agrees() {
    let mut registry = populated_registry();
    with_bias(&mut registry);

    let mut found = Vec::new();
    for placement in PLACEMENTS {
        let mut refs = registry
            .query_datasets(
                "bias",
                QueryArgs::new()
                    .collections(["calib/b", "calib/a"])
                    .find_first(true)
                    .placement(placement),
            )
            .unwrap()
            .to_vec()
            .unwrap();
        refs.sort_by_key(|r| r.id());
        found.push(refs);
    }
    assert_eq!(found[0], found[1]);
    assert_eq!(found[0].len(), 2);
    for dataset_ref in &found[0] {
        let expected = if dataset_ref.data_id().value("detector") == Some(&DataIdValue::from(1)) {
            "calib/b"
        } else {
            "calib/a"
        };
        assert_eq!(dataset_ref.run(), expected);
    }
}

#[test]
fn test_dataset_constraint_agrees() {
    let mut registry = populated_registry();
    register(&mut registry, "raw", &["visit", "detector"]);
    with_bias(&mut registry);
    insert_all(&mut registry, "raw", "raw/all");

    for find_first in [false, true] {
        let results: Vec<Vec<DataCoordinate>> = PLACEMENTS
            .iter()
            .map(|placement| {
                sorted(
                    registry
                        .query_data_ids(
                            &["visit", "detector"],
                            QueryArgs::new()
                                .datasets(["raw", "bias"])
                                .collections(["calib/b", "raw/all"])
                                .find_first(find_first)
                                .where_clause("instrument = 'HSC' AND visit < 102")
                                .placement(*placement),
                        )
                        .unwrap()
                        .to_vec()
                        .unwrap(),
                )
            })
            .collect();
        assert_eq!(results[0], results[1]);
        // Only detector 1 has a bias in calib/b.
        assert_eq!(results[0].len(), 2);
    }
}

#[test]
fn test_quantum_graphs_agree() {
    let mut registry = populated_registry();
    register(&mut registry, "raw", &["visit", "detector"]);
    register(&mut registry, "post_isr", &["visit", "detector"]);
    register(&mut registry, "visit_summary", &["visit"]);
    with_bias(&mut registry);
    insert_all(&mut registry, "raw", "raw/all");

    let pipeline = Pipeline::new()
        .with_task(
            TaskDef::new("isr", ["visit", "detector"])
                .input("raw", "raw")
                .input("bias", "bias")
                .output("post_isr", "post_isr"),
        )
        .unwrap()
        .with_task(
            TaskDef::new("summarize", ["visit"])
                .input("exposures", "post_isr")
                .output("summary", "visit_summary"),
        )
        .unwrap();

    let graphs: Vec<_> = PLACEMENTS
        .iter()
        .map(|placement| {
            GraphBuilder::new(&registry, &pipeline)
                .input_collections(["calib/b", "calib/a", "raw/all"])
                .output_run("out")
                .where_clause("instrument = 'HSC' AND visit IN (100, 101)")
                .placement(*placement)
                .build()
                .unwrap()
        })
        .collect();
    assert_eq!(graphs[0], graphs[1]);
    assert_eq!(graphs[0].quanta_for_task("isr").len(), 4);
    assert_eq!(graphs[0].quanta_for_task("summarize").len(), 2);

    // Each isr quantum reads the find-first bias for its detector.
    for index in graphs[0].quanta_for_task("isr") {
        let quantum = graphs[0].quantum(index).unwrap();
        assert_eq!(quantum.input_ids().count(), 2);
        let bias_ids = &quantum.inputs["bias"];
        assert_eq!(bias_ids.len(), 1);
        let bias = registry.get_dataset(bias_ids[0]).unwrap().unwrap();
        let expected = if quantum.data_id["detector"] == DataIdValue::from(1) {
            "calib/b"
        } else {
            "calib/a"
        };
        assert_eq!(bias.run(), expected);
    }
}
