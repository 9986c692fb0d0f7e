#![allow(dead_code)]

use butlerdb::{
    AstroTime, DataCoordinate, DataIdValue, DatasetRef, DatasetType, DimensionGroup,
    DimensionRecord, Registry, Timespan,
};

pub const VISITS: [i64; 3] = [100, 101, 102];
pub const DETECTORS: [i64; 2] = [1, 2];

/// One HSC instrument with two filters, two detectors and three visits.
pub fn populated_registry() -> Registry {
    let mut registry = Registry::memory().unwrap();
    seed(&mut registry);
    registry
}

/// Visit `v` starts at hour `v - 100` of 2024-01-01 UTC and lasts 30 minutes.
pub fn visit_timespan(visit: i64) -> Timespan {
    let hour = visit - 100;
    let begin = AstroTime::parse_literal(&format!("2024-01-01T{:02}:00:00/utc", hour)).unwrap();
    let end = AstroTime::parse_literal(&format!("2024-01-01T{:02}:30:00/utc", hour)).unwrap();
    Timespan::new(Some(begin), Some(end))
}

pub fn seed(registry: &mut Registry) {
    let universe = registry.universe().clone();
    let mut records = vec![
        DimensionRecord::builder("instrument")
            .key("instrument", "HSC")
            .field("visit_max", 1000)
            .build(&universe)
            .unwrap(),
        DimensionRecord::builder("band").key("band", "g").build(&universe).unwrap(),
        DimensionRecord::builder("band").key("band", "r").build(&universe).unwrap(),
        DimensionRecord::builder("day_obs")
            .key("instrument", "HSC")
            .key("day_obs", 20240101)
            .build(&universe)
            .unwrap(),
    ];
    for (filter, band) in [("HSC-G", "g"), ("HSC-R", "r")] {
        records.push(
            DimensionRecord::builder("physical_filter")
                .key("instrument", "HSC")
                .key("physical_filter", filter)
                .implied("band", band)
                .build(&universe)
                .unwrap(),
        );
    }
    for detector in DETECTORS {
        records.push(
            DimensionRecord::builder("detector")
                .key("instrument", "HSC")
                .key("detector", detector)
                .field("purpose", if detector == 1 { "SCIENCE" } else { "WAVEFRONT" })
                .build(&universe)
                .unwrap(),
        );
    }
    for visit in VISITS {
        let filter = if visit == 101 { "HSC-G" } else { "HSC-R" };
        records.push(
            DimensionRecord::builder("visit")
                .key("instrument", "HSC")
                .key("visit", visit)
                .implied("physical_filter", filter)
                .implied("day_obs", 20240101)
                .timespan(visit_timespan(visit))
                .build(&universe)
                .unwrap(),
        );
    }
    registry.insert_dimension_records(records).unwrap();
}

pub fn register(registry: &mut Registry, name: &str, dimensions: &[&str]) -> DatasetType {
    let group = DimensionGroup::new(registry.universe(), dimensions).unwrap();
    let dataset_type = DatasetType::new(name, group, "StructuredDataDict").unwrap();
    registry.register_dataset_type(&dataset_type).unwrap();
    dataset_type
}

pub fn visit_detector(registry: &Registry, visit: i64, detector: i64) -> DataCoordinate {
    registry
        .expand_data_id(
            [
                ("instrument", DataIdValue::from("HSC")),
                ("visit", DataIdValue::from(visit)),
                ("detector", DataIdValue::from(detector)),
            ],
            None,
        )
        .unwrap()
}

/// Insert `name` datasets for every visit and detector into `run`.
pub fn insert_all(registry: &mut Registry, name: &str, run: &str) -> Vec<DatasetRef> {
    registry.register_run(run).unwrap();
    let data_ids: Vec<DataCoordinate> = VISITS
        .iter()
        .flat_map(|v| DETECTORS.iter().map(move |d| (*v, *d)))
        .map(|(v, d)| visit_detector(registry, v, d))
        .collect();
    registry.insert_datasets(name, data_ids, run, None).unwrap()
}
