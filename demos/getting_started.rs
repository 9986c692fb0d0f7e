use butlerdb::{
    Butler, CollectionType, Config, DataIdValue, DatasetType, DimensionGroup, DimensionRecord,
    QueryArgs, Timespan,
};
use geo::polygon;
use std::collections::BTreeMap;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    println!("=== butlerdb - Getting Started ===\n");

    let dir = tempfile::tempdir()?;
    let root = dir.path();
    let mut butler = Butler::memory(root, Config::default().with_default_run("HSC/runs/demo"))?;
    let universe = butler.registry().universe().clone();
    println!("✓ Created butler with datastore at {}\n", root.display());

    // === 1. DIMENSION RECORDS ===
    println!("1. Dimension Records");
    println!("--------------------");

    let mut records = vec![
        DimensionRecord::builder("instrument")
            .key("instrument", "HSC")
            .field("class_name", "lsst.obs.subaru.HyperSuprimeCam")
            .build(&universe)?,
        DimensionRecord::builder("band").key("band", "r").build(&universe)?,
        DimensionRecord::builder("physical_filter")
            .key("instrument", "HSC")
            .key("physical_filter", "HSC-R")
            .implied("band", "r")
            .build(&universe)?,
        DimensionRecord::builder("day_obs")
            .key("instrument", "HSC")
            .key("day_obs", 20240315)
            .build(&universe)?,
    ];
    for detector in 0..4 {
        records.push(
            DimensionRecord::builder("detector")
                .key("instrument", "HSC")
                .key("detector", detector)
                .field("full_name", format!("1_{:02}", detector))
                .build(&universe)?,
        );
    }
    for (visit, ra) in [(903334, 10.0), (903336, 10.5)] {
        let begin = butlerdb::AstroTime::parse_literal(&format!("2024-03-15T0{}:00:00/utc", visit % 10))?;
        let end = butlerdb::AstroTime::parse_literal(&format!("2024-03-15T0{}:05:00/utc", visit % 10))?;
        records.push(
            DimensionRecord::builder("visit")
                .key("instrument", "HSC")
                .key("visit", visit)
                .implied("physical_filter", "HSC-R")
                .implied("day_obs", 20240315)
                .timespan(Timespan::new(Some(begin), Some(end)))
                .region(polygon![
                    (x: ra, y: -1.0),
                    (x: ra + 1.0, y: -1.0),
                    (x: ra + 1.0, y: 1.0),
                    (x: ra, y: 1.0),
                ])
                .build(&universe)?,
        );
    }
    butler.registry_mut().insert_dimension_records(records)?;
    println!("   Inserted {} records\n", butler.registry().stats().dimension_records);

    // === 2. DATASETS ===
    println!("2. Putting Datasets");
    println!("-------------------");

    let group = DimensionGroup::new(&universe, ["visit", "detector"])?;
    butler
        .registry_mut()
        .register_dataset_type(&DatasetType::new("calexp_summary", group, "StructuredDataDict")?)?;

    for visit in [903334, 903336] {
        for detector in 0..4 {
            let data_id = butler.registry().expand_data_id(
                [
                    ("instrument", DataIdValue::from("HSC")),
                    ("visit", DataIdValue::from(visit)),
                    ("detector", DataIdValue::from(detector)),
                ],
                None,
            )?;
            let summary = BTreeMap::from([("psf_fwhm", 0.6 + detector as f64 * 0.05)]);
            butler.put(&summary, "calexp_summary", &data_id, None)?;
        }
    }
    println!("   Stored {} artifacts\n", butler.datastore().len());

    // === 3. COLLECTIONS ===
    println!("3. Collections");
    println!("--------------");

    let registry = butler.registry_mut();
    registry.register_collection("HSC/defaults", CollectionType::Chained)?;
    registry.set_collection_chain("HSC/defaults", &["HSC/runs/demo"])?;
    println!("   HSC/defaults -> {:?}\n", registry.get_collection_chain("HSC/defaults")?);

    // === 4. QUERIES ===
    println!("4. Queries");
    println!("----------");

    let registry = butler.registry();
    let query = registry.query_data_ids(
        &["visit", "detector"],
        QueryArgs::new()
            .where_clause("instrument = 'HSC' AND detector IN (0, 1) AND band = b")
            .bind("b", "r"),
    )?;
    println!("   SQL: {}", query.sql()?);
    for data_id in query.to_vec()? {
        println!("   {}", data_id);
    }

    let over_region = registry
        .query_data_ids(
            &["visit"],
            QueryArgs::new()
                .where_clause("instrument = 'HSC'")
                .region(polygon![
                    (x: 10.6, y: 0.0),
                    (x: 10.8, y: 0.0),
                    (x: 10.8, y: 0.2),
                    (x: 10.6, y: 0.2),
                ]),
        )?
        .to_vec()?;
    println!("   Visits overlapping region: {}", over_region.len());

    let refs = registry
        .query_datasets(
            "calexp_summary",
            QueryArgs::new()
                .collections(["HSC/defaults"])
                .where_clause("instrument = 'HSC' AND visit.timespan OVERLAPS T'2024-03-15T04:02:00/utc'"),
        )?
        .to_vec()?;
    println!("   Datasets during 04:02 UTC: {}", refs.len());

    if let Some(first) = refs.first() {
        let summary: BTreeMap<String, f64> = butler.get_by_ref(first)?;
        println!("   {} -> {:?}\n", first, summary);
    }

    println!("=== Done ===");
    Ok(())
}
