use butlerdb::{
    DataIdValue, DatasetType, DimensionGroup, DimensionRecord, GraphBuilder, Mdc, Pipeline,
    Placement, Registry, TaskDef,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("=== butlerdb - Quantum Graph ===\n");

    let mut registry = Registry::memory()?;
    let universe = registry.universe().clone();

    let mut records = vec![
        DimensionRecord::builder("instrument").key("instrument", "LATISS").build(&universe)?,
        DimensionRecord::builder("band").key("band", "g").build(&universe)?,
        DimensionRecord::builder("physical_filter")
            .key("instrument", "LATISS")
            .key("physical_filter", "SDSSg")
            .implied("band", "g")
            .build(&universe)?,
        DimensionRecord::builder("day_obs")
            .key("instrument", "LATISS")
            .key("day_obs", 20240401)
            .build(&universe)?,
        DimensionRecord::builder("detector")
            .key("instrument", "LATISS")
            .key("detector", 0)
            .build(&universe)?,
    ];
    for exposure in 1..=3 {
        records.push(
            DimensionRecord::builder("exposure")
                .key("instrument", "LATISS")
                .key("exposure", exposure)
                .implied("physical_filter", "SDSSg")
                .implied("day_obs", 20240401)
                .build(&universe)?,
        );
    }
    registry.insert_dimension_records(records)?;

    for (name, dimensions) in [
        ("raw", vec!["exposure", "detector"]),
        ("bias", vec!["instrument", "detector"]),
        ("post_isr", vec!["exposure", "detector"]),
        ("night_stats", vec!["day_obs"]),
    ] {
        let group = DimensionGroup::new(&universe, dimensions)?;
        registry.register_dataset_type(&DatasetType::new(name, group, "StructuredDataDict")?)?;
    }

    registry.register_run("LATISS/raw/all")?;
    registry.register_run("LATISS/calib")?;
    let raws = (1..=3)
        .map(|exposure| {
            registry.expand_data_id(
                [
                    ("instrument", DataIdValue::from("LATISS")),
                    ("exposure", DataIdValue::from(exposure)),
                    ("detector", DataIdValue::from(0)),
                ],
                None,
            )
        })
        .collect::<butlerdb::Result<Vec<_>>>()?;
    registry.insert_datasets("raw", raws, "LATISS/raw/all", None)?;
    let bias = registry.expand_data_id(
        [("instrument", DataIdValue::from("LATISS")), ("detector", DataIdValue::from(0))],
        None,
    )?;
    registry.insert_datasets("bias", [bias], "LATISS/calib", None)?;
    println!("✓ Registered 3 raws and 1 bias\n");

    let pipeline = Pipeline::new()
        .with_task(
            TaskDef::new("isr", ["exposure", "detector"])
                .input("ccd_exposure", "raw")
                .input("bias", "bias")
                .output("output_exposure", "post_isr"),
        )?
        .with_task(
            TaskDef::new("nightly", ["day_obs"])
                .input("exposures", "post_isr")
                .output("stats", "night_stats"),
        )?;

    let _run = Mdc::scoped([("RUN", "u/demo/run1")]);
    let graph = GraphBuilder::new(&registry, &pipeline)
        .input_collections(["LATISS/calib", "LATISS/raw/all"])
        .output_run("u/demo/run1")
        .where_clause("instrument = 'LATISS' AND exposure > 1")
        .placement(Placement::Pushdown)
        .build()?;

    println!("Quanta: {}", graph.len());
    for index in graph.topological_order() {
        let quantum = graph.quantum(index).ok_or("missing quantum")?;
        println!(
            "   [{}] {} {:?} <- {} inputs, after {:?}",
            index,
            quantum.task,
            quantum.data_id,
            quantum.input_ids().count(),
            graph.predecessors(index)
        );
    }
    println!("\nOverall inputs: {}", graph.overall_inputs().len());
    println!("Serialized size: {} bytes", graph.to_json()?.len());

    println!("\n=== Done ===");
    Ok(())
}
