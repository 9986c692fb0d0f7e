//! Expansion of a pipeline over the registry.

use super::{Pipeline, Quantum, QuantumGraph, TaskDef};
use crate::datasets::{DatasetIdGen, DatasetRef, DatasetType};
use crate::dimensions::{DataCoordinate, DataIdValue, DimensionGroup, DimensionUniverse};
use crate::error::{ButlerError, Result};
use crate::expr::BindValue;
use crate::query::{Placement, Query, QueryArgs, QueryBuilder, row_dataset_id, row_values};
use crate::registry::Registry;
use crate::relation::{ColumnTag, DatasetField};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Dimension values and overall-input dataset IDs of one query row.
struct GraphRow {
    values: BTreeMap<String, DataIdValue>,
    inputs: BTreeMap<String, Uuid>,
}

/// Builds a [`QuantumGraph`] from one query over the graph's dimensions.
///
/// The query joins every overall input as a find-first search of the input
/// collections, so each row names the data ID of every task plus the input
/// datasets available for it. Quanta are formed by grouping rows on each
/// task's dimensions.
pub struct GraphBuilder<'a> {
    registry: &'a Registry,
    pipeline: &'a Pipeline,
    args: QueryArgs,
    input_collections: Vec<String>,
    output_run: Option<String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a Registry, pipeline: &'a Pipeline) -> Self {
        Self {
            registry,
            pipeline,
            args: QueryArgs::new(),
            input_collections: Vec::new(),
            output_run: None,
        }
    }

    pub fn input_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_collections = collections.into_iter().map(Into::into).collect();
        self
    }

    /// RUN that predicted outputs are written to; the configured
    /// `default_run` otherwise.
    pub fn output_run(mut self, run: impl Into<String>) -> Self {
        self.output_run = Some(run.into());
        self
    }

    pub fn where_clause(mut self, expression: impl Into<String>) -> Self {
        self.args = self.args.where_clause(expression);
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<BindValue>) -> Self {
        self.args = self.args.bind(name, value);
        self
    }

    pub fn data_id(mut self, data_id: &DataCoordinate) -> Self {
        self.args = self.args.data_id(data_id);
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.args = self.args.placement(placement);
        self
    }

    fn universe(&self) -> &Arc<DimensionUniverse> {
        self.registry.universe()
    }

    /// Union of every task's dimensions and every connected dataset type's.
    pub fn graph_dimensions(&self) -> Result<DimensionGroup> {
        let universe = self.universe();
        let mut dimensions = DimensionGroup::empty(universe);
        for task in self.pipeline.tasks() {
            dimensions = dimensions.union(&task.group(universe)?)?;
            for connection in task.inputs.iter().chain(&task.outputs) {
                let dataset_type = self.registry.get_dataset_type(&connection.dataset_type)?;
                dimensions = dimensions.union(dataset_type.dimensions())?;
            }
        }
        Ok(dimensions)
    }

    fn overall_inputs(&self) -> Result<Vec<DatasetType>> {
        self.pipeline
            .overall_inputs()
            .iter()
            .map(|name| self.registry.get_dataset_type(name))
            .collect()
    }

    /// The query whose rows seed the graph.
    pub fn query(&self) -> Result<Query> {
        let dimensions = self.graph_dimensions()?;
        let inputs = self.overall_inputs()?;

        let mut args = self.args.clone();
        args.datasets = inputs.iter().map(|d| d.name().to_string()).collect();
        args.find_first = true;
        args.collections = if self.input_collections.is_empty() {
            None
        } else {
            Some(self.input_collections.clone())
        };

        let summary = self.registry.inner.summarize(dimensions.clone(), &args, None)?;
        let mut output: Vec<ColumnTag> = dimensions.names().iter().map(|d| ColumnTag::key(d.as_str())).collect();
        output.extend(
            inputs
                .iter()
                .map(|d| ColumnTag::dataset(d.name(), DatasetField::DatasetId)),
        );
        log::debug!(
            "Planning quantum graph over {} with {} overall inputs",
            dimensions,
            inputs.len()
        );
        QueryBuilder::new(&summary).build(output, args.placement)
    }

    pub fn build(&self) -> Result<QuantumGraph> {
        let order = self.pipeline.validate(self.registry)?;
        let run = self
            .output_run
            .clone()
            .or_else(|| self.registry.config().default_run.clone())
            .ok_or_else(|| ButlerError::Pipeline("no output run given".to_string()))?;

        let inputs = self.overall_inputs()?;
        let rows: Vec<GraphRow> = self
            .query()?
            .execute(&self.registry.inner)?
            .iter()
            .map(|row| -> Result<GraphRow> {
                let inputs = inputs
                    .iter()
                    .map(|d| -> Result<(String, Uuid)> {
                        Ok((d.name().to_string(), row_dataset_id(row, d.name())?))
                    })
                    .collect::<Result<_>>()?;
                Ok(GraphRow {
                    values: row_values(row),
                    inputs,
                })
            })
            .collect::<Result<_>>()?;

        let mut existing: BTreeMap<Uuid, DatasetRef> = BTreeMap::new();
        let mut predicted: BTreeMap<(String, DataCoordinate), DatasetRef> = BTreeMap::new();
        let mut quanta = Vec::new();
        let mut tasks = Vec::new();
        let mut pruned = 0usize;

        for index in order {
            let task = &self.pipeline.tasks()[index];
            let built = self.task_quanta(task, &rows, &run, &mut existing, &mut predicted)?;
            pruned += built.pruned;
            if !built.quanta.is_empty() {
                tasks.push(task.clone());
                quanta.extend(built.quanta);
            }
        }

        let used: BTreeSet<Uuid> = quanta
            .iter()
            .flat_map(|q: &Quantum| q.input_ids().chain(q.output_ids()).copied())
            .collect();
        let refs: Vec<DatasetRef> = existing
            .into_values()
            .chain(predicted.into_values())
            .filter(|r| used.contains(&r.id()))
            .collect();

        log::info!(
            "Built quantum graph with {} quanta for {} tasks ({} quanta pruned)",
            quanta.len(),
            tasks.len(),
            pruned
        );
        QuantumGraph::new(tasks, quanta, &refs, run, self.input_collections.clone())
    }

    fn task_quanta(
        &self,
        task: &TaskDef,
        rows: &[GraphRow],
        run: &str,
        existing: &mut BTreeMap<Uuid, DatasetRef>,
        predicted: &mut BTreeMap<(String, DataCoordinate), DatasetRef>,
    ) -> Result<TaskQuanta> {
        let universe = self.universe();
        let group = task.group(universe)?;
        let mut by_data_id: BTreeMap<DataCoordinate, Vec<&GraphRow>> = BTreeMap::new();
        for row in rows {
            by_data_id
                .entry(data_id_from(universe, &group, &row.values)?)
                .or_default()
                .push(row);
        }

        let inputs: Vec<DatasetType> = task
            .inputs
            .iter()
            .map(|c| self.registry.get_dataset_type(&c.dataset_type))
            .collect::<Result<_>>()?;
        let outputs: Vec<DatasetType> = task
            .outputs
            .iter()
            .map(|c| self.registry.get_dataset_type(&c.dataset_type))
            .collect::<Result<_>>()?;

        let mut built = TaskQuanta::default();
        'quanta: for (data_id, rows) in by_data_id {
            let mut quantum_inputs = BTreeMap::new();
            for (connection, dataset_type) in task.inputs.iter().zip(&inputs) {
                let mut ids = BTreeSet::new();
                for row in &rows {
                    if let Some(id) = row.inputs.get(dataset_type.name()) {
                        if !existing.contains_key(id) {
                            existing.insert(*id, self.registry.inner.dataset_ref(*id)?);
                        }
                        ids.insert(*id);
                    } else {
                        let key = (
                            dataset_type.name().to_string(),
                            data_id_from(universe, dataset_type.dimensions(), &row.values)?,
                        );
                        if let Some(upstream) = predicted.get(&key) {
                            ids.insert(upstream.id());
                        }
                    }
                }
                if ids.is_empty() {
                    log::debug!(
                        "Pruning {} quantum {}: no '{}' inputs",
                        task.label,
                        data_id,
                        connection.name
                    );
                    built.pruned += 1;
                    continue 'quanta;
                }
                quantum_inputs.insert(connection.name.clone(), ids.into_iter().collect());
            }

            let mut quantum_outputs = BTreeMap::new();
            for (connection, dataset_type) in task.outputs.iter().zip(&outputs) {
                let mut ids = BTreeSet::new();
                for row in &rows {
                    let output_id = data_id_from(universe, dataset_type.dimensions(), &row.values)?;
                    let key = (dataset_type.name().to_string(), output_id.clone());
                    if let Some(known) = predicted.get(&key) {
                        ids.insert(known.id());
                        continue;
                    }
                    let dataset_ref =
                        DatasetRef::generate(dataset_type.clone(), output_id, run, DatasetIdGen::DataIdTypeRun)?;
                    if self.registry.get_dataset(dataset_ref.id())?.is_some() {
                        return Err(ButlerError::Pipeline(format!(
                            "output {} already exists in run '{}'",
                            dataset_ref, run
                        )));
                    }
                    ids.insert(dataset_ref.id());
                    predicted.insert(key, dataset_ref);
                }
                quantum_outputs.insert(connection.name.clone(), ids.into_iter().collect());
            }

            built.quanta.push(Quantum {
                task: task.label.clone(),
                data_id: data_id.to_simple(),
                inputs: quantum_inputs,
                outputs: quantum_outputs,
            });
        }
        Ok(built)
    }
}

#[derive(Default)]
struct TaskQuanta {
    quanta: Vec<Quantum>,
    pruned: usize,
}

fn data_id_from(
    universe: &Arc<DimensionUniverse>,
    group: &DimensionGroup,
    values: &BTreeMap<String, DataIdValue>,
) -> Result<DataCoordinate> {
    DataCoordinate::standardize(
        universe,
        values
            .iter()
            .filter(|(name, _)| group.contains(name))
            .map(|(name, value)| (name.clone(), value.clone())),
        Some(group),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::DimensionRecord;
    use crate::graph::TaskDef;

    fn registry() -> Registry {
        let mut registry = Registry::memory().unwrap();
        let universe = registry.universe().clone();
        let mut records = vec![
            DimensionRecord::builder("instrument")
                .key("instrument", "HSC")
                .build(&universe)
                .unwrap(),
            DimensionRecord::builder("band").key("band", "r").build(&universe).unwrap(),
            DimensionRecord::builder("physical_filter")
                .key("instrument", "HSC")
                .key("physical_filter", "HSC-R")
                .implied("band", "r")
                .build(&universe)
                .unwrap(),
            DimensionRecord::builder("day_obs")
                .key("instrument", "HSC")
                .key("day_obs", 20240101)
                .build(&universe)
                .unwrap(),
        ];
        for detector in [1, 2] {
            records.push(
                DimensionRecord::builder("detector")
                    .key("instrument", "HSC")
                    .key("detector", detector)
                    .build(&universe)
                    .unwrap(),
            );
        }
        for visit in [10, 11] {
            records.push(
                DimensionRecord::builder("visit")
                    .key("instrument", "HSC")
                    .key("visit", visit)
                    .implied("physical_filter", "HSC-R")
                    .implied("day_obs", 20240101)
                    .build(&universe)
                    .unwrap(),
            );
        }
        registry.insert_dimension_records(records).unwrap();

        for (name, dims) in [
            ("input", vec!["visit", "detector"]),
            ("calexp", vec!["visit", "detector"]),
            ("summary", vec!["visit"]),
        ] {
            let group = DimensionGroup::new(&universe, dims).unwrap();
            registry
                .register_dataset_type(&DatasetType::new(name, group, "StructuredDataDict").unwrap())
                .unwrap();
        }
        registry.register_run("in").unwrap();
        registry
    }

    fn insert_inputs(registry: &mut Registry, pairs: &[(i64, i64)]) {
        let data_ids: Vec<DataCoordinate> = pairs
            .iter()
            .map(|(visit, detector)| {
                registry
                    .expand_data_id(
                        [
                            ("instrument", DataIdValue::from("HSC")),
                            ("visit", DataIdValue::from(*visit)),
                            ("detector", DataIdValue::from(*detector)),
                        ],
                        None,
                    )
                    .unwrap()
            })
            .collect();
        registry.insert_datasets("input", data_ids, "in", None).unwrap();
    }

    fn pipeline() -> Pipeline {
        Pipeline::new()
            .with_task(
                TaskDef::new("calibrate", ["visit", "detector"])
                    .input("input", "input")
                    .output("calexp", "calexp"),
            )
            .unwrap()
            .with_task(
                TaskDef::new("summarize", ["visit"])
                    .input("calexps", "calexp")
                    .output("summary", "summary"),
            )
            .unwrap()
    }

    #[test]
    fn test_graph_links_tasks() {
        let mut registry = registry();
        insert_inputs(&mut registry, &[(10, 1), (10, 2), (11, 1)]);
        let pipeline = pipeline();
        let graph = GraphBuilder::new(&registry, &pipeline)
            .input_collections(["in"])
            .output_run("out")
            .build()
            .unwrap();

        assert_eq!(graph.quanta_for_task("calibrate").len(), 3);
        let summarize = graph.quanta_for_task("summarize");
        assert_eq!(summarize.len(), 2);

        let visit10 = summarize
            .iter()
            .copied()
            .find(|i| graph.quantum(*i).unwrap().data_id["visit"] == DataIdValue::from(10))
            .unwrap();
        assert_eq!(graph.inputs_of(visit10).len(), 2);
        assert_eq!(graph.predecessors(visit10).len(), 2);
        for p in graph.predecessors(visit10) {
            assert!(graph.successors(p).contains(&visit10));
        }

        let order = graph.topological_order();
        assert_eq!(order.len(), graph.len());
        let position = |i: usize| order.iter().position(|o| *o == i).unwrap();
        for i in 0..graph.len() {
            for p in graph.predecessors(i) {
                assert!(position(p) < position(i));
            }
        }
        assert_eq!(graph.overall_inputs().len(), 3);
    }

    #[test]
    fn test_outputs_use_deterministic_ids() {
        let mut registry = registry();
        insert_inputs(&mut registry, &[(10, 1)]);
        let pipeline = pipeline();
        let build = || {
            GraphBuilder::new(&registry, &pipeline)
                .input_collections(["in"])
                .output_run("out")
                .build()
                .unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_where_clause_restricts_quanta() {
        let mut registry = registry();
        insert_inputs(&mut registry, &[(10, 1), (10, 2), (11, 1)]);
        let pipeline = pipeline();
        let graph = GraphBuilder::new(&registry, &pipeline)
            .input_collections(["in"])
            .output_run("out")
            .where_clause("instrument = 'HSC' AND detector = d")
            .bind("d", 2i64)
            .build()
            .unwrap();
        assert_eq!(graph.quanta_for_task("calibrate").len(), 1);
        assert_eq!(graph.quanta_for_task("summarize").len(), 1);
    }

    #[test]
    fn test_missing_run_is_an_error() {
        let registry = registry();
        let pipeline = pipeline();
        assert!(matches!(
            GraphBuilder::new(&registry, &pipeline)
                .input_collections(["in"])
                .build(),
            Err(ButlerError::Pipeline(_))
        ));
    }

    #[test]
    fn test_no_inputs_gives_empty_graph() {
        let registry = registry();
        let pipeline = pipeline();
        let graph = GraphBuilder::new(&registry, &pipeline)
            .input_collections(["in"])
            .output_run("out")
            .build()
            .unwrap();
        assert!(graph.is_empty());
        assert!(graph.tasks().is_empty());
    }
}
