//! Pipelines and the quantum graphs generated from them.
//!
//! A [`Pipeline`] is an ordered set of [`TaskDef`]s connected by the dataset
//! types they read and write. [`GraphBuilder`] expands it over the registry
//! into a [`QuantumGraph`]: one [`Quantum`] per task execution, linked by the
//! datasets the quanta exchange. All maps are ordered so a graph built twice
//! from the same inputs serializes identically.

mod builder;

pub use builder::GraphBuilder;

use crate::datasets::{DatasetRef, RefContainer};
use crate::dimensions::{DataCoordinate, DimensionGroup, DimensionUniverse, SerializedDataId};
use crate::error::{ButlerError, Result};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// A named dataset-type slot of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    pub dataset_type: String,
}

impl Connection {
    pub fn new(name: impl Into<String>, dataset_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dataset_type: dataset_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDef {
    pub label: String,
    /// Dimensions of one quantum of this task.
    pub dimensions: Vec<String>,
    pub inputs: Vec<Connection>,
    pub outputs: Vec<Connection>,
}

impl TaskDef {
    pub fn new<I, S>(label: impl Into<String>, dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            dimensions: dimensions.into_iter().map(Into::into).collect(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, dataset_type: impl Into<String>) -> Self {
        self.inputs.push(Connection::new(name, dataset_type));
        self
    }

    pub fn output(mut self, name: impl Into<String>, dataset_type: impl Into<String>) -> Self {
        self.outputs.push(Connection::new(name, dataset_type));
        self
    }

    pub fn group(&self, universe: &Arc<DimensionUniverse>) -> Result<DimensionGroup> {
        DimensionGroup::new(universe, &self.dimensions)
    }
}

/// Ordered tasks. Labels are unique and every dataset type has at most one
/// producing task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    tasks: Vec<TaskDef>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: TaskDef) -> Result<()> {
        if self.task(&task.label).is_some() {
            return Err(ButlerError::Pipeline(format!("duplicate task label '{}'", task.label)));
        }
        let mut names = BTreeSet::new();
        for connection in task.inputs.iter().chain(&task.outputs) {
            if !names.insert(connection.name.as_str()) {
                return Err(ButlerError::Pipeline(format!(
                    "task '{}' has two connections named '{}'",
                    task.label, connection.name
                )));
            }
        }
        for output in &task.outputs {
            if let Some(producer) = self.producer(&output.dataset_type) {
                return Err(ButlerError::Pipeline(format!(
                    "dataset type '{}' is produced by both '{}' and '{}'",
                    output.dataset_type, producer.label, task.label
                )));
            }
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn with_task(mut self, task: TaskDef) -> Result<Self> {
        self.add_task(task)?;
        Ok(self)
    }

    pub fn tasks(&self) -> &[TaskDef] {
        &self.tasks
    }

    pub fn task(&self, label: &str) -> Option<&TaskDef> {
        self.tasks.iter().find(|t| t.label == label)
    }

    pub fn producer(&self, dataset_type: &str) -> Option<&TaskDef> {
        self.tasks
            .iter()
            .find(|t| t.outputs.iter().any(|c| c.dataset_type == dataset_type))
    }

    /// Dataset types consumed but never produced, in first-use order.
    pub fn overall_inputs(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.tasks
            .iter()
            .flat_map(|t| &t.inputs)
            .filter(|c| self.producer(&c.dataset_type).is_none())
            .filter(|c| seen.insert(c.dataset_type.clone()))
            .map(|c| c.dataset_type.clone())
            .collect()
    }

    /// Check the pipeline against `registry` and return task indices in an
    /// order where producers come before consumers.
    pub fn validate(&self, registry: &Registry) -> Result<Vec<usize>> {
        let universe = registry.universe();
        for task in &self.tasks {
            let group = task.group(universe)?;
            for connection in task.inputs.iter().chain(&task.outputs) {
                let dataset_type = registry.get_dataset_type(&connection.dataset_type)?;
                if task.outputs.contains(connection) && !dataset_type.dimensions().is_subset(&group) {
                    return Err(ButlerError::Pipeline(format!(
                        "output '{}' of task '{}' has dimensions {} outside the task's {}",
                        connection.name,
                        task.label,
                        dataset_type.dimensions(),
                        group
                    )));
                }
            }
        }

        let mut indegree = vec![0usize; self.tasks.len()];
        let mut edges: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (consumer, task) in self.tasks.iter().enumerate() {
            for input in &task.inputs {
                if let Some(producer) = self
                    .tasks
                    .iter()
                    .position(|t| t.outputs.iter().any(|c| c.dataset_type == input.dataset_type))
                    && edges.entry(producer).or_default().insert(consumer)
                {
                    indegree[consumer] += 1;
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..self.tasks.len()).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for next in edges.get(&i).into_iter().flatten() {
                indegree[*next] -= 1;
                if indegree[*next] == 0 {
                    ready.push_back(*next);
                }
            }
        }
        if order.len() != self.tasks.len() {
            let stuck: Vec<&str> = (0..self.tasks.len())
                .filter(|i| !order.contains(i))
                .map(|i| self.tasks[i].label.as_str())
                .collect();
            return Err(ButlerError::Pipeline(format!(
                "pipeline has a cycle through tasks {:?}",
                stuck
            )));
        }
        Ok(order)
    }
}

/// One execution of a task for one data ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantum {
    pub task: String,
    pub data_id: SerializedDataId,
    /// Connection name to dataset IDs.
    pub inputs: BTreeMap<String, Vec<Uuid>>,
    pub outputs: BTreeMap<String, Vec<Uuid>>,
}

impl Quantum {
    pub fn data_id(&self, universe: &Arc<DimensionUniverse>) -> Result<DataCoordinate> {
        DataCoordinate::from_simple(universe, &self.data_id, None)
    }

    pub fn input_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.inputs.values().flatten()
    }

    pub fn output_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.outputs.values().flatten()
    }
}

/// Quanta in build order, plus every dataset they read or write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantumGraph {
    tasks: Vec<TaskDef>,
    quanta: Vec<Quantum>,
    datasets: RefContainer,
    output_run: String,
    input_collections: Vec<String>,
}

impl QuantumGraph {
    pub(crate) fn new(
        tasks: Vec<TaskDef>,
        quanta: Vec<Quantum>,
        refs: &[DatasetRef],
        output_run: String,
        input_collections: Vec<String>,
    ) -> Result<Self> {
        Ok(Self {
            tasks,
            quanta,
            datasets: RefContainer::from_refs(refs)?,
            output_run,
            input_collections,
        })
    }

    pub fn len(&self) -> usize {
        self.quanta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quanta.is_empty()
    }

    /// Tasks that have at least one quantum, in pipeline order.
    pub fn tasks(&self) -> &[TaskDef] {
        &self.tasks
    }

    pub fn quanta(&self) -> &[Quantum] {
        &self.quanta
    }

    pub fn quantum(&self, index: usize) -> Option<&Quantum> {
        self.quanta.get(index)
    }

    pub fn output_run(&self) -> &str {
        &self.output_run
    }

    pub fn input_collections(&self) -> &[String] {
        &self.input_collections
    }

    /// Indices of the quanta of `label`.
    pub fn quanta_for_task(&self, label: &str) -> Vec<usize> {
        self.quanta
            .iter()
            .enumerate()
            .filter(|(_, q)| q.task == label)
            .map(|(i, _)| i)
            .collect()
    }

    /// Every dataset ID read by quantum `index`.
    pub fn inputs_of(&self, index: usize) -> Vec<Uuid> {
        self.quanta
            .get(index)
            .map(|q| q.input_ids().copied().collect())
            .unwrap_or_default()
    }

    fn producers(&self) -> BTreeMap<Uuid, usize> {
        self.quanta
            .iter()
            .enumerate()
            .flat_map(|(i, q)| q.output_ids().map(move |id| (*id, i)))
            .collect()
    }

    /// Quanta producing an input of quantum `index`.
    pub fn predecessors(&self, index: usize) -> Vec<usize> {
        let producers = self.producers();
        let found: BTreeSet<usize> = self
            .inputs_of(index)
            .iter()
            .filter_map(|id| producers.get(id).copied())
            .collect();
        found.into_iter().collect()
    }

    /// Quanta reading an output of quantum `index`.
    pub fn successors(&self, index: usize) -> Vec<usize> {
        let Some(quantum) = self.quanta.get(index) else {
            return Vec::new();
        };
        let outputs: BTreeSet<&Uuid> = quantum.output_ids().collect();
        self.quanta
            .iter()
            .enumerate()
            .filter(|(_, q)| q.input_ids().any(|id| outputs.contains(id)))
            .map(|(i, _)| i)
            .collect()
    }

    /// Quantum indices with every quantum after all of its predecessors.
    pub fn topological_order(&self) -> Vec<usize> {
        let producers = self.producers();
        let mut indegree = vec![0usize; self.quanta.len()];
        let mut edges: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (i, quantum) in self.quanta.iter().enumerate() {
            for id in quantum.input_ids() {
                if let Some(&p) = producers.get(id)
                    && edges.entry(p).or_default().insert(i)
                {
                    indegree[i] += 1;
                }
            }
        }
        let mut ready: BTreeSet<usize> = (0..self.quanta.len()).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(self.quanta.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for next in edges.get(&i).into_iter().flatten() {
                indegree[*next] -= 1;
                if indegree[*next] == 0 {
                    ready.insert(*next);
                }
            }
        }
        order
    }

    /// Dataset IDs read by some quantum and produced by none.
    pub fn overall_inputs(&self) -> BTreeSet<Uuid> {
        let producers = self.producers();
        self.quanta
            .iter()
            .flat_map(Quantum::input_ids)
            .filter(|id| !producers.contains_key(id))
            .copied()
            .collect()
    }

    /// All refs of the graph rebuilt against `universe`.
    pub fn refs(&self, universe: &Arc<DimensionUniverse>) -> Result<Vec<DatasetRef>> {
        self.datasets.to_refs(universe)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
