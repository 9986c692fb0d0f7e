//! Dataset types, dataset references and dataset ID generation.

use crate::dimensions::{
    DataCoordinate, DataIdValue, DimensionGroup, DimensionUniverse, SerializedDataId,
};
use crate::error::{ButlerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

/// Namespace for deterministic (UUID5) dataset IDs.
pub const DATASET_ID_NAMESPACE: Uuid = Uuid::from_u128(0x840b31d9_05cd_5161_b2c8_00d32b280d0f);

/// Name of the in-memory type a dataset is read and written as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageClass(String);

impl StorageClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorageClass {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Serializable form of a [`DatasetType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedDatasetType {
    pub name: String,
    pub dimensions: Vec<String>,
    pub storage_class: String,
}

/// A named kind of dataset with fixed dimensions and storage class.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DatasetType {
    name: String,
    dimensions: DimensionGroup,
    storage_class: StorageClass,
}

impl DatasetType {
    pub fn new(
        name: impl Into<String>,
        dimensions: DimensionGroup,
        storage_class: impl Into<StorageClass>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            dimensions,
            storage_class: storage_class.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> &DimensionGroup {
        &self.dimensions
    }

    pub fn storage_class(&self) -> &StorageClass {
        &self.storage_class
    }

    pub fn is_component(&self) -> bool {
        self.name.contains('.')
    }

    /// Name with any component suffix removed.
    pub fn parent_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    pub fn component(&self) -> Option<&str> {
        self.name.split_once('.').map(|(_, c)| c)
    }

    pub fn to_simple(&self) -> SerializedDatasetType {
        SerializedDatasetType {
            name: self.name.clone(),
            dimensions: self.dimensions.names().to_vec(),
            storage_class: self.storage_class.name().to_string(),
        }
    }

    pub fn from_simple(
        universe: &Arc<DimensionUniverse>,
        simple: &SerializedDatasetType,
    ) -> Result<Self> {
        let dimensions = DimensionGroup::new(universe, &simple.dimensions)?;
        Self::new(
            simple.name.clone(),
            dimensions,
            StorageClass::new(simple.storage_class.clone()),
        )
    }
}

impl fmt::Debug for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DatasetType({:?}, {}, {})",
            self.name, self.dimensions, self.storage_class
        )
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid_segment = |s: &str| {
        let mut chars = s.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if name.split('.').all(valid_segment) {
        Ok(())
    } else {
        Err(ButlerError::InvalidDatasetTypeName(name.to_string()))
    }
}

/// How dataset IDs are generated on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetIdGen {
    /// Random UUID4.
    #[default]
    Unique,
    /// UUID5 over dataset type and data ID.
    DataIdType,
    /// UUID5 over dataset type, data ID and run.
    DataIdTypeRun,
}

impl DatasetIdGen {
    pub fn generate(&self, dataset_type: &DatasetType, data_id: &DataCoordinate, run: &str) -> Uuid {
        if *self == DatasetIdGen::Unique {
            return Uuid::new_v4();
        }
        let mut items = vec![format!("dataset_type={}", dataset_type.name())];
        for name in data_id.group().required() {
            if let Some(value) = data_id.value(name) {
                let raw = match value {
                    DataIdValue::Int(v) => v.to_string(),
                    DataIdValue::Str(v) => v.clone(),
                };
                items.push(format!("{}={}", name, raw));
            }
        }
        items[1..].sort();
        if *self == DatasetIdGen::DataIdTypeRun {
            items.push(format!("run={}", run));
        }
        Uuid::new_v5(&DATASET_ID_NAMESPACE, items.join(",").as_bytes())
    }
}

/// A resolved reference to one dataset.
#[derive(Clone)]
pub struct DatasetRef {
    id: Uuid,
    dataset_type: DatasetType,
    data_id: DataCoordinate,
    run: String,
}

impl DatasetRef {
    pub fn new(
        dataset_type: DatasetType,
        data_id: DataCoordinate,
        run: impl Into<String>,
        id: Uuid,
    ) -> Result<Self> {
        if data_id.group() != dataset_type.dimensions() {
            return Err(ButlerError::InvalidDataId(format!(
                "data ID {} does not match dimensions {} of '{}'",
                data_id,
                dataset_type.dimensions(),
                dataset_type.name()
            )));
        }
        Ok(Self {
            id,
            dataset_type,
            data_id,
            run: run.into(),
        })
    }

    /// Build a ref with an ID produced by `id_gen`.
    pub fn generate(
        dataset_type: DatasetType,
        data_id: DataCoordinate,
        run: impl Into<String>,
        id_gen: DatasetIdGen,
    ) -> Result<Self> {
        let run = run.into();
        let id = id_gen.generate(&dataset_type, &data_id, &run);
        Self::new(dataset_type, data_id, run, id)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dataset_type(&self) -> &DatasetType {
        &self.dataset_type
    }

    pub fn data_id(&self) -> &DataCoordinate {
        &self.data_id
    }

    pub fn run(&self) -> &str {
        &self.run
    }

}

impl PartialEq for DatasetRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.run == other.run
            && self.dataset_type == other.dataset_type
            && self.data_id == other.data_id
    }
}

impl Eq for DatasetRef {}

impl Hash for DatasetRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for DatasetRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DatasetRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dataset_type
            .name()
            .cmp(other.dataset_type.name())
            .then_with(|| self.data_id.cmp(&other.data_id))
            .then_with(|| self.run.cmp(&other.run))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DatasetRef({}, {}, run={:?}, id={})",
            self.dataset_type.name(),
            self.data_id,
            self.run,
            self.id
        )
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} [{}]", self.dataset_type.name(), self.data_id, self.run)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CompactRef {
    dataset_type: String,
    run: String,
    data_id: SerializedDataId,
}

/// Compact serializable set of dataset refs.
///
/// Dataset type definitions are stored once; refs carry only the type name,
/// run and required data ID values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RefContainer {
    universe_namespace: String,
    universe_version: u32,
    dataset_types: BTreeMap<String, SerializedDatasetType>,
    refs: BTreeMap<Uuid, CompactRef>,
}

impl RefContainer {
    pub fn from_refs<'a, I>(refs: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a DatasetRef>,
    {
        let mut container = RefContainer::default();
        for dataset_ref in refs {
            if container.refs.is_empty() {
                let universe = dataset_ref.data_id().universe();
                container.universe_namespace = universe.namespace().to_string();
                container.universe_version = universe.version();
            }
            let simple = dataset_ref.dataset_type().to_simple();
            match container.dataset_types.get(&simple.name) {
                Some(existing) if *existing != simple => {
                    return Err(ButlerError::ConflictingDatasetType {
                        name: simple.name,
                        reason: "refs disagree on the definition".to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    container
                        .dataset_types
                        .insert(simple.name.clone(), simple);
                }
            }
            let data_id = dataset_ref.data_id();
            container.refs.insert(
                dataset_ref.id(),
                CompactRef {
                    dataset_type: dataset_ref.dataset_type().name().to_string(),
                    run: dataset_ref.run().to_string(),
                    data_id: data_id
                        .group()
                        .required()
                        .iter()
                        .filter_map(|n| data_id.value(n).map(|v| (n.clone(), v.clone())))
                        .collect(),
                },
            );
        }
        Ok(container)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &Uuid> {
        self.refs.keys()
    }

    pub fn dataset_type_names(&self) -> impl Iterator<Item = &str> {
        self.dataset_types.keys().map(String::as_str)
    }

    /// Rebuild the refs against `universe`.
    pub fn to_refs(&self, universe: &Arc<DimensionUniverse>) -> Result<Vec<DatasetRef>> {
        if self.refs.is_empty() {
            return Ok(Vec::new());
        }
        if self.universe_namespace != universe.namespace() {
            return Err(ButlerError::InvalidUniverse(format!(
                "refs were written for universe namespace '{}' but this repository uses '{}'",
                self.universe_namespace,
                universe.namespace()
            )));
        }
        if self.universe_version != universe.version() {
            log::warn!(
                "Reading refs written with universe version {} into version {}",
                self.universe_version,
                universe.version()
            );
        }

        let mut types: BTreeMap<&str, DatasetType> = BTreeMap::new();
        for (name, simple) in &self.dataset_types {
            types.insert(name, DatasetType::from_simple(universe, simple)?);
        }

        self.refs
            .iter()
            .map(|(id, compact)| {
                let dataset_type = types
                    .get(compact.dataset_type.as_str())
                    .cloned()
                    .ok_or_else(|| ButlerError::MissingDatasetType(compact.dataset_type.clone()))?;
                let data_id = DataCoordinate::from_simple(
                    universe,
                    &compact.data_id,
                    Some(dataset_type.dimensions()),
                )?;
                DatasetRef::new(dataset_type, data_id, compact.run.clone(), *id)
            })
            .collect()
    }
}
