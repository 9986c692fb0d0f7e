//! Registry state manipulation and leaf row production.

use super::{RegistryInner, RegistryState, StoredDataset};
use crate::collections::{CollectionManager, CollectionType, DatasetKey, glob_match};
use crate::config::Config;
use crate::datasets::{DatasetIdGen, DatasetRef, DatasetType};
use crate::dimensions::{DataCoordinate, DataIdValue, DimensionGroup, DimensionRecord, DimensionUniverse};
use crate::error::{ButlerError, Result};
use crate::query::{QueryArgs, QuerySummary};
use crate::relation::{ColumnTag, DatasetField, LeafRelation, RelationSource, Row, Value};
#[cfg(feature = "snapshot")]
use crate::storage::{SnapshotConfig, SnapshotFile};
use crate::time::AstroTime;
use std::collections::{BTreeMap, BTreeSet};
#[cfg(feature = "snapshot")]
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

impl RegistryInner {
    pub(crate) fn new(universe: Arc<DimensionUniverse>, config: Config) -> Self {
        let state = RegistryState {
            universe_namespace: universe.namespace().to_string(),
            universe_version: universe.version(),
            ..Default::default()
        };
        Self {
            universe,
            state,
            config,
            closed: false,
            in_transaction: false,
            mutations: 0,
            #[cfg(feature = "snapshot")]
            snapshot: None,
        }
    }

    #[cfg(feature = "snapshot")]
    pub(crate) fn attach_snapshot(&mut self, path: &Path) -> Result<()> {
        let snapshot = SnapshotFile::new(
            path,
            SnapshotConfig {
                auto_snapshot_ops: self.config.snapshot_auto_ops,
            },
        );
        if let Some(state) = snapshot.load::<RegistryState>()? {
            if state.universe_namespace != self.universe.namespace() {
                return Err(ButlerError::InvalidUniverse(format!(
                    "{} was written with universe namespace '{}', but this registry uses '{}'",
                    path.display(),
                    state.universe_namespace,
                    self.universe.namespace()
                )));
            }
            if state.universe_version != self.universe.version() {
                log::warn!(
                    "{} was written with universe version {}, opening with version {}",
                    path.display(),
                    state.universe_version,
                    self.universe.version()
                );
            }
            self.state = state;
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(ButlerError::RegistryClosed)
        } else {
            Ok(())
        }
    }

    /// Run one mutating operation. Operations validate before they change
    /// any state, so a failed operation leaves the registry untouched.
    pub(super) fn mutate<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let value = f(self)?;
        self.mutations += 1;
        #[cfg(feature = "snapshot")]
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.record_operation();
        }
        if !self.in_transaction {
            self.maybe_snapshot()?;
        }
        Ok(value)
    }

    pub(super) fn maybe_snapshot(&mut self) -> Result<()> {
        #[cfg(feature = "snapshot")]
        if let Some(snapshot) = self.snapshot.as_mut()
            && snapshot.should_snapshot()
        {
            snapshot.save(&self.state)?;
        }
        Ok(())
    }

    pub(super) fn flush(&mut self) -> Result<()> {
        #[cfg(feature = "snapshot")]
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.save(&self.state)?;
        }
        Ok(())
    }

    // Dimension records

    /// Values of `element`'s key dimensions, in order, taken from `values`.
    pub(crate) fn key_tuple(
        &self,
        element: &str,
        values: &BTreeMap<String, DataIdValue>,
    ) -> Result<Vec<DataIdValue>> {
        let element = self.universe.element(element)?;
        element
            .key_dimensions()
            .into_iter()
            .map(|d| {
                values.get(d).cloned().ok_or_else(|| {
                    ButlerError::InvalidDataId(format!(
                        "no value for '{}' to identify a '{}' record",
                        d,
                        element.name()
                    ))
                })
            })
            .collect()
    }

    pub(crate) fn record(&self, element: &str, key: &[DataIdValue]) -> Option<&DimensionRecord> {
        self.state.records.get(element)?.get(key)
    }

    pub(super) fn insert_records(&mut self, records: Vec<DimensionRecord>) -> Result<()> {
        let mut staged: Vec<(Vec<DataIdValue>, DimensionRecord)> = Vec::with_capacity(records.len());
        for record in records {
            let key = record.key_tuple(&self.universe)?;
            let duplicate = self.record(record.element(), &key).is_some()
                || staged
                    .iter()
                    .any(|(k, r)| r.element() == record.element() && *k == key);
            if duplicate {
                return Err(ButlerError::ConflictingDimensionRecord {
                    element: record.element().to_string(),
                    data_id: record.to_string(),
                });
            }
            self.check_dependencies(&record, &staged)?;
            staged.push((key, record));
        }
        for (key, record) in staged {
            self.state
                .records
                .entry(record.element().to_string())
                .or_default()
                .insert(key, record);
        }
        Ok(())
    }

    /// Every dimension a record requires or implies must have a record of
    /// its own, either stored or earlier in the same batch.
    fn check_dependencies(
        &self,
        record: &DimensionRecord,
        staged: &[(Vec<DataIdValue>, DimensionRecord)],
    ) -> Result<()> {
        let element = self.universe.element(record.element())?;
        let mut values = record.keys().clone();
        values.extend(record.implied().iter().map(|(k, v)| (k.clone(), v.clone())));
        for dependency in element.required().iter().chain(element.implied()) {
            if dependency == element.name() {
                continue;
            }
            let key = self.key_tuple(dependency, &values)?;
            let exists = self.record(dependency, &key).is_some()
                || staged
                    .iter()
                    .any(|(k, r)| r.element() == dependency && *k == key);
            if !exists {
                return Err(ButlerError::MissingDimensionRecord {
                    element: dependency.clone(),
                    data_id: record.to_string(),
                });
            }
        }
        Ok(())
    }

    pub(super) fn sync_record(&mut self, record: DimensionRecord) -> Result<bool> {
        let key = record.key_tuple(&self.universe)?;
        match self.record(record.element(), &key) {
            Some(existing) if *existing == record => Ok(false),
            Some(_) => Err(ButlerError::ConflictingDimensionRecord {
                element: record.element().to_string(),
                data_id: record.to_string(),
            }),
            None => {
                self.insert_records(vec![record])?;
                Ok(true)
            }
        }
    }

    /// Attach implied values and records to `data_id`.
    ///
    /// Implied values are discovered transitively (a visit record implies a
    /// physical filter, whose record implies a band), so elements are
    /// resolved in passes until none remain.
    pub(crate) fn expand(&self, data_id: &DataCoordinate) -> Result<DataCoordinate> {
        let group = data_id.group();
        let mut values = data_id.values().clone();
        let mut records: BTreeMap<String, Arc<DimensionRecord>> = BTreeMap::new();
        let mut pending: Vec<String> = group
            .elements()
            .into_iter()
            .filter(|e| e.is_dimension())
            .map(|e| e.name().to_string())
            .collect();

        while !pending.is_empty() {
            let mut unresolved = Vec::new();
            let before = pending.len();
            for name in pending {
                let Ok(key) = self.key_tuple(&name, &values) else {
                    unresolved.push(name);
                    continue;
                };
                let record = self.record(&name, &key).ok_or_else(|| {
                    ButlerError::MissingDimensionRecord {
                        element: name.clone(),
                        data_id: data_id.to_string(),
                    }
                })?;
                for (dimension, value) in record.implied() {
                    match values.get(dimension) {
                        Some(existing) if existing != value => {
                            return Err(ButlerError::InvalidDataId(format!(
                                "{}={} conflicts with {}, which implies {}={}",
                                dimension, existing, record, dimension, value
                            )));
                        }
                        Some(_) => {}
                        None => {
                            values.insert(dimension.clone(), value.clone());
                        }
                    }
                }
                records.insert(name, Arc::new(record.clone()));
            }
            if unresolved.len() == before {
                return Err(ButlerError::InvalidDataId(format!(
                    "cannot determine values for {:?} from {}",
                    unresolved, data_id
                )));
            }
            pending = unresolved;
        }

        for element in group.elements().into_iter().filter(|e| !e.is_dimension()) {
            if let Ok(key) = self.key_tuple(element.name(), &values)
                && let Some(record) = self.record(element.name(), &key)
            {
                records.insert(element.name().to_string(), Arc::new(record.clone()));
            }
        }

        Ok(data_id.clone().expanded(values, records))
    }

    /// Reduce or re-standardize `data_id` to exactly `group`.
    fn conform(&self, data_id: &DataCoordinate, group: &DimensionGroup) -> Result<DataCoordinate> {
        if data_id.group() == group {
            return Ok(data_id.clone());
        }
        if group.is_subset(data_id.group()) {
            return data_id.subset(group);
        }
        let values = data_id
            .values()
            .iter()
            .filter(|(k, _)| group.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()));
        DataCoordinate::standardize(&self.universe, values, Some(group))
    }

    // Dataset types

    pub(crate) fn dataset_type(&self, name: &str) -> Result<DatasetType> {
        let simple = self
            .state
            .dataset_types
            .get(name)
            .ok_or_else(|| ButlerError::MissingDatasetType(name.to_string()))?;
        DatasetType::from_simple(&self.universe, simple)
    }

    pub(super) fn register_dataset_type(&mut self, dataset_type: &DatasetType) -> Result<bool> {
        if dataset_type.is_component() {
            return Err(ButlerError::InvalidDatasetTypeName(format!(
                "{} (component dataset types cannot be registered)",
                dataset_type.name()
            )));
        }
        let simple = dataset_type.to_simple();
        match self.state.dataset_types.get(dataset_type.name()) {
            Some(existing) if *existing == simple => Ok(false),
            Some(existing) => Err(ButlerError::ConflictingDatasetType {
                name: dataset_type.name().to_string(),
                reason: format!(
                    "registered with dimensions {:?} and storage class {}",
                    existing.dimensions, existing.storage_class
                ),
            }),
            None => {
                self.state
                    .dataset_types
                    .insert(dataset_type.name().to_string(), simple);
                Ok(true)
            }
        }
    }

    pub(super) fn query_dataset_types(&self, pattern: &str) -> Result<Vec<DatasetType>> {
        self.state
            .dataset_types
            .values()
            .filter(|simple| glob_match(pattern, &simple.name))
            .map(|simple| DatasetType::from_simple(&self.universe, simple))
            .collect()
    }

    pub(super) fn remove_dataset_type(&mut self, name: &str) -> Result<()> {
        if !self.state.dataset_types.contains_key(name) {
            return Err(ButlerError::MissingDatasetType(name.to_string()));
        }
        let count = self
            .state
            .datasets
            .values()
            .filter(|d| d.dataset_type == name)
            .count();
        if count > 0 {
            return Err(ButlerError::ConflictingDatasetType {
                name: name.to_string(),
                reason: format!("{} datasets of this type still exist", count),
            });
        }
        self.state.dataset_types.remove(name);
        Ok(())
    }

    // Collections

    pub(super) fn remove_collection(&mut self, name: &str) -> Result<()> {
        if self.state.collections.collection_type(name)? == CollectionType::Run {
            let owned = self.state.datasets.values().filter(|d| d.run == name).count();
            if owned > 0 {
                return Err(ButlerError::CollectionInUse {
                    name: name.to_string(),
                    reason: format!("the RUN still holds {} datasets", owned),
                });
            }
        }
        self.state.collections.remove(name)
    }

    /// Flattened search path for `names`, or for the configured defaults.
    pub(crate) fn search_path(&self, names: Option<&[String]>) -> Result<Vec<String>> {
        let names = names.unwrap_or(&self.config.default_collections);
        if names.is_empty() {
            return Err(ButlerError::InvalidQuery(
                "no collections given and no default collections configured".to_string(),
            ));
        }
        let mut expanded = Vec::with_capacity(names.len());
        for name in names {
            if name.contains('*') {
                expanded.extend(self.state.collections.query(name).into_iter().map(|(n, _)| n));
            } else {
                expanded.push(name.clone());
            }
        }
        self.state.collections.resolve(&expanded)
    }

    // Datasets

    fn dataset_key(dataset_ref: &DatasetRef) -> DatasetKey {
        (
            dataset_ref.dataset_type().name().to_string(),
            dataset_ref.data_id().required_values().into_iter().cloned().collect(),
        )
    }

    fn stored_key(&self, stored: &StoredDataset) -> Result<DatasetKey> {
        let dataset_type = self.dataset_type(&stored.dataset_type)?;
        let values = dataset_type
            .dimensions()
            .required()
            .iter()
            .filter_map(|d| stored.data_id.get(d).cloned())
            .collect();
        Ok((stored.dataset_type.clone(), values))
    }

    /// Reject a new dataset that would collide with a stored one or with
    /// another dataset of the same batch.
    fn check_new_dataset(
        &self,
        dataset_ref: &DatasetRef,
        batch: &mut BTreeSet<(String, DatasetKey)>,
        ids: &mut BTreeSet<Uuid>,
    ) -> Result<()> {
        let run_key = (dataset_ref.run().to_string(), Self::dataset_key(dataset_ref));
        if self.state.run_index.contains_key(&run_key) || !batch.insert(run_key) {
            return Err(ButlerError::ConflictingDataset(format!(
                "RUN '{}' already has a '{}' dataset for {}",
                dataset_ref.run(),
                dataset_ref.dataset_type().name(),
                dataset_ref.data_id()
            )));
        }
        if self.state.datasets.contains_key(&dataset_ref.id()) || !ids.insert(dataset_ref.id()) {
            return Err(ButlerError::ConflictingDataset(format!(
                "dataset ID {} is already in use",
                dataset_ref.id()
            )));
        }
        Ok(())
    }

    fn store(&mut self, dataset_ref: &DatasetRef, ingest_date: AstroTime) {
        let key = Self::dataset_key(dataset_ref);
        self.state
            .run_index
            .insert((dataset_ref.run().to_string(), key), dataset_ref.id());
        self.state.datasets.insert(
            dataset_ref.id(),
            StoredDataset {
                dataset_type: dataset_ref.dataset_type().name().to_string(),
                run: dataset_ref.run().to_string(),
                data_id: dataset_ref.data_id().values().clone(),
                ingest_date,
            },
        );
    }

    pub(super) fn insert_datasets(
        &mut self,
        dataset_type: &str,
        data_ids: &[DataCoordinate],
        run: &str,
        id_generation: DatasetIdGen,
    ) -> Result<Vec<DatasetRef>> {
        let dataset_type = self.dataset_type(dataset_type)?;
        self.state.collections.require_type(run, CollectionType::Run)?;

        let mut batch = BTreeSet::new();
        let mut ids = BTreeSet::new();
        let mut refs = Vec::with_capacity(data_ids.len());
        for data_id in data_ids {
            let data_id = self.conform(data_id, dataset_type.dimensions())?;
            let expanded = self.expand(&data_id)?;
            let dataset_ref = DatasetRef::generate(dataset_type.clone(), expanded, run, id_generation)?;
            self.check_new_dataset(&dataset_ref, &mut batch, &mut ids)?;
            refs.push(dataset_ref);
        }

        let ingest_date = AstroTime::now();
        for dataset_ref in &refs {
            self.store(dataset_ref, ingest_date);
        }
        log::debug!(
            "Inserted {} '{}' datasets into {}",
            refs.len(),
            dataset_type.name(),
            run
        );
        Ok(refs)
    }

    pub(super) fn import_datasets(&mut self, refs: &[DatasetRef]) -> Result<Vec<DatasetRef>> {
        let mut collections: CollectionManager = self.state.collections.clone();
        let mut batch = BTreeSet::new();
        let mut ids = BTreeSet::new();
        let mut imported = Vec::with_capacity(refs.len());
        let mut new_refs = Vec::new();

        for dataset_ref in refs {
            let dataset_type = self.dataset_type(dataset_ref.dataset_type().name())?;
            if dataset_type != *dataset_ref.dataset_type() {
                return Err(ButlerError::ConflictingDatasetType {
                    name: dataset_type.name().to_string(),
                    reason: format!("import uses {:?}", dataset_ref.dataset_type()),
                });
            }
            collections.register(dataset_ref.run(), CollectionType::Run)?;

            if let Some(stored) = self.state.datasets.get(&dataset_ref.id()) {
                let same = stored.dataset_type == dataset_type.name()
                    && stored.run == dataset_ref.run()
                    && self.stored_key(stored)? == Self::dataset_key(dataset_ref);
                if !same {
                    return Err(ButlerError::ConflictingDataset(format!(
                        "dataset ID {} already exists with different content",
                        dataset_ref.id()
                    )));
                }
                imported.push(self.dataset_ref(dataset_ref.id())?);
                continue;
            }

            let data_id = self.conform(dataset_ref.data_id(), dataset_type.dimensions())?;
            let expanded = self.expand(&data_id)?;
            let resolved = DatasetRef::new(dataset_type, expanded, dataset_ref.run(), dataset_ref.id())?;
            self.check_new_dataset(&resolved, &mut batch, &mut ids)?;
            imported.push(resolved.clone());
            new_refs.push(resolved);
        }

        self.state.collections = collections;
        let ingest_date = AstroTime::now();
        for dataset_ref in &new_refs {
            self.store(dataset_ref, ingest_date);
        }
        Ok(imported)
    }

    pub(crate) fn dataset_ref(&self, id: Uuid) -> Result<DatasetRef> {
        let stored = self
            .state
            .datasets
            .get(&id)
            .ok_or(ButlerError::MissingDataset(id))?;
        let dataset_type = self.dataset_type(&stored.dataset_type)?;
        let data_id = DataCoordinate::standardize(
            &self.universe,
            stored.data_id.clone(),
            Some(dataset_type.dimensions()),
        )?;
        DatasetRef::new(dataset_type, data_id, stored.run.clone(), id)
    }

    pub(crate) fn ingest_date(&self, id: Uuid) -> Result<AstroTime> {
        self.state
            .datasets
            .get(&id)
            .map(|d| d.ingest_date)
            .ok_or(ButlerError::MissingDataset(id))
    }

    pub(super) fn find_dataset(
        &self,
        dataset_type: &str,
        data_id: &DataCoordinate,
        collections: Option<&[String]>,
    ) -> Result<Option<DatasetRef>> {
        let dataset_type = self.dataset_type(dataset_type)?;
        let data_id = self.conform(data_id, dataset_type.dimensions())?;
        let key: DatasetKey = (
            dataset_type.name().to_string(),
            data_id.required_values().into_iter().cloned().collect(),
        );
        for collection in self.search_path(collections)? {
            let found = match self.state.collections.collection_type(&collection)? {
                CollectionType::Run => self.state.run_index.get(&(collection.clone(), key.clone())).copied(),
                CollectionType::Tagged => self.state.collections.tagged_lookup(&collection, &key),
                CollectionType::Chained => None,
            };
            if let Some(id) = found {
                return self.dataset_ref(id).map(Some);
            }
        }
        Ok(None)
    }

    pub(super) fn remove_datasets(&mut self, ids: &[Uuid]) -> Result<()> {
        let mut keys = Vec::with_capacity(ids.len());
        for id in ids {
            let stored = self
                .state
                .datasets
                .get(id)
                .ok_or(ButlerError::MissingDataset(*id))?;
            keys.push((stored.run.clone(), self.stored_key(stored)?));
        }
        for (id, run_key) in ids.iter().zip(keys) {
            self.state.datasets.remove(id);
            self.state.run_index.remove(&run_key);
        }
        let removed: BTreeSet<Uuid> = ids.iter().copied().collect();
        self.state.collections.forget_datasets(&removed);
        Ok(())
    }

    pub(super) fn associate(&mut self, tag: &str, refs: &[DatasetRef]) -> Result<()> {
        let mut entries = Vec::with_capacity(refs.len());
        for dataset_ref in refs {
            let stored = self
                .state
                .datasets
                .get(&dataset_ref.id())
                .ok_or(ButlerError::MissingDataset(dataset_ref.id()))?;
            entries.push((self.stored_key(stored)?, dataset_ref.id()));
        }
        self.state.collections.associate(tag, entries)
    }

    // Queries

    /// Summarise `args` for results with dimensions `requested`, resolving
    /// dataset types and collections.
    pub(crate) fn summarize(
        &self,
        requested: DimensionGroup,
        args: &QueryArgs,
        order_by_element: Option<&str>,
    ) -> Result<QuerySummary> {
        let datasets = args
            .datasets
            .iter()
            .map(|name| self.dataset_type(name))
            .collect::<Result<Vec<_>>>()?;
        let collections = if datasets.is_empty() {
            Vec::new()
        } else {
            self.search_path(args.collections.as_deref())?
        };
        QuerySummary::new(
            requested,
            args,
            datasets,
            collections,
            &self.config.governor_defaults,
            order_by_element,
        )
    }

    fn dimension_rows(&self, element: &str, columns: &[ColumnTag]) -> Vec<Row> {
        let Some(records) = self.state.records.get(element) else {
            return Vec::new();
        };
        records
            .values()
            .map(|record| {
                columns
                    .iter()
                    .map(|column| {
                        let value = match column {
                            ColumnTag::DimensionKey(d) => record
                                .keys()
                                .get(d)
                                .or_else(|| record.implied().get(d))
                                .map(Value::from)
                                .unwrap_or(Value::Null),
                            ColumnTag::DimensionRecord { field, .. } => match field.as_str() {
                                "timespan" => record.timespan().copied().map(Value::Timespan).unwrap_or(Value::Null),
                                "region" => record.region().cloned().map(Value::Region).unwrap_or(Value::Null),
                                _ => record.field(field).map(Value::from).unwrap_or(Value::Null),
                            },
                            ColumnTag::Dataset { .. } => Value::Null,
                        };
                        (column.clone(), value)
                    })
                    .collect()
            })
            .collect()
    }

    fn dataset_rows(
        &self,
        dataset_type: &str,
        collection: &str,
        rank: usize,
        columns: &[ColumnTag],
    ) -> Result<Vec<Row>> {
        let ids: Vec<Uuid> = match self.state.collections.collection_type(collection)? {
            CollectionType::Run => self
                .state
                .run_index
                .iter()
                .filter(|((run, (dt, _)), _)| run == collection && dt == dataset_type)
                .map(|(_, id)| *id)
                .collect(),
            CollectionType::Tagged => self
                .state
                .collections
                .tagged_members(collection)
                .into_iter()
                .filter(|id| {
                    self.state
                        .datasets
                        .get(id)
                        .is_some_and(|d| d.dataset_type == dataset_type)
                })
                .collect(),
            CollectionType::Chained => {
                return Err(ButlerError::InvalidQuery(format!(
                    "CHAINED collection '{}' must be flattened before searching",
                    collection
                )));
            }
        };

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let stored = self.state.datasets.get(&id).ok_or(ButlerError::MissingDataset(id))?;
            let row: Row = columns
                .iter()
                .map(|column| {
                    let value = match column {
                        ColumnTag::DimensionKey(d) => {
                            stored.data_id.get(d).map(Value::from).unwrap_or(Value::Null)
                        }
                        ColumnTag::Dataset { field, .. } => match field {
                            DatasetField::DatasetId => Value::Uuid(id),
                            DatasetField::Run => Value::Str(stored.run.clone()),
                            DatasetField::IngestDate => Value::Time(stored.ingest_date),
                            DatasetField::Rank => Value::Int(rank as i64),
                        },
                        ColumnTag::DimensionRecord { .. } => Value::Null,
                    };
                    (column.clone(), value)
                })
                .collect();
            rows.push(row);
        }
        Ok(rows)
    }
}

impl RelationSource for RegistryInner {
    fn leaf_rows(&self, leaf: &LeafRelation) -> Result<Vec<Row>> {
        match leaf {
            LeafRelation::DimensionTable { element, columns } => Ok(self.dimension_rows(element, columns)),
            LeafRelation::DatasetSearch {
                dataset_type,
                collection,
                rank,
                columns,
            } => self.dataset_rows(dataset_type, collection, *rank, columns),
        }
    }
}
