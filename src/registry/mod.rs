//! The registry: dimension records, dataset types, collections and datasets,
//! plus the query entry points.

use crate::collections::{CollectionManager, CollectionType, DatasetKey};
use crate::config::Config;
use crate::datasets::{DatasetIdGen, DatasetRef, DatasetType, SerializedDatasetType};
use crate::dimensions::{DataCoordinate, DataIdValue, DimensionGroup, DimensionRecord, DimensionUniverse};
use crate::error::{ButlerError, Result};
use crate::query::{
    DataCoordinateQueryResults, DatasetQueryResults, DimensionRecordQueryResults, QueryArgs,
};
#[cfg(feature = "snapshot")]
use crate::storage::SnapshotFile;
use crate::time::AstroTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
#[cfg(not(feature = "sync"))]
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

mod internal;

#[cfg(feature = "sync")]
mod sync;

#[cfg(feature = "sync")]
pub use sync::SyncRegistry;

/// A dataset as stored: full data ID values including implied dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredDataset {
    pub dataset_type: String,
    pub run: String,
    pub data_id: BTreeMap<String, DataIdValue>,
    pub ingest_date: AstroTime,
}

/// Everything a snapshot persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct RegistryState {
    pub universe_namespace: String,
    pub universe_version: u32,
    /// Element name -> key tuple -> record.
    pub records: BTreeMap<String, BTreeMap<Vec<DataIdValue>, DimensionRecord>>,
    pub dataset_types: BTreeMap<String, SerializedDatasetType>,
    pub collections: CollectionManager,
    pub datasets: BTreeMap<Uuid, StoredDataset>,
    /// (run, dataset key) -> dataset ID.
    pub run_index: BTreeMap<(String, DatasetKey), Uuid>,
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub dimension_records: usize,
    pub dataset_types: usize,
    pub collections: usize,
    pub datasets: usize,
    /// Mutating operations since the registry was opened.
    pub mutations: u64,
}

/// Embedded dataset registry (single-threaded by default).
///
/// A `Registry` stores dimension records, dataset types, collections and
/// datasets, and plans queries over them. With the `snapshot` feature the
/// state can be persisted to a file and is reloaded on open.
///
/// `Registry` is neither `Send` nor `Sync` unless the `sync` feature is
/// enabled; [`SyncRegistry`](crate::SyncRegistry) wraps it in an
/// `Arc<RwLock<_>>` for shared use.
///
/// # Examples
///
/// ```rust
/// use butlerdb::{DimensionRecord, QueryArgs, Registry};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = Registry::memory()?;
/// let universe = registry.universe().clone();
///
/// registry.insert_dimension_records(vec![
///     DimensionRecord::builder("instrument")
///         .key("instrument", "HSC")
///         .build(&universe)?,
///     DimensionRecord::builder("detector")
///         .key("instrument", "HSC")
///         .key("detector", 50)
///         .build(&universe)?,
/// ])?;
///
/// let data_ids = registry
///     .query_data_ids(&["detector"], QueryArgs::new().where_clause("instrument = 'HSC'"))?
///     .to_vec()?;
/// assert_eq!(data_ids.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct Registry {
    pub(crate) inner: RegistryInner,
    #[cfg(not(feature = "sync"))]
    pub(crate) _not_send_sync: PhantomData<*const ()>,
}

pub(crate) struct RegistryInner {
    pub universe: Arc<DimensionUniverse>,
    pub state: RegistryState,
    pub config: Config,
    pub closed: bool,
    pub in_transaction: bool,
    pub mutations: u64,
    #[cfg(feature = "snapshot")]
    pub snapshot: Option<SnapshotFile>,
}

impl Registry {
    /// Open a registry persisted at `path`, creating it if absent.
    ///
    /// `":memory:"` opens an in-memory registry.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, Config::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        config.validate().map_err(ButlerError::InvalidConfig)?;
        let path = path.as_ref();
        let universe = config.build_universe()?;
        #[cfg_attr(not(feature = "snapshot"), allow(unused_mut))]
        let mut inner = RegistryInner::new(universe, config);

        if path.to_str() != Some(":memory:") {
            #[cfg(feature = "snapshot")]
            inner.attach_snapshot(path)?;
            #[cfg(not(feature = "snapshot"))]
            return Err(ButlerError::InvalidConfig(format!(
                "cannot open {}: persistence requires the `snapshot` feature",
                path.display()
            )));
        }

        log::info!(
            "Opened registry ({} datasets, universe {} v{})",
            inner.state.datasets.len(),
            inner.universe.namespace(),
            inner.universe.version()
        );
        Ok(Self::from_inner(inner))
    }

    /// In-memory registry with the default universe.
    pub fn memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn memory_with_config(config: Config) -> Result<Self> {
        Self::open_with_config(":memory:", config)
    }

    pub fn builder() -> crate::builder::RegistryBuilder {
        crate::builder::RegistryBuilder::new()
    }

    pub(crate) fn from_inner(inner: RegistryInner) -> Self {
        Self {
            inner,
            #[cfg(not(feature = "sync"))]
            _not_send_sync: PhantomData,
        }
    }

    pub fn universe(&self) -> &Arc<DimensionUniverse> {
        &self.inner.universe
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn stats(&self) -> RegistryStats {
        let state = &self.inner.state;
        RegistryStats {
            dimension_records: state.records.values().map(BTreeMap::len).sum(),
            dataset_types: state.dataset_types.len(),
            collections: state.collections.len(),
            datasets: state.datasets.len(),
            mutations: self.inner.mutations,
        }
    }

    // Dimension records

    /// Insert records; an existing record with the same key is an error.
    pub fn insert_dimension_records(&mut self, records: Vec<DimensionRecord>) -> Result<()> {
        self.inner.check_open()?;
        self.inner.mutate(|inner| inner.insert_records(records))
    }

    /// Insert a record, or verify that an identical one exists.
    ///
    /// Returns `true` if the record was inserted.
    pub fn sync_dimension_record(&mut self, record: DimensionRecord) -> Result<bool> {
        self.inner.check_open()?;
        self.inner.mutate(|inner| inner.sync_record(record))
    }

    pub fn dimension_record(
        &self,
        element: &str,
        data_id: &DataCoordinate,
    ) -> Result<Option<DimensionRecord>> {
        self.inner.check_open()?;
        let key = self.inner.key_tuple(element, data_id.values())?;
        Ok(self.inner.record(element, &key).cloned())
    }

    /// Standardize `values` and attach implied values and records.
    pub fn expand_data_id<I, K, V>(&self, values: I, group: Option<&DimensionGroup>) -> Result<DataCoordinate>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DataIdValue>,
    {
        self.inner.check_open()?;
        let data_id = DataCoordinate::standardize(&self.inner.universe, values, group)?;
        self.inner.expand(&data_id)
    }

    // Dataset types

    /// Register a dataset type. Returns `false` if an identical one exists.
    pub fn register_dataset_type(&mut self, dataset_type: &DatasetType) -> Result<bool> {
        self.inner.check_open()?;
        self.inner.mutate(|inner| inner.register_dataset_type(dataset_type))
    }

    pub fn get_dataset_type(&self, name: &str) -> Result<DatasetType> {
        self.inner.check_open()?;
        self.inner.dataset_type(name)
    }

    /// Dataset types whose names match a `*` glob, sorted by name.
    pub fn query_dataset_types(&self, pattern: &str) -> Result<Vec<DatasetType>> {
        self.inner.check_open()?;
        self.inner.query_dataset_types(pattern)
    }

    /// Remove a dataset type that has no datasets.
    pub fn remove_dataset_type(&mut self, name: &str) -> Result<()> {
        self.inner.check_open()?;
        self.inner.mutate(|inner| inner.remove_dataset_type(name))
    }

    // Collections

    /// Register a collection. Returns `false` if it already exists with the
    /// same type.
    pub fn register_collection(&mut self, name: &str, collection_type: CollectionType) -> Result<bool> {
        self.inner.check_open()?;
        self.inner
            .mutate(|inner| inner.state.collections.register(name, collection_type))
    }

    pub fn register_run(&mut self, name: &str) -> Result<bool> {
        self.register_collection(name, CollectionType::Run)
    }

    pub fn collection_type(&self, name: &str) -> Result<CollectionType> {
        self.inner.check_open()?;
        self.inner.state.collections.collection_type(name)
    }

    /// Replace the children of a CHAINED collection.
    pub fn set_collection_chain<S: AsRef<str>>(&mut self, parent: &str, children: &[S]) -> Result<()> {
        self.inner.check_open()?;
        self.inner
            .mutate(|inner| inner.state.collections.set_chain(parent, children))
    }

    pub fn get_collection_chain(&self, name: &str) -> Result<Vec<String>> {
        self.inner.check_open()?;
        self.inner.state.collections.get_chain(name)
    }

    /// Remove a collection that is not a chain child and, for RUNs, owns no
    /// datasets.
    pub fn remove_collection(&mut self, name: &str) -> Result<()> {
        self.inner.check_open()?;
        self.inner.mutate(|inner| inner.remove_collection(name))
    }

    /// Flatten collections (and `*` globs) into a search path.
    pub fn resolve_collections<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<String>> {
        self.inner.check_open()?;
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        self.inner.search_path(Some(&names))
    }

    pub fn query_collections(&self, pattern: &str) -> Result<Vec<(String, CollectionType)>> {
        self.inner.check_open()?;
        Ok(self.inner.state.collections.query(pattern))
    }

    // Datasets

    /// Insert new datasets into a RUN. Every data ID must reference
    /// existing dimension records.
    pub fn insert_datasets<I>(
        &mut self,
        dataset_type: &str,
        data_ids: I,
        run: &str,
        id_generation: Option<DatasetIdGen>,
    ) -> Result<Vec<DatasetRef>>
    where
        I: IntoIterator<Item = DataCoordinate>,
    {
        self.inner.check_open()?;
        let id_generation = id_generation.unwrap_or(self.inner.config.id_generation);
        let data_ids: Vec<DataCoordinate> = data_ids.into_iter().collect();
        self.inner
            .mutate(|inner| inner.insert_datasets(dataset_type, &data_ids, run, id_generation))
    }

    /// Insert datasets with pre-assigned IDs, registering their RUNs.
    ///
    /// Importing a dataset that already exists with identical content is a
    /// no-op.
    pub fn import_datasets(&mut self, refs: &[DatasetRef]) -> Result<Vec<DatasetRef>> {
        self.inner.check_open()?;
        self.inner.mutate(|inner| inner.import_datasets(refs))
    }

    pub fn get_dataset(&self, id: Uuid) -> Result<Option<DatasetRef>> {
        self.inner.check_open()?;
        if !self.inner.state.datasets.contains_key(&id) {
            return Ok(None);
        }
        self.inner.dataset_ref(id).map(Some)
    }

    /// When the dataset was registered.
    pub fn get_ingest_date(&self, id: Uuid) -> Result<AstroTime> {
        self.inner.check_open()?;
        self.inner
            .state
            .datasets
            .get(&id)
            .map(|d| d.ingest_date)
            .ok_or(ButlerError::MissingDataset(id))
    }

    /// First dataset matching `data_id` in the search path.
    pub fn find_dataset<S: AsRef<str>>(
        &self,
        dataset_type: &str,
        data_id: &DataCoordinate,
        collections: Option<&[S]>,
    ) -> Result<Option<DatasetRef>> {
        self.inner.check_open()?;
        let names: Option<Vec<String>> =
            collections.map(|c| c.iter().map(|n| n.as_ref().to_string()).collect());
        self.inner.find_dataset(dataset_type, data_id, names.as_deref())
    }

    /// Remove datasets from their RUNs and every TAGGED collection.
    pub fn remove_datasets(&mut self, refs: &[DatasetRef]) -> Result<()> {
        self.inner.check_open()?;
        let ids: Vec<Uuid> = refs.iter().map(DatasetRef::id).collect();
        self.inner.mutate(|inner| inner.remove_datasets(&ids))
    }

    pub fn associate(&mut self, tag: &str, refs: &[DatasetRef]) -> Result<()> {
        self.inner.check_open()?;
        self.inner.mutate(|inner| inner.associate(tag, refs))
    }

    pub fn disassociate(&mut self, tag: &str, refs: &[DatasetRef]) -> Result<()> {
        self.inner.check_open()?;
        let ids: BTreeSet<Uuid> = refs.iter().map(DatasetRef::id).collect();
        self.inner
            .mutate(|inner| inner.state.collections.disassociate(tag, &ids))
    }

    // Queries

    /// Data IDs with the given dimensions satisfying `args`.
    pub fn query_data_ids<S: AsRef<str>>(
        &self,
        dimensions: &[S],
        args: QueryArgs,
    ) -> Result<DataCoordinateQueryResults<'_>> {
        self.inner.check_open()?;
        let group = DimensionGroup::new(&self.inner.universe, dimensions)?;
        Ok(DataCoordinateQueryResults::new(self, group, args))
    }

    /// Datasets of one type satisfying `args`.
    pub fn query_datasets(&self, dataset_type: &str, args: QueryArgs) -> Result<DatasetQueryResults<'_>> {
        self.inner.check_open()?;
        let dataset_type = self.inner.dataset_type(dataset_type)?;
        Ok(DatasetQueryResults::new(self, dataset_type, args, None))
    }

    /// Records of one element satisfying `args`.
    pub fn query_dimension_records(
        &self,
        element: &str,
        args: QueryArgs,
    ) -> Result<DimensionRecordQueryResults<'_>> {
        self.inner.check_open()?;
        self.inner.universe.element(element)?;
        Ok(DimensionRecordQueryResults::new(self, element.to_string(), args))
    }

    // Lifecycle

    /// Run `f` with all-or-nothing semantics: if it fails, every change it
    /// made is rolled back.
    ///
    /// ```rust
    /// use butlerdb::Registry;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut registry = Registry::memory()?;
    /// let result: butlerdb::Result<()> = registry.transaction(|txn| {
    ///     txn.register_run("run/a")?;
    ///     txn.set_collection_chain("missing", &["run/a"])?;
    ///     Ok(())
    /// });
    /// assert!(result.is_err());
    /// assert!(registry.collection_type("run/a").is_err());
    /// # Ok(())
    /// # }
    /// ```
    pub fn transaction<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Registry) -> Result<R>,
    {
        self.inner.check_open()?;
        if self.inner.in_transaction {
            return f(self);
        }
        let backup = self.inner.state.clone();
        let mutations = self.inner.mutations;
        self.inner.in_transaction = true;
        let result = f(self);
        self.inner.in_transaction = false;
        match result {
            Ok(value) => {
                self.inner.maybe_snapshot()?;
                Ok(value)
            }
            Err(e) => {
                log::debug!("Rolling back transaction: {}", e);
                self.inner.state = backup;
                self.inner.mutations = mutations;
                Err(e)
            }
        }
    }

    /// Write a snapshot now (no-op for in-memory registries).
    pub fn flush(&mut self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.flush()
    }

    /// Flush and close. Further operations return
    /// [`ButlerError::RegistryClosed`].
    pub fn close(&mut self) -> Result<()> {
        if self.inner.closed {
            return Ok(());
        }
        self.inner.flush()?;
        self.inner.closed = true;
        log::info!("Closed registry");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if !self.inner.closed
            && let Err(e) = self.close()
        {
            log::warn!("Failed to close registry on drop: {}", e);
        }
    }
}
