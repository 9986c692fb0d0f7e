//! Registry and datastore used together.

use crate::config::Config;
use crate::datasets::DatasetRef;
use crate::datastore::{ArtifactIndex, FileDatastore, TransferMode};
use crate::dimensions::DataCoordinate;
use crate::error::{ButlerError, Result};
use crate::registry::Registry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// A data repository: a [`Registry`] describing datasets plus a
/// [`FileDatastore`] holding their artifacts.
///
/// ```rust
/// use butlerdb::{Butler, Config, DataCoordinate, DatasetType, DimensionGroup};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = tempfile::tempdir()?;
/// let mut butler = Butler::memory(dir.path(), Config::default().with_default_run("run"))?;
/// let universe = butler.registry().universe().clone();
/// let summary = DatasetType::new("summary", DimensionGroup::empty(&universe), "StructuredDataDict")?;
/// butler.registry_mut().register_dataset_type(&summary)?;
///
/// let data_id = DataCoordinate::empty(&universe);
/// butler.put(&vec![1, 2, 3], "summary", &data_id, None)?;
/// let back: Vec<i32> = butler.get("summary", &data_id, Some(&["run"][..]))?;
/// assert_eq!(back, vec![1, 2, 3]);
/// # Ok(())
/// # }
/// ```
pub struct Butler {
    registry: Registry,
    datastore: FileDatastore,
}

impl Butler {
    pub fn new(registry: Registry, datastore: FileDatastore) -> Self {
        Self {
            registry,
            datastore,
        }
    }

    /// In-memory registry with a datastore at `root`.
    pub fn memory<P: AsRef<Path>>(root: P, config: Config) -> Result<Self> {
        let registry = Registry::memory_with_config(config)?;
        Ok(Self::new(registry, FileDatastore::new(root)?))
    }

    /// Registry snapshot and datastore both under `root`, unless the config
    /// names another datastore root.
    #[cfg(feature = "snapshot")]
    pub fn open<P: AsRef<Path>>(root: P, config: Config) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let datastore_root = config
            .datastore_root
            .clone()
            .unwrap_or_else(|| root.to_path_buf());
        let registry = Registry::open_with_config(root.join("registry.snap"), config)?;
        Ok(Self::new(registry, FileDatastore::new(datastore_root)?))
    }

    /// Use the registry's configured `datastore_root`.
    pub fn from_registry(registry: Registry) -> Result<Self> {
        let root = registry.config().datastore_root.clone().ok_or_else(|| {
            ButlerError::InvalidConfig("datastore_root is not configured".to_string())
        })?;
        Ok(Self::new(registry, FileDatastore::new(root)?))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn datastore(&self) -> &FileDatastore {
        &self.datastore
    }

    fn run_or_default(&self, run: Option<&str>) -> Result<String> {
        run.map(str::to_string)
            .or_else(|| self.registry.config().default_run.clone())
            .ok_or_else(|| {
                ButlerError::InvalidConfig("no run given and no default_run configured".to_string())
            })
    }

    /// Register a new dataset and write `value` as its artifact.
    pub fn put<T: Serialize>(
        &mut self,
        value: &T,
        dataset_type: &str,
        data_id: &DataCoordinate,
        run: Option<&str>,
    ) -> Result<DatasetRef> {
        let dataset_ref = self.register_one(dataset_type, data_id, run)?;
        if let Err(e) = self.datastore.put(value, &dataset_ref) {
            self.registry.remove_datasets(std::slice::from_ref(&dataset_ref))?;
            return Err(e);
        }
        Ok(dataset_ref)
    }

    /// Register a new dataset whose artifact is the existing file `path`.
    pub fn ingest<P: AsRef<Path>>(
        &mut self,
        path: P,
        dataset_type: &str,
        data_id: &DataCoordinate,
        run: Option<&str>,
        mode: TransferMode,
    ) -> Result<DatasetRef> {
        let dataset_ref = self.register_one(dataset_type, data_id, run)?;
        if let Err(e) = self.datastore.ingest(path, &dataset_ref, mode) {
            self.registry.remove_datasets(std::slice::from_ref(&dataset_ref))?;
            return Err(e);
        }
        Ok(dataset_ref)
    }

    fn register_one(
        &mut self,
        dataset_type: &str,
        data_id: &DataCoordinate,
        run: Option<&str>,
    ) -> Result<DatasetRef> {
        let run = self.run_or_default(run)?;
        self.registry.register_run(&run)?;
        let refs = self
            .registry
            .insert_datasets(dataset_type, [data_id.clone()], &run, None)?;
        refs.into_iter()
            .next()
            .ok_or_else(|| ButlerError::Other(format!("no dataset inserted for {}", dataset_type)))
    }

    /// Find the dataset in `collections` (or the defaults) and read it.
    pub fn get<T: DeserializeOwned, S: AsRef<str>>(
        &self,
        dataset_type: &str,
        data_id: &DataCoordinate,
        collections: Option<&[S]>,
    ) -> Result<T> {
        let dataset_ref = self
            .registry
            .find_dataset(dataset_type, data_id, collections)?
            .ok_or_else(|| ButlerError::DatasetNotFound(format!("{}@{}", dataset_type, data_id)))?;
        self.get_by_ref(&dataset_ref)
    }

    pub fn get_by_ref<T: DeserializeOwned>(&self, dataset_ref: &DatasetRef) -> Result<T> {
        if self.registry.get_dataset(dataset_ref.id())?.is_none() {
            return Err(ButlerError::MissingDataset(dataset_ref.id()));
        }
        self.datastore.get(dataset_ref)
    }

    /// Remove datasets from both the registry and the datastore.
    pub fn prune_datasets(&mut self, refs: &[DatasetRef]) -> Result<()> {
        for dataset_ref in refs {
            if self.datastore.stored_info(dataset_ref.id()).is_some() {
                self.datastore.remove(dataset_ref)?;
            }
        }
        self.registry.remove_datasets(refs)
    }

    pub fn retrieve_artifacts(
        &self,
        refs: &[DatasetRef],
        destination: &Path,
        preserve_path: bool,
        overwrite: bool,
    ) -> Result<Vec<PathBuf>> {
        self.datastore
            .retrieve_artifacts(refs, destination, preserve_path, overwrite)
    }

    /// Ingest a directory written by `retrieve_artifacts`, registering its
    /// dataset types, runs and datasets.
    pub fn import_artifacts(&mut self, directory: &Path, mode: TransferMode) -> Result<Vec<DatasetRef>> {
        let index = ArtifactIndex::read_index(directory)?;
        let refs = index.refs.to_refs(self.registry.universe())?;
        for dataset_ref in &refs {
            self.registry.register_dataset_type(dataset_ref.dataset_type())?;
        }
        let imported = self.registry.import_datasets(&refs)?;

        for (name, ids) in &index.ref_map {
            let source = directory.join(name);
            for (i, id) in ids.iter().enumerate() {
                let Some(dataset_ref) = imported.iter().find(|r| r.id() == *id) else {
                    continue;
                };
                if self.datastore.stored_info(*id).is_some() {
                    continue;
                }
                let last = i + 1 == ids.len();
                let mode = if mode == TransferMode::Move && !last {
                    TransferMode::Copy
                } else {
                    mode
                };
                self.datastore.ingest(&source, dataset_ref, mode)?;
            }
        }
        log::info!(
            "Imported {} datasets from {}",
            imported.len(),
            directory.display()
        );
        Ok(imported)
    }
}
