//! Thread-safe wrapper for concurrent registry access.
//!
//! Enable the `sync` feature to use this module. Query results borrow the
//! registry, so queries run inside [`SyncRegistry::read`] and return owned
//! values.
//!
//! ```rust
//! use butlerdb::SyncRegistry;
//! use std::thread;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = SyncRegistry::memory()?;
//! let writer = registry.clone();
//!
//! let handle = thread::spawn(move || writer.register_run("run/a").map(|_| ()));
//! handle.join().unwrap()?;
//!
//! assert!(registry.collection_type("run/a").is_ok());
//! # Ok(())
//! # }
//! ```

use super::{Registry, RegistryStats};
use crate::collections::CollectionType;
use crate::config::Config;
use crate::datasets::{DatasetIdGen, DatasetRef, DatasetType};
use crate::dimensions::{DataCoordinate, DimensionRecord};
use crate::error::Result;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// `Arc<RwLock<Registry>>` with delegating methods. Reads share the lock;
/// writes take it exclusively.
#[derive(Clone)]
pub struct SyncRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl SyncRegistry {
    pub fn memory() -> Result<Self> {
        Ok(Self::from_registry(Registry::memory()?))
    }

    pub fn memory_with_config(config: Config) -> Result<Self> {
        Ok(Self::from_registry(Registry::memory_with_config(config)?))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_registry(Registry::open(path)?))
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        Ok(Self::from_registry(Registry::open_with_config(path, config)?))
    }

    pub fn from_registry(registry: Registry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    // ===== Definitions =====

    pub fn insert_dimension_records(&self, records: Vec<DimensionRecord>) -> Result<()> {
        self.inner.write().insert_dimension_records(records)
    }

    pub fn sync_dimension_record(&self, record: DimensionRecord) -> Result<bool> {
        self.inner.write().sync_dimension_record(record)
    }

    pub fn register_dataset_type(&self, dataset_type: &DatasetType) -> Result<bool> {
        self.inner.write().register_dataset_type(dataset_type)
    }

    pub fn get_dataset_type(&self, name: &str) -> Result<DatasetType> {
        self.inner.read().get_dataset_type(name)
    }

    // ===== Collections =====

    pub fn register_collection(&self, name: &str, collection_type: CollectionType) -> Result<bool> {
        self.inner.write().register_collection(name, collection_type)
    }

    pub fn register_run(&self, name: &str) -> Result<bool> {
        self.inner.write().register_run(name)
    }

    pub fn collection_type(&self, name: &str) -> Result<CollectionType> {
        self.inner.read().collection_type(name)
    }

    pub fn set_collection_chain<S: AsRef<str>>(&self, parent: &str, children: &[S]) -> Result<()> {
        self.inner.write().set_collection_chain(parent, children)
    }

    // ===== Datasets =====

    pub fn insert_datasets<I>(
        &self,
        dataset_type: &str,
        data_ids: I,
        run: &str,
        id_generation: Option<DatasetIdGen>,
    ) -> Result<Vec<DatasetRef>>
    where
        I: IntoIterator<Item = DataCoordinate>,
    {
        self.inner
            .write()
            .insert_datasets(dataset_type, data_ids, run, id_generation)
    }

    pub fn get_dataset(&self, id: Uuid) -> Result<Option<DatasetRef>> {
        self.inner.read().get_dataset(id)
    }

    pub fn find_dataset<S: AsRef<str>>(
        &self,
        dataset_type: &str,
        data_id: &DataCoordinate,
        collections: Option<&[S]>,
    ) -> Result<Option<DatasetRef>> {
        self.inner.read().find_dataset(dataset_type, data_id, collections)
    }

    pub fn remove_datasets(&self, refs: &[DatasetRef]) -> Result<()> {
        self.inner.write().remove_datasets(refs)
    }

    // ===== Lifecycle =====

    pub fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Registry) -> Result<R>,
    {
        self.inner.write().transaction(f)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.write().flush()
    }

    pub fn close(&self) -> Result<()> {
        self.inner.write().close()
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.read().stats()
    }

    /// Shared access, e.g. for running queries.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Registry> {
        self.inner.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Registry> {
        self.inner.write()
    }
}
