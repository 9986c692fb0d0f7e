//! File datastore: dataset artifacts on the local filesystem.
//!
//! Each artifact is a file under the datastore root, named from the dataset's
//! run, type and data ID. The mapping from dataset ID to artifact is kept in
//! a JSON records file next to the artifacts.

mod formatter;
mod retrieve;

pub use formatter::{Formatter, JsonFormatter};
pub use retrieve::{ArtifactIndex, destination_for_artifact};

use crate::datasets::DatasetRef;
use crate::dimensions::DataIdValue;
use crate::error::{ButlerError, Result};
use crate::storage::write_atomic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const RECORDS_NAME: &str = "_datastore_records.json";

/// How `ingest` brings an existing file into the datastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    Move,
    Symlink,
    /// Leave the file where it is and record its absolute path.
    Direct,
}

/// Datastore record for one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFileInfo {
    /// Relative to the datastore root, or absolute when `external`.
    pub path: String,
    pub formatter: String,
    pub storage_class: String,
    pub file_size: u64,
    #[serde(default)]
    pub external: bool,
}

#[derive(Debug)]
pub struct FileDatastore<F: Formatter = JsonFormatter> {
    root: PathBuf,
    formatter: F,
    records: BTreeMap<Uuid, StoredFileInfo>,
}

impl FileDatastore<JsonFormatter> {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::with_formatter(root, JsonFormatter)
    }
}

impl<F: Formatter> FileDatastore<F> {
    /// Open (or create) a datastore rooted at `root`.
    pub fn with_formatter<P: AsRef<Path>>(root: P, formatter: F) -> Result<Self> {
        let root = std::path::absolute(root.as_ref())?;
        std::fs::create_dir_all(&root)?;
        let records_path = root.join(RECORDS_NAME);
        let records = if records_path.exists() {
            let bytes = std::fs::read(&records_path)?;
            serde_json::from_slice(&bytes).map_err(|e| {
                ButlerError::SerializationErrorWithContext(format!(
                    "failed to read datastore records {}: {}",
                    records_path.display(),
                    e
                ))
            })?
        } else {
            BTreeMap::new()
        };
        log::info!("Opened datastore at {}", root.display());
        Ok(Self {
            root,
            formatter,
            records,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stored_info(&self, id: Uuid) -> Option<&StoredFileInfo> {
        self.records.get(&id)
    }

    /// Serialize `value` as the artifact of `dataset_ref`.
    pub fn put<T: Serialize>(&mut self, value: &T, dataset_ref: &DatasetRef) -> Result<PathBuf> {
        self.check_absent(dataset_ref)?;
        let bytes = self.formatter.to_bytes(value)?;
        let relative = artifact_path(dataset_ref, self.formatter.extension());
        let path = self.root.join(&relative);
        write_atomic(&path, &bytes)?;
        self.record(
            dataset_ref,
            StoredFileInfo {
                path: path_string(&relative),
                formatter: self.formatter.extension().to_string(),
                storage_class: dataset_ref.dataset_type().storage_class().to_string(),
                file_size: bytes.len() as u64,
                external: false,
            },
        )?;
        log::debug!("Stored {} at {}", dataset_ref, path.display());
        Ok(path)
    }

    pub fn get<T: DeserializeOwned>(&self, dataset_ref: &DatasetRef) -> Result<T> {
        let bytes = std::fs::read(self.uri(dataset_ref)?)?;
        self.formatter.from_bytes(&bytes)
    }

    /// Read the artifact without a target type; `None` when it cannot be
    /// decoded.
    pub fn get_value(&self, dataset_ref: &DatasetRef) -> Result<Option<serde_json::Value>> {
        let bytes = std::fs::read(self.uri(dataset_ref)?)?;
        Ok(self.formatter.read_value(&bytes))
    }

    /// Whether an artifact is recorded for the dataset and present on disk.
    pub fn exists(&self, dataset_ref: &DatasetRef) -> bool {
        self.records
            .get(&dataset_ref.id())
            .is_some_and(|info| self.resolve(info).exists())
    }

    pub fn uri(&self, dataset_ref: &DatasetRef) -> Result<PathBuf> {
        self.records
            .get(&dataset_ref.id())
            .map(|info| self.resolve(info))
            .ok_or_else(|| ButlerError::Artifact(format!("no artifact stored for {}", dataset_ref)))
    }

    /// Delete the artifact. Externally ingested files are only forgotten.
    pub fn remove(&mut self, dataset_ref: &DatasetRef) -> Result<()> {
        let info = self
            .records
            .get(&dataset_ref.id())
            .cloned()
            .ok_or_else(|| ButlerError::Artifact(format!("no artifact stored for {}", dataset_ref)))?;
        let shared = self
            .records
            .iter()
            .any(|(id, other)| *id != dataset_ref.id() && other.path == info.path);
        if !info.external && !shared {
            match std::fs::remove_file(self.resolve(&info)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::warn!("Artifact for {} was already missing", dataset_ref);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.records.remove(&dataset_ref.id());
        self.save_records()
    }

    /// Bring an existing file in as the artifact of `dataset_ref`.
    pub fn ingest<P: AsRef<Path>>(
        &mut self,
        source: P,
        dataset_ref: &DatasetRef,
        mode: TransferMode,
    ) -> Result<PathBuf> {
        self.check_absent(dataset_ref)?;
        let source = std::path::absolute(source.as_ref())?;
        let metadata = std::fs::metadata(&source)?;
        if !metadata.is_file() {
            return Err(ButlerError::Artifact(format!(
                "{} is not a regular file",
                source.display()
            )));
        }

        let extension = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.formatter.extension().to_string());
        let relative = artifact_path(dataset_ref, &extension);
        let target = self.root.join(&relative);

        let (stored, external) = match mode {
            TransferMode::Direct => (source.clone(), true),
            _ => {
                if target.exists() {
                    return Err(ButlerError::Artifact(format!(
                        "{} already exists in the datastore",
                        target.display()
                    )));
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                transfer(&source, &target, mode)?;
                (relative, false)
            }
        };

        self.record(
            dataset_ref,
            StoredFileInfo {
                path: path_string(&stored),
                formatter: self.formatter.extension().to_string(),
                storage_class: dataset_ref.dataset_type().storage_class().to_string(),
                file_size: metadata.len(),
                external,
            },
        )?;
        log::debug!("Ingested {} for {} ({:?})", source.display(), dataset_ref, mode);
        Ok(self.resolve_path(&stored, external))
    }

    /// Copy the artifacts of `refs` into `destination` and write an
    /// [`ArtifactIndex`] describing them. Returns the copied file paths.
    pub fn retrieve_artifacts(
        &self,
        refs: &[DatasetRef],
        destination: &Path,
        preserve_path: bool,
        overwrite: bool,
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(destination)?;
        let destination = std::path::absolute(destination)?;

        let mut id_map: BTreeMap<PathBuf, Vec<Uuid>> = BTreeMap::new();
        let mut info_map: BTreeMap<PathBuf, StoredFileInfo> = BTreeMap::new();
        let mut copied = Vec::new();

        for dataset_ref in refs {
            let info = self.records.get(&dataset_ref.id()).ok_or_else(|| {
                ButlerError::Artifact(format!("no artifact stored for {}", dataset_ref))
            })?;
            let source = self.resolve(info);
            let target =
                destination_for_artifact(&destination, Path::new(&info.path), preserve_path, "")?;

            if let Some(ids) = id_map.get_mut(&target) {
                if info_map.get(&target).map(|i| i.path.as_str()) != Some(info.path.as_str()) {
                    return Err(ButlerError::Artifact(format!(
                        "two different artifacts would be written to {}",
                        target.display()
                    )));
                }
                ids.push(dataset_ref.id());
                continue;
            }

            if target.exists() && !overwrite {
                return Err(ButlerError::Artifact(format!(
                    "{} already exists; pass overwrite to replace it",
                    target.display()
                )));
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &target)?;
            id_map.insert(target.clone(), vec![dataset_ref.id()]);
            info_map.insert(target.clone(), info.clone());
            copied.push(target);
        }

        let index = ArtifactIndex::from_artifact_maps(refs, &id_map, &info_map, &destination)?;
        index.write_index(&destination)?;
        log::info!(
            "Retrieved {} artifacts for {} datasets into {}",
            copied.len(),
            refs.len(),
            destination.display()
        );
        Ok(copied)
    }

    fn check_absent(&self, dataset_ref: &DatasetRef) -> Result<()> {
        if self.records.contains_key(&dataset_ref.id()) {
            Err(ButlerError::ConflictingDataset(format!(
                "datastore already has an artifact for {}",
                dataset_ref
            )))
        } else {
            Ok(())
        }
    }

    fn record(&mut self, dataset_ref: &DatasetRef, info: StoredFileInfo) -> Result<()> {
        self.records.insert(dataset_ref.id(), info);
        self.save_records()
    }

    fn save_records(&self) -> Result<()> {
        write_atomic(
            &self.root.join(RECORDS_NAME),
            &serde_json::to_vec_pretty(&self.records)?,
        )
    }

    fn resolve(&self, info: &StoredFileInfo) -> PathBuf {
        self.resolve_path(Path::new(&info.path), info.external)
    }

    fn resolve_path(&self, path: &Path, external: bool) -> PathBuf {
        if external {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

fn transfer(source: &Path, target: &Path, mode: TransferMode) -> Result<()> {
    match mode {
        TransferMode::Copy => {
            std::fs::copy(source, target)?;
        }
        TransferMode::Move => {
            // rename fails across filesystems
            if std::fs::rename(source, target).is_err() {
                std::fs::copy(source, target)?;
                std::fs::remove_file(source)?;
            }
        }
        TransferMode::Symlink => symlink(source, target)?,
        TransferMode::Direct => {}
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(source: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(source, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink(source: &Path, _target: &Path) -> Result<()> {
    Err(ButlerError::Artifact(format!(
        "cannot symlink {}: symlinks are not supported on this platform",
        source.display()
    )))
}

/// `<run>/<type>/<type>_<dim>_<value>..._<run>.<ext>`, every component
/// sanitized.
fn artifact_path(dataset_ref: &DatasetRef, extension: &str) -> PathBuf {
    let type_name = sanitize(dataset_ref.dataset_type().name());
    let mut path: PathBuf = dataset_ref.run().split('/').map(sanitize).collect();
    path.push(&type_name);

    let mut file_name = type_name;
    let data_id = dataset_ref.data_id();
    for dimension in data_id.group().required() {
        if let Some(value) = data_id.value(dimension) {
            file_name.push('_');
            file_name.push_str(&sanitize(dimension));
            file_name.push('_');
            let raw = match value {
                DataIdValue::Int(v) => v.to_string(),
                DataIdValue::Str(v) => v.clone(),
            };
            file_name.push_str(&sanitize(&raw));
        }
    }
    file_name.push('_');
    file_name.push_str(&sanitize(&dataset_ref.run().replace('/', "_")));
    file_name.push('.');
    file_name.push_str(extension);
    path.push(file_name);
    path
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

fn path_string(path: &Path) -> String {
    if path.is_absolute() {
        return path.to_string_lossy().into_owned();
    }
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::{DatasetIdGen, DatasetType};
    use crate::dimensions::{DataCoordinate, DimensionGroup, DimensionUniverse};

    fn calexp_ref(run: &str, visit: i64) -> DatasetRef {
        let universe = DimensionUniverse::default_universe();
        let group = DimensionGroup::new(&universe, ["visit", "detector"]).unwrap();
        let dataset_type = DatasetType::new("calexp", group.clone(), "StructuredDataDict").unwrap();
        let data_id = DataCoordinate::standardize(
            &universe,
            [
                ("instrument", DataIdValue::from("HSC")),
                ("visit", DataIdValue::from(visit)),
                ("detector", DataIdValue::from(10)),
            ],
            Some(&group),
        )
        .unwrap();
        DatasetRef::generate(dataset_type, data_id, run, DatasetIdGen::Unique).unwrap()
    }

    #[test]
    fn test_artifact_path_template() {
        let r = calexp_ref("HSC/runs/a b", 903334);
        let path = artifact_path(&r, "json");
        assert_eq!(
            path,
            PathBuf::from(
                "HSC/runs/a_b/calexp/calexp_instrument_HSC_detector_10_visit_903334_HSC_runs_a_b.json"
            )
        );
    }

    #[test]
    fn test_sanitize_dot_components() {
        assert_eq!(sanitize(".."), "__");
        assert_eq!(sanitize(""), "_");
        assert_eq!(sanitize("a:b"), "a_b");
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileDatastore::new(dir.path()).unwrap();
        let r = calexp_ref("run", 1);

        let mut value = BTreeMap::new();
        value.insert("zero_point".to_string(), 27.0);
        let path = store.put(&value, &r).unwrap();
        assert!(path.starts_with(store.root()));
        assert!(store.exists(&r));
        assert!(store.put(&value, &r).is_err());

        let back: BTreeMap<String, f64> = store.get(&r).unwrap();
        assert_eq!(back, value);

        store.remove(&r).unwrap();
        assert!(!store.exists(&r));
        assert!(!path.exists());
        assert!(store.get::<BTreeMap<String, f64>>(&r).is_err());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let r = calexp_ref("run", 2);
        {
            let mut store = FileDatastore::new(dir.path()).unwrap();
            store.put(&vec![1, 2, 3], &r).unwrap();
        }
        let store = FileDatastore::new(dir.path()).unwrap();
        assert_eq!(store.get::<Vec<i32>>(&r).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_get_value_on_corrupt_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileDatastore::new(dir.path()).unwrap();
        let r = calexp_ref("run", 3);
        let path = store.put(&"fine", &r).unwrap();
        std::fs::write(&path, b"{truncated").unwrap();
        assert!(store.get_value(&r).unwrap().is_none());
        assert!(store.get::<String>(&r).is_err());
    }

    #[test]
    fn test_ingest_modes() {
        let source_dir = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileDatastore::new(dir.path()).unwrap();

        let copy_src = source_dir.path().join("copy.json");
        std::fs::write(&copy_src, b"[1]").unwrap();
        let copied = store.ingest(&copy_src, &calexp_ref("run", 1), TransferMode::Copy).unwrap();
        assert!(copy_src.exists() && copied.exists());

        let move_src = source_dir.path().join("move.json");
        std::fs::write(&move_src, b"[2]").unwrap();
        let moved = store.ingest(&move_src, &calexp_ref("run", 2), TransferMode::Move).unwrap();
        assert!(!move_src.exists() && moved.exists());

        let direct_src = source_dir.path().join("direct.json");
        std::fs::write(&direct_src, b"[3]").unwrap();
        let r = calexp_ref("run", 3);
        let direct = store.ingest(&direct_src, &r, TransferMode::Direct).unwrap();
        assert_eq!(direct, direct_src);
        assert!(store.stored_info(r.id()).unwrap().external);
        assert_eq!(store.get::<Vec<i32>>(&r).unwrap(), vec![3]);
        store.remove(&r).unwrap();
        assert!(direct_src.exists());
    }

    #[test]
    fn test_retrieve_artifacts_writes_index() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut store = FileDatastore::new(dir.path()).unwrap();
        let refs = vec![calexp_ref("run", 1), calexp_ref("run", 2)];
        for (i, r) in refs.iter().enumerate() {
            store.put(&i, r).unwrap();
        }

        let copied = store.retrieve_artifacts(&refs, out.path(), true, false).unwrap();
        assert_eq!(copied.len(), 2);
        assert!(copied.iter().all(|p| p.starts_with(out.path()) && p.exists()));

        let index = ArtifactIndex::read_index(out.path()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.refs.len(), 2);
        let ids: Vec<Uuid> = index.ref_map.values().flatten().copied().collect();
        assert!(refs.iter().all(|r| ids.contains(&r.id())));

        assert!(store.retrieve_artifacts(&refs, out.path(), true, false).is_err());
        assert!(store.retrieve_artifacts(&refs, out.path(), true, true).is_ok());
    }
}
