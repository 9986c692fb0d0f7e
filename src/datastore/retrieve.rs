//! Index of artifacts copied out of a datastore.

use super::StoredFileInfo;
use crate::datasets::{DATASET_ID_NAMESPACE, DatasetRef, RefContainer};
use crate::error::{ButlerError, Result};
use crate::storage::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Describes a directory of retrieved artifacts well enough to ingest them
/// into another repository.
///
/// A file can hold several datasets and a dataset can span several files,
/// so both maps are keyed by the artifact path relative to the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub refs: RefContainer,
    pub ref_map: BTreeMap<String, Vec<Uuid>>,
    pub info_map: BTreeMap<String, StoredFileInfo>,
}

impl ArtifactIndex {
    pub const INDEX_NAME: &'static str = "_index.json";

    /// Build an index from absolute artifact paths under `root`.
    pub fn from_artifact_maps<'a, I>(
        refs: I,
        id_map: &BTreeMap<PathBuf, Vec<Uuid>>,
        info_map: &BTreeMap<PathBuf, StoredFileInfo>,
        root: &Path,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = &'a DatasetRef>,
    {
        let refs = RefContainer::from_refs(refs)?;
        let mut ref_map = BTreeMap::new();
        for (path, ids) in id_map {
            ref_map.insert(relative_name(root, path)?, ids.clone());
        }
        let mut infos = BTreeMap::new();
        for (path, info) in info_map {
            let name = relative_name(root, path)?;
            let mut info = info.clone();
            info.path = name.clone();
            info.external = false;
            infos.insert(name, info);
        }
        Ok(Self {
            refs,
            ref_map,
            info_map: infos,
        })
    }

    /// Stable ID derived from the artifact paths only.
    pub fn generate_uuid5(&self) -> Uuid {
        let names: Vec<&str> = self.info_map.keys().map(String::as_str).collect();
        Uuid::new_v5(&DATASET_ID_NAMESPACE, names.join(",").as_bytes())
    }

    /// Number of files in the index.
    pub fn len(&self) -> usize {
        self.info_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info_map.is_empty()
    }

    pub fn write_index(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::INDEX_NAME);
        write_atomic(&path, &serde_json::to_vec(self)?)?;
        Ok(path)
    }

    pub fn read_index(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::INDEX_NAME);
        let bytes = std::fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ButlerError::Artifact(format!("{} is not a valid artifact index: {}", path.display(), e))
        })
    }
}

fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        ButlerError::Artifact(format!(
            "{} is not inside {}",
            path.display(),
            root.display()
        ))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Where a retrieved artifact lands inside `destination`.
///
/// With `preserve_path` the artifact keeps its datastore-relative path; an
/// absolute source keeps its full path below the destination. Otherwise only
/// the file name is used, with `prefix` prepended. Targets that would escape
/// `destination` are rejected.
pub fn destination_for_artifact(
    destination: &Path,
    source: &Path,
    preserve_path: bool,
    prefix: &str,
) -> Result<PathBuf> {
    let destination = normalize(&std::path::absolute(destination)?);

    let target: PathBuf = if preserve_path {
        source
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect()
    } else {
        let name = source.file_name().ok_or_else(|| {
            ButlerError::Artifact(format!("{} has no file name", source.display()))
        })?;
        let mut name_with_prefix = prefix.to_string();
        name_with_prefix.push_str(&name.to_string_lossy());
        PathBuf::from(name_with_prefix)
    };

    let joined = normalize(&destination.join(target));
    if joined == destination || !joined.starts_with(&destination) {
        return Err(ButlerError::Artifact(format!(
            "file path attempts to escape destination directory: '{}'",
            source.display()
        )));
    }
    Ok(joined)
}

/// Lexical normalization; the path does not need to exist.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
