//! Snapshot-based persistence for registry state.
//!
//! A snapshot is written to a temporary file, synced and then atomically
//! renamed over the previous one.

use crate::error::{ButlerError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const SNAPSHOT_MAGIC: &[u8] = b"BUTLERDB_SNAPSHOT";
const SNAPSHOT_VERSION: u8 = 1;

/// Magic, version, timestamp and payload length.
const HEADER_LEN: u64 = SNAPSHOT_MAGIC.len() as u64 + 1 + 12 + 8;

#[derive(Debug, Clone, Default)]
pub struct SnapshotConfig {
    pub auto_snapshot_ops: Option<usize>,
}

#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    config: SnapshotConfig,
    ops_since_snapshot: usize,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(path: P, config: SnapshotConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
            ops_since_snapshot: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the stored state; `None` if there is no snapshot yet.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if !self.exists() {
            return Ok(None);
        }

        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Ok(None);
        }

        let mut reader = BufReader::new(file);

        let mut magic = vec![0u8; SNAPSHOT_MAGIC.len()];
        reader.read_exact(&mut magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(ButlerError::InvalidFormat);
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(ButlerError::InvalidFormat);
        }

        let mut timestamp_bytes = [0u8; 12];
        reader.read_exact(&mut timestamp_bytes)?;

        let payload_len = read_u64(&mut reader)?;
        if payload_len > file_len.saturating_sub(HEADER_LEN) {
            return Err(ButlerError::InvalidFormat);
        }
        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload)?;

        let state = bincode::deserialize(&payload).map_err(|e| {
            ButlerError::SerializationErrorWithContext(format!(
                "failed to decode snapshot {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Some(state))
    }

    pub fn save<T: Serialize>(&mut self, state: &T) -> Result<()> {
        let payload = bincode::serialize(state).map_err(|e| {
            ButlerError::SerializationErrorWithContext(format!("failed to encode snapshot: {}", e))
        })?;

        let temp_path = self.temp_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);

        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&[SNAPSHOT_VERSION])?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| ButlerError::InvalidTimestamp)?;
        writer.write_all(&timestamp.as_secs().to_le_bytes())?;
        writer.write_all(&timestamp.subsec_nanos().to_le_bytes())?;

        writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        writer.write_all(&payload)?;

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;
        self.sync_parent_dir()?;

        self.ops_since_snapshot = 0;
        log::info!(
            "Wrote registry snapshot to {} ({} bytes)",
            self.path.display(),
            payload.len()
        );
        Ok(())
    }

    pub fn record_operation(&mut self) {
        self.ops_since_snapshot += 1;
    }

    pub fn should_snapshot(&self) -> bool {
        if let Some(threshold) = self.config.auto_snapshot_ops {
            self.ops_since_snapshot >= threshold
        } else {
            false
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        if let Some(name) = temp.file_name() {
            let mut new_name = name.to_string_lossy().into_owned();
            new_name.push_str(".tmp");
            temp.set_file_name(new_name);
        }
        temp
    }

    fn sync_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
        Ok(())
    }
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
