//! Conversion between in-memory objects and artifact bytes.

use crate::error::{ButlerError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Reads and writes one artifact format.
pub trait Formatter {
    /// File extension of written artifacts, without the dot.
    fn extension(&self) -> &str;

    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Decode without a target type. Unreadable bytes give `None`.
    fn read_value(&self, bytes: &[u8]) -> Option<serde_json::Value>;
}

/// Pretty-printed JSON artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn extension(&self) -> &str {
        "json"
    }

    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            ButlerError::Artifact(format!("artifact is not valid JSON for the requested type: {}", e))
        })
    }

    fn read_value(&self, bytes: &[u8]) -> Option<serde_json::Value> {
        match serde_json::from_slice(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Skipping unreadable JSON artifact: {}", e);
                None
            }
        }
    }
}
