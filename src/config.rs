//! Repository configuration.

use crate::datasets::DatasetIdGen;
use crate::dimensions::{DataIdValue, DimensionConfig, DimensionUniverse};
use serde::de::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Registry and butler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Write a snapshot after this many mutating operations.
    #[serde(default)]
    pub snapshot_auto_ops: Option<usize>,

    /// Collections searched when a query names none.
    #[serde(default)]
    pub default_collections: Vec<String>,

    /// RUN used by `Butler::put` when none is given.
    #[serde(default)]
    pub default_run: Option<String>,

    /// Governor values applied to queries that do not constrain them.
    #[serde(default)]
    pub governor_defaults: BTreeMap<String, DataIdValue>,

    /// Custom dimension universe; the built-in one when absent.
    #[serde(default)]
    pub universe: Option<DimensionConfig>,

    /// Root directory of the file datastore.
    #[serde(default)]
    pub datastore_root: Option<PathBuf>,

    #[serde(default)]
    pub id_generation: DatasetIdGen,
}

impl Config {
    pub fn with_snapshot_auto_ops(mut self, ops: usize) -> Self {
        self.snapshot_auto_ops = Some(ops);
        self
    }

    pub fn with_default_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_collections = collections.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_run(mut self, run: impl Into<String>) -> Self {
        self.default_run = Some(run.into());
        self
    }

    pub fn with_governor_default(
        mut self,
        dimension: impl Into<String>,
        value: impl Into<DataIdValue>,
    ) -> Self {
        self.governor_defaults.insert(dimension.into(), value.into());
        self
    }

    pub fn with_universe(mut self, universe: DimensionConfig) -> Self {
        self.universe = Some(universe);
        self
    }

    pub fn with_datastore_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.datastore_root = Some(root.into());
        self
    }

    pub fn with_id_generation(mut self, mode: DatasetIdGen) -> Self {
        self.id_generation = mode;
        self
    }

    /// The dimension universe this configuration describes.
    pub fn build_universe(&self) -> crate::Result<Arc<DimensionUniverse>> {
        match &self.universe {
            Some(config) => DimensionUniverse::from_config(config.clone()),
            None => Ok(DimensionUniverse::default_universe()),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.snapshot_auto_ops == Some(0) {
            return Err("Snapshot interval must be greater than zero".to_string());
        }

        if let Some(run) = &self.default_run
            && run.trim().is_empty()
        {
            return Err("Default run must not be empty".to_string());
        }

        if self.default_collections.iter().any(|c| c.trim().is_empty()) {
            return Err("Default collections must not contain empty names".to_string());
        }

        if self.governor_defaults.keys().any(|k| k.is_empty()) {
            return Err("Governor defaults must name a dimension".to_string());
        }

        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Config = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(serde_json::Error::custom(e));
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load configuration from a TOML string (requires the `toml` feature)
    #[cfg(feature = "toml")]
    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        let config: Config = toml::from_str(toml_str)?;
        if let Err(e) = config.validate() {
            return Err(toml::de::Error::custom(e));
        }
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|e| crate::ButlerError::InvalidConfig(e.to_string()))
    }

    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert!(config.snapshot_auto_ops.is_none());
        assert!(config.default_collections.is_empty());
        assert_eq!(config.id_generation, DatasetIdGen::Unique);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = Config::default()
            .with_snapshot_auto_ops(10)
            .with_default_collections(["HSC/defaults"])
            .with_default_run("u/someone/run")
            .with_governor_default("instrument", "HSC")
            .with_id_generation(DatasetIdGen::DataIdTypeRun);

        let json = config.to_json().unwrap();
        assert!(json.contains("\"instrument\": \"HSC\""));
        let back = Config::from_json(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_config_rejects_zero_interval() {
        assert!(Config::from_json(r#"{"snapshot_auto_ops": 0}"#).is_err());
        assert!(Config::from_json(r#"{"default_run": " "}"#).is_err());
    }

    #[test]
    fn test_custom_universe() {
        let mut dims = DimensionConfig::default();
        dims.namespace = "custom".to_string();
        let universe = Config::default().with_universe(dims).build_universe().unwrap();
        assert_eq!(universe.namespace(), "custom");
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_config_toml() {
        let config = Config::from_toml_str(
            r#"
            default_collections = ["a", "b"]
            id_generation = "data_id_type"

            [governor_defaults]
            instrument = "HSC"
            skymap = "rings"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_collections, vec!["a", "b"]);
        assert_eq!(config.id_generation, DatasetIdGen::DataIdType);
        assert_eq!(config.governor_defaults["skymap"], DataIdValue::from("rings"));
        let text = config.to_toml().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }
}
