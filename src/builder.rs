//! Registry builder for flexible configuration
//!
//! This module provides a builder pattern for creating registries with a
//! custom snapshot path, configuration or dimension universe.

use crate::config::Config;
use crate::dimensions::DimensionConfig;
use crate::error::{ButlerError, Result};
use crate::registry::{Registry, RegistryInner};
#[cfg(feature = "snapshot")]
use std::path::PathBuf;

/// Builder for registries with custom persistence paths and settings.
#[derive(Debug)]
pub struct RegistryBuilder {
    #[cfg(feature = "snapshot")]
    snapshot_path: Option<PathBuf>,
    config: Config,
    in_memory: bool,
}

impl RegistryBuilder {
    /// Create a new builder with default in-memory configuration.
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "snapshot")]
            snapshot_path: None,
            config: Config::default(),
            in_memory: true,
        }
    }

    /// Set the snapshot path for persistence. The file is created on the
    /// first snapshot and loaded on startup.
    #[cfg(feature = "snapshot")]
    pub fn snapshot_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.snapshot_path = Some(path.into());
        self.in_memory = false;
        self
    }

    /// Configure for in-memory storage with no persistence.
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        #[cfg(feature = "snapshot")]
        {
            self.snapshot_path = None;
        }
        self
    }

    /// Set the registry configuration (defaults, snapshot interval, etc.).
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a custom dimension universe instead of the built-in one.
    pub fn universe(mut self, universe: DimensionConfig) -> Self {
        self.config = self.config.with_universe(universe);
        self
    }

    /// Build the registry, loading the snapshot if one is configured.
    pub fn build(self) -> Result<Registry> {
        self.config.validate().map_err(ButlerError::InvalidConfig)?;
        let universe = self.config.build_universe()?;
        #[cfg_attr(not(feature = "snapshot"), allow(unused_mut))]
        let mut inner = RegistryInner::new(universe, self.config);

        #[cfg(feature = "snapshot")]
        if !self.in_memory
            && let Some(snapshot_path) = &self.snapshot_path
        {
            inner.attach_snapshot(snapshot_path)?;
        }

        Ok(Registry::from_inner(inner))
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::CollectionType;

    #[test]
    fn test_builder_default() {
        let builder = RegistryBuilder::new();
        assert!(builder.in_memory);
    }

    #[test]
    fn test_builder_with_config() {
        let config = Config::default()
            .with_default_collections(["HSC/defaults"])
            .with_governor_default("instrument", "HSC");
        let registry = RegistryBuilder::new().config(config).build().unwrap();
        assert_eq!(registry.config().default_collections, vec!["HSC/defaults"]);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let config = Config::default().with_snapshot_auto_ops(0);
        assert!(matches!(
            RegistryBuilder::new().config(config).build(),
            Err(ButlerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_builder_custom_universe() {
        let mut dims = DimensionConfig::default();
        dims.namespace = "lab".to_string();
        dims.version = 7;
        let registry = RegistryBuilder::new().universe(dims).build().unwrap();
        assert_eq!(registry.universe().namespace(), "lab");
        assert_eq!(registry.universe().version(), 7);
    }

    #[cfg(feature = "snapshot")]
    #[test]
    fn test_builder_snapshot_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.snap");

        {
            let mut registry = RegistryBuilder::new().snapshot_path(&path).build().unwrap();
            registry.register_run("run/a").unwrap();
            registry.close().unwrap();
        }
        assert!(path.exists());

        let registry = RegistryBuilder::new().snapshot_path(&path).build().unwrap();
        assert_eq!(registry.collection_type("run/a").unwrap(), CollectionType::Run);
    }

    #[cfg(feature = "snapshot")]
    #[test]
    fn test_builder_in_memory_clears_snapshot_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ignored.snap");
        let mut registry = RegistryBuilder::new()
            .snapshot_path(&path)
            .in_memory()
            .build()
            .unwrap();
        registry.register_run("run/a").unwrap();
        registry.close().unwrap();
        assert!(!path.exists());
    }

    #[cfg(feature = "snapshot")]
    #[test]
    fn test_snapshot_rejects_other_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.snap");
        {
            let mut registry = RegistryBuilder::new().snapshot_path(&path).build().unwrap();
            registry.flush().unwrap();
        }
        let mut dims = DimensionConfig::default();
        dims.namespace = "other".to_string();
        assert!(matches!(
            RegistryBuilder::new().snapshot_path(&path).universe(dims).build(),
            Err(ButlerError::InvalidUniverse(_))
        ));
    }
}
