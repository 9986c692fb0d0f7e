//! The set of all dimension elements known to a repository.

use super::{DimensionElement, FieldSpec, FieldType, KeyType};
use crate::error::{ButlerError, Result};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Serializable definition of one dimension element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementConfig {
    pub name: String,
    /// `None` for join elements that are not dimensions themselves.
    #[serde(default)]
    pub key_type: Option<KeyType>,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub implies: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub timespan: bool,
    #[serde(default)]
    pub region: bool,
    #[serde(default)]
    pub governor: bool,
}

impl ElementConfig {
    fn dimension(name: &str, key_type: KeyType) -> Self {
        Self {
            name: name.to_string(),
            key_type: Some(key_type),
            primary_key: None,
            requires: Vec::new(),
            implies: Vec::new(),
            fields: Vec::new(),
            timespan: false,
            region: false,
            governor: false,
        }
    }

    fn join(name: &str) -> Self {
        Self {
            key_type: None,
            ..Self::dimension(name, KeyType::Int)
        }
    }

    fn requires(mut self, names: &[&str]) -> Self {
        self.requires = names.iter().map(|s| s.to_string()).collect();
        self
    }

    fn implies(mut self, names: &[&str]) -> Self {
        self.implies = names.iter().map(|s| s.to_string()).collect();
        self
    }

    fn field(mut self, name: &str, dtype: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            dtype,
        });
        self
    }

    fn with_timespan(mut self) -> Self {
        self.timespan = true;
        self
    }

    fn with_region(mut self) -> Self {
        self.region = true;
        self
    }

    fn governor(mut self) -> Self {
        self.governor = true;
        self
    }
}

/// Serializable definition of a dimension universe.
///
/// Elements must be listed so that every dependency precedes its dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub namespace: String,
    pub version: u32,
    pub elements: Vec<ElementConfig>,
}

impl Default for DimensionConfig {
    fn default() -> Self {
        use FieldType::*;
        use KeyType::{Int as IntKey, Str as StrKey};

        let elements = vec![
            ElementConfig::dimension("instrument", StrKey)
                .governor()
                .field("visit_max", Int)
                .field("detector_max", Int)
                .field("class_name", Str),
            ElementConfig::dimension("band", StrKey),
            ElementConfig::dimension("physical_filter", StrKey)
                .requires(&["instrument"])
                .implies(&["band"]),
            ElementConfig::dimension("detector", IntKey)
                .requires(&["instrument"])
                .field("full_name", Str)
                .field("purpose", Str),
            ElementConfig::dimension("day_obs", IntKey)
                .requires(&["instrument"])
                .with_timespan(),
            ElementConfig::dimension("exposure", IntKey)
                .requires(&["instrument"])
                .implies(&["physical_filter", "day_obs"])
                .field("obs_id", Str)
                .field("exposure_time", Float)
                .field("observation_type", Str)
                .with_timespan(),
            ElementConfig::dimension("visit", IntKey)
                .requires(&["instrument"])
                .implies(&["physical_filter", "day_obs"])
                .field("name", Str)
                .field("exposure_time", Float)
                .field("target_name", Str)
                .with_timespan()
                .with_region(),
            ElementConfig::join("visit_detector_region")
                .requires(&["visit", "detector"])
                .with_region(),
            ElementConfig::dimension("skymap", StrKey)
                .governor()
                .field("tract_max", Int)
                .field("patch_nx_max", Int)
                .field("patch_ny_max", Int),
            ElementConfig::dimension("tract", IntKey)
                .requires(&["skymap"])
                .with_region(),
            ElementConfig::dimension("patch", IntKey)
                .requires(&["skymap", "tract"])
                .field("cell_x", Int)
                .field("cell_y", Int)
                .with_region(),
        ];

        Self {
            namespace: "butlerdb".to_string(),
            version: 1,
            elements,
        }
    }
}

static DEFAULT_UNIVERSE: Lazy<Arc<DimensionUniverse>> = Lazy::new(|| {
    Arc::new(
        DimensionUniverse::build(DimensionConfig::default())
            .unwrap_or_else(|e| panic!("built-in dimension configuration is invalid: {}", e)),
    )
});

/// All dimension elements of a repository, in dependency order.
#[derive(Debug)]
pub struct DimensionUniverse {
    namespace: String,
    version: u32,
    elements: Vec<DimensionElement>,
    index: FxHashMap<String, usize>,
    config: DimensionConfig,
}

impl DimensionUniverse {
    /// The built-in universe, shared across the process.
    pub fn default_universe() -> Arc<DimensionUniverse> {
        Arc::clone(&DEFAULT_UNIVERSE)
    }

    pub fn from_config(config: DimensionConfig) -> Result<Arc<DimensionUniverse>> {
        Ok(Arc::new(Self::build(config)?))
    }

    fn build(config: DimensionConfig) -> Result<DimensionUniverse> {
        let mut elements: Vec<DimensionElement> = Vec::with_capacity(config.elements.len());
        let mut index: FxHashMap<String, usize> = FxHashMap::default();

        for element_config in &config.elements {
            let name = &element_config.name;
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ButlerError::InvalidUniverse(format!(
                    "invalid element name '{}'",
                    name
                )));
            }
            if index.contains_key(name) {
                return Err(ButlerError::InvalidUniverse(format!(
                    "duplicate element '{}'",
                    name
                )));
            }

            let lookup = |dep: &String| -> Result<&DimensionElement> {
                let dep_element = index.get(dep).map(|&i| &elements[i]).ok_or_else(|| {
                    ButlerError::InvalidUniverse(format!(
                        "element '{}' depends on '{}', which is not defined before it",
                        name, dep
                    ))
                })?;
                if !dep_element.is_dimension() {
                    return Err(ButlerError::InvalidUniverse(format!(
                        "element '{}' depends on join element '{}'",
                        name, dep
                    )));
                }
                Ok(dep_element)
            };

            let mut required: Vec<usize> = Vec::new();
            for dep in &element_config.requires {
                let dep_element = lookup(dep)?;
                for parent in dep_element.required() {
                    required.push(index[parent]);
                }
                required.push(index[dep]);
            }
            for dep in &element_config.implies {
                lookup(dep)?;
            }
            required.sort_unstable();
            required.dedup();

            let mut field_names: Vec<&str> = Vec::new();
            for field in &element_config.fields {
                if field_names.contains(&field.name.as_str()) {
                    return Err(ButlerError::InvalidUniverse(format!(
                        "duplicate field '{}' in element '{}'",
                        field.name, name
                    )));
                }
                field_names.push(&field.name);
            }

            if element_config.governor && !element_config.requires.is_empty() {
                return Err(ButlerError::InvalidUniverse(format!(
                    "governor '{}' cannot require other dimensions",
                    name
                )));
            }

            let primary_key = element_config.primary_key.clone().unwrap_or_else(|| {
                match element_config.key_type {
                    Some(KeyType::Str) => "name".to_string(),
                    _ => "id".to_string(),
                }
            });

            let element = DimensionElement {
                name: name.clone(),
                key_type: element_config.key_type,
                primary_key,
                required: required
                    .into_iter()
                    .map(|i| elements[i].name.clone())
                    .collect(),
                implied: element_config.implies.clone(),
                fields: element_config.fields.clone(),
                has_timespan: element_config.timespan,
                has_region: element_config.region,
                governor: element_config.governor,
            };
            index.insert(name.clone(), elements.len());
            elements.push(element);
        }

        Ok(DimensionUniverse {
            namespace: config.namespace.clone(),
            version: config.version,
            elements,
            index,
            config,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn config(&self) -> &DimensionConfig {
        &self.config
    }

    pub fn elements(&self) -> &[DimensionElement] {
        &self.elements
    }

    pub fn element(&self, name: &str) -> Result<&DimensionElement> {
        self.get(name)
            .ok_or_else(|| ButlerError::UnknownElement(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&DimensionElement> {
        self.index.get(name).map(|&i| &self.elements[i])
    }

    /// Position of an element in dependency order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// True if `name` is a dimension (not a join element).
    pub fn is_dimension(&self, name: &str) -> bool {
        self.get(name).is_some_and(|e| e.is_dimension())
    }

    pub fn governors(&self) -> impl Iterator<Item = &DimensionElement> {
        self.elements.iter().filter(|e| e.governor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_universe_resolves_required_chain() {
        let universe = DimensionUniverse::default_universe();
        let patch = universe.element("patch").unwrap();
        assert_eq!(patch.required(), &["skymap".to_string(), "tract".to_string()]);

        let vdr = universe.element("visit_detector_region").unwrap();
        assert!(!vdr.is_dimension());
        assert_eq!(
            vdr.required(),
            &[
                "instrument".to_string(),
                "detector".to_string(),
                "visit".to_string()
            ]
        );
    }

    #[test]
    fn test_dependency_must_precede_dependent() {
        let mut config = DimensionConfig::default();
        config.elements.swap(0, 2);
        let err = DimensionUniverse::from_config(config).unwrap_err();
        assert!(matches!(err, ButlerError::InvalidUniverse(_)));
    }

    #[test]
    fn test_duplicate_element_rejected() {
        let mut config = DimensionConfig::default();
        let dup = config.elements[1].clone();
        config.elements.push(dup);
        assert!(DimensionUniverse::from_config(config).is_err());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = DimensionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: DimensionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_primary_key_defaults() {
        let universe = DimensionUniverse::default_universe();
        assert_eq!(universe.element("instrument").unwrap().primary_key(), "name");
        assert_eq!(universe.element("visit").unwrap().primary_key(), "id");
    }
}
