//! Dimensions: the indexing axes of datasets.
//!
//! A [`DimensionUniverse`] defines every dimension element and how they
//! depend on each other. Dimension *groups* are dependency-closed sets of
//! dimensions, *data coordinates* assign values to a group, and *dimension
//! records* hold the metadata (including timespans and sky regions) for one
//! element row.

mod coordinate;
mod group;
mod record;
mod universe;

pub use coordinate::{DataCoordinate, DataIdValue, SerializedDataId};
pub use group::DimensionGroup;
pub use record::{DimensionRecord, DimensionRecordBuilder, FieldValue};
pub use universe::{DimensionConfig, DimensionUniverse, ElementConfig};

use serde::{Deserialize, Serialize};

/// Type of a dimension's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Int,
    Str,
}

/// Type of a metadata field on a dimension record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Float,
    Str,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub dtype: FieldType,
}

/// One element of a dimension universe: either a dimension with its own key,
/// or a join element keyed only by the dimensions it requires.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionElement {
    name: String,
    key_type: Option<KeyType>,
    primary_key: String,
    required: Vec<String>,
    implied: Vec<String>,
    fields: Vec<FieldSpec>,
    has_timespan: bool,
    has_region: bool,
    governor: bool,
}

impl DimensionElement {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dimension(&self) -> bool {
        self.key_type.is_some()
    }

    pub fn key_type(&self) -> Option<KeyType> {
        self.key_type
    }

    /// Name of the primary key column, e.g. `id` or `name`.
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Dimensions whose values are part of this element's key, excluding
    /// the element itself, in universe order.
    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Dimensions whose values are determined by this element's records.
    pub fn implied(&self) -> &[String] {
        &self.implied
    }

    /// All key dimensions: `required` followed by the element itself when it
    /// is a dimension.
    pub fn key_dimensions(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.required.iter().map(String::as_str).collect();
        if self.is_dimension() {
            keys.push(&self.name);
        }
        keys
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_timespan(&self) -> bool {
        self.has_timespan
    }

    pub fn has_region(&self) -> bool {
        self.has_region
    }

    pub fn is_governor(&self) -> bool {
        self.governor
    }
}
