//! Dimension records: metadata rows for one dimension element.

use super::{DataCoordinate, DataIdValue, DimensionGroup, DimensionUniverse, FieldType};
use crate::error::{ButlerError, Result};
use crate::time::Timespan;
use geo::Polygon;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Value of a metadata field on a dimension record.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    #[default]
    Null,
}

impl FieldValue {
    pub fn dtype(&self) -> Option<FieldType> {
        match self {
            FieldValue::Int(_) => Some(FieldType::Int),
            FieldValue::Float(_) => Some(FieldType::Float),
            FieldValue::Str(_) => Some(FieldType::Str),
            FieldValue::Bool(_) => Some(FieldType::Bool),
            FieldValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Coerce to the declared type of a field, if compatible.
    fn coerce(self, dtype: FieldType) -> Option<FieldValue> {
        match (self, dtype) {
            (FieldValue::Null, _) => Some(FieldValue::Null),
            (FieldValue::Int(v), FieldType::Float) => Some(FieldValue::Float(v as f64)),
            (value, dtype) if value.dtype() == Some(dtype) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Str(v) => write!(f, "'{}'", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Null => write!(f, "NULL"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

// Plain values in human-readable formats, tagged variants in binary ones
// (bincode cannot deserialize untagged enums).
#[derive(Serialize)]
enum TaggedFieldRef<'a> {
    Int(i64),
    Float(f64),
    Str(&'a str),
    Bool(bool),
    Null,
}

#[derive(Deserialize)]
enum TaggedField {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlainField {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            match self {
                FieldValue::Int(v) => serializer.serialize_i64(*v),
                FieldValue::Float(v) => serializer.serialize_f64(*v),
                FieldValue::Str(v) => serializer.serialize_str(v),
                FieldValue::Bool(v) => serializer.serialize_bool(*v),
                FieldValue::Null => serializer.serialize_none(),
            }
        } else {
            let tagged = match self {
                FieldValue::Int(v) => TaggedFieldRef::Int(*v),
                FieldValue::Float(v) => TaggedFieldRef::Float(*v),
                FieldValue::Str(v) => TaggedFieldRef::Str(v),
                FieldValue::Bool(v) => TaggedFieldRef::Bool(*v),
                FieldValue::Null => TaggedFieldRef::Null,
            };
            tagged.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            Ok(match PlainField::deserialize(deserializer)? {
                PlainField::Bool(v) => FieldValue::Bool(v),
                PlainField::Int(v) => FieldValue::Int(v),
                PlainField::Float(v) => FieldValue::Float(v),
                PlainField::Str(v) => FieldValue::Str(v),
                PlainField::Null => FieldValue::Null,
            })
        } else {
            Ok(match TaggedField::deserialize(deserializer)? {
                TaggedField::Int(v) => FieldValue::Int(v),
                TaggedField::Float(v) => FieldValue::Float(v),
                TaggedField::Str(v) => FieldValue::Str(v),
                TaggedField::Bool(v) => FieldValue::Bool(v),
                TaggedField::Null => FieldValue::Null,
            })
        }
    }
}

/// One row of a dimension element's table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRecord {
    element: String,
    keys: BTreeMap<String, DataIdValue>,
    implied: BTreeMap<String, DataIdValue>,
    fields: BTreeMap<String, FieldValue>,
    timespan: Option<Timespan>,
    region: Option<Polygon<f64>>,
}

impl DimensionRecord {
    pub fn builder(element: impl Into<String>) -> DimensionRecordBuilder {
        DimensionRecordBuilder {
            element: element.into(),
            keys: BTreeMap::new(),
            implied: BTreeMap::new(),
            fields: BTreeMap::new(),
            timespan: None,
            region: None,
        }
    }

    pub fn element(&self) -> &str {
        &self.element
    }

    /// Values of the element's key dimensions.
    pub fn keys(&self) -> &BTreeMap<String, DataIdValue> {
        &self.keys
    }

    /// Values of the dimensions this record implies.
    pub fn implied(&self) -> &BTreeMap<String, DataIdValue> {
        &self.implied
    }

    /// The element's own key value (`None` for join elements).
    pub fn key(&self) -> Option<&DataIdValue> {
        self.keys.get(&self.element)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn timespan(&self) -> Option<&Timespan> {
        self.timespan.as_ref()
    }

    pub fn region(&self) -> Option<&Polygon<f64>> {
        self.region.as_ref()
    }

    /// Key values ordered as the element's key dimensions.
    pub(crate) fn key_tuple(&self, universe: &DimensionUniverse) -> Result<Vec<DataIdValue>> {
        let element = universe.element(&self.element)?;
        element
            .key_dimensions()
            .into_iter()
            .map(|d| {
                self.keys.get(d).cloned().ok_or_else(|| {
                    ButlerError::InvalidDataId(format!("record of '{}' lacks '{}'", self.element, d))
                })
            })
            .collect()
    }

    /// The data ID this record describes, including implied values.
    pub fn data_id(&self, universe: &Arc<DimensionUniverse>) -> Result<DataCoordinate> {
        let element = universe.element(&self.element)?;
        let group = DimensionGroup::new(universe, element.key_dimensions())?;
        let values = self
            .keys
            .iter()
            .chain(self.implied.iter())
            .filter(|(k, _)| group.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()));
        DataCoordinate::standardize(universe, values, Some(&group))
    }
}

impl fmt::Display for DimensionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.keys.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}({})", self.element, keys.join(", "))
    }
}

/// Incrementally assembles a [`DimensionRecord`] and validates it against
/// the universe on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct DimensionRecordBuilder {
    element: String,
    keys: BTreeMap<String, DataIdValue>,
    implied: BTreeMap<String, DataIdValue>,
    fields: BTreeMap<String, FieldValue>,
    timespan: Option<Timespan>,
    region: Option<Polygon<f64>>,
}

impl DimensionRecordBuilder {
    pub fn key(mut self, dimension: impl Into<String>, value: impl Into<DataIdValue>) -> Self {
        self.keys.insert(dimension.into(), value.into());
        self
    }

    pub fn implied(mut self, dimension: impl Into<String>, value: impl Into<DataIdValue>) -> Self {
        self.implied.insert(dimension.into(), value.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn timespan(mut self, timespan: Timespan) -> Self {
        self.timespan = Some(timespan);
        self
    }

    pub fn region(mut self, region: Polygon<f64>) -> Self {
        self.region = Some(region);
        self
    }

    pub fn build(self, universe: &DimensionUniverse) -> Result<DimensionRecord> {
        let element = universe.element(&self.element)?;
        let invalid = |msg: String| ButlerError::InvalidDataId(format!("{}: {}", self.element, msg));

        let key_dims = element.key_dimensions();
        for dim in &key_dims {
            let value = self
                .keys
                .get(*dim)
                .ok_or_else(|| invalid(format!("missing key '{}'", dim)))?;
            check_key_type(universe, dim, value).map_err(invalid)?;
        }
        if let Some(extra) = self.keys.keys().find(|k| !key_dims.contains(&k.as_str())) {
            return Err(invalid(format!("'{}' is not a key of this element", extra)));
        }

        for dim in element.implied() {
            let value = self
                .implied
                .get(dim)
                .ok_or_else(|| invalid(format!("missing implied value '{}'", dim)))?;
            check_key_type(universe, dim, value).map_err(invalid)?;
        }
        if let Some(extra) = self
            .implied
            .keys()
            .find(|k| !element.implied().contains(k))
        {
            return Err(invalid(format!("'{}' is not implied by this element", extra)));
        }

        let mut fields = BTreeMap::new();
        for (name, value) in self.fields {
            let spec = element
                .field(&name)
                .ok_or_else(|| invalid(format!("unknown field '{}'", name)))?;
            let shown = value.to_string();
            let value = value
                .coerce(spec.dtype)
                .ok_or_else(|| invalid(format!("{} is not a valid {:?} for '{}'", shown, spec.dtype, name)))?;
            fields.insert(name, value);
        }
        for spec in element.fields() {
            fields.entry(spec.name.clone()).or_insert(FieldValue::Null);
        }

        if self.timespan.is_some() && !element.has_timespan() {
            return Err(invalid("element has no timespan".to_string()));
        }
        if self.region.is_some() && !element.has_region() {
            return Err(invalid("element has no region".to_string()));
        }

        Ok(DimensionRecord {
            element: self.element,
            keys: self.keys,
            implied: self.implied,
            fields,
            timespan: self.timespan,
            region: self.region,
        })
    }
}

fn check_key_type(
    universe: &DimensionUniverse,
    dimension: &str,
    value: &DataIdValue,
) -> std::result::Result<(), String> {
    let expected = universe
        .get(dimension)
        .and_then(|e| e.key_type())
        .ok_or_else(|| format!("'{}' is not a dimension", dimension))?;
    if expected != value.key_type() {
        return Err(format!("value {} has the wrong type for '{}'", value, dimension));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn visit_record(universe: &DimensionUniverse) -> DimensionRecord {
        DimensionRecord::builder("visit")
            .key("instrument", "HSC")
            .key("visit", 903334)
            .implied("physical_filter", "HSC-R")
            .implied("day_obs", 20130617)
            .field("exposure_time", 30)
            .field("name", "v903334")
            .region(polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)])
            .build(universe)
            .unwrap()
    }

    #[test]
    fn test_builder_validates_and_coerces() {
        let universe = DimensionUniverse::default_universe();
        let record = visit_record(&universe);
        assert_eq!(record.field("exposure_time"), Some(&FieldValue::Float(30.0)));
        assert_eq!(record.field("target_name"), Some(&FieldValue::Null));
        assert_eq!(record.key(), Some(&DataIdValue::Int(903334)));
    }

    #[test]
    fn test_builder_rejects_bad_records() {
        let universe = DimensionUniverse::default_universe();
        let missing_key = DimensionRecord::builder("detector")
            .key("detector", 1)
            .build(&universe);
        assert!(missing_key.is_err());

        let bad_field = DimensionRecord::builder("detector")
            .key("instrument", "HSC")
            .key("detector", 1)
            .field("purpose", 3)
            .build(&universe);
        assert!(bad_field.is_err());

        let no_timespan = DimensionRecord::builder("detector")
            .key("instrument", "HSC")
            .key("detector", 1)
            .timespan(Timespan::unbounded())
            .build(&universe);
        assert!(no_timespan.is_err());

        let missing_implied = DimensionRecord::builder("physical_filter")
            .key("instrument", "HSC")
            .key("physical_filter", "HSC-R")
            .build(&universe);
        assert!(missing_implied.is_err());
    }

    #[test]
    fn test_data_id_includes_implied_values() {
        let universe = DimensionUniverse::default_universe();
        let record = visit_record(&universe);
        let data_id = record.data_id(&universe).unwrap();
        assert!(data_id.has_full());
        assert_eq!(
            data_id.value("physical_filter"),
            Some(&DataIdValue::from("HSC-R"))
        );
    }

    #[test]
    fn test_field_value_json_is_plain() {
        let json = serde_json::to_string(&vec![
            FieldValue::Int(1),
            FieldValue::Float(2.5),
            FieldValue::Str("a".into()),
            FieldValue::Bool(true),
            FieldValue::Null,
        ])
        .unwrap();
        assert_eq!(json, r#"[1,2.5,"a",true,null]"#);
        let back: Vec<FieldValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[3], FieldValue::Bool(true));
        assert_eq!(back[4], FieldValue::Null);
    }

    #[cfg(feature = "snapshot")]
    #[test]
    fn test_record_survives_bincode() {
        let universe = DimensionUniverse::default_universe();
        let record = visit_record(&universe);
        let bytes = bincode::serialize(&record).unwrap();
        let back: DimensionRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, record);
    }
}
