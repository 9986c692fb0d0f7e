//! Data IDs: values for a group of dimensions.

use super::{DimensionGroup, DimensionRecord, DimensionUniverse, KeyType};
use crate::error::{ButlerError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Value of a single dimension key.
///
/// Serializes as a bare integer or string in human-readable formats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataIdValue {
    Int(i64),
    Str(String),
}

impl DataIdValue {
    pub fn key_type(&self) -> KeyType {
        match self {
            DataIdValue::Int(_) => KeyType::Int,
            DataIdValue::Str(_) => KeyType::Str,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DataIdValue::Int(v) => Some(*v),
            DataIdValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataIdValue::Str(v) => Some(v),
            DataIdValue::Int(_) => None,
        }
    }
}

impl fmt::Display for DataIdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataIdValue::Int(v) => write!(f, "{}", v),
            DataIdValue::Str(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<i64> for DataIdValue {
    fn from(v: i64) -> Self {
        DataIdValue::Int(v)
    }
}

impl From<i32> for DataIdValue {
    fn from(v: i32) -> Self {
        DataIdValue::Int(v as i64)
    }
}

impl From<u32> for DataIdValue {
    fn from(v: u32) -> Self {
        DataIdValue::Int(v as i64)
    }
}

impl From<&str> for DataIdValue {
    fn from(v: &str) -> Self {
        DataIdValue::Str(v.to_string())
    }
}

impl From<String> for DataIdValue {
    fn from(v: String) -> Self {
        DataIdValue::Str(v)
    }
}

#[derive(Serialize)]
enum TaggedValueRef<'a> {
    Int(i64),
    Str(&'a str),
}

#[derive(Deserialize)]
enum TaggedValue {
    Int(i64),
    Str(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlainValue {
    Int(i64),
    Str(String),
}

impl Serialize for DataIdValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match (self, serializer.is_human_readable()) {
            (DataIdValue::Int(v), true) => serializer.serialize_i64(*v),
            (DataIdValue::Str(v), true) => serializer.serialize_str(v),
            (DataIdValue::Int(v), false) => TaggedValueRef::Int(*v).serialize(serializer),
            (DataIdValue::Str(v), false) => TaggedValueRef::Str(v).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for DataIdValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            Ok(match PlainValue::deserialize(deserializer)? {
                PlainValue::Int(v) => DataIdValue::Int(v),
                PlainValue::Str(v) => DataIdValue::Str(v),
            })
        } else {
            Ok(match TaggedValue::deserialize(deserializer)? {
                TaggedValue::Int(v) => DataIdValue::Int(v),
                TaggedValue::Str(v) => DataIdValue::Str(v),
            })
        }
    }
}

/// Plain mapping form of a data ID used for serialization.
pub type SerializedDataId = BTreeMap<String, DataIdValue>;

/// Values for the dimensions of a [`DimensionGroup`].
///
/// Required dimension values are always present. Implied values and
/// dimension records are present once the coordinate has been expanded
/// against a registry. Equality and hashing only consider the group and the
/// required values.
#[derive(Clone)]
pub struct DataCoordinate {
    group: DimensionGroup,
    values: BTreeMap<String, DataIdValue>,
    records: Option<BTreeMap<String, Arc<DimensionRecord>>>,
}

impl DataCoordinate {
    pub fn empty(universe: &Arc<DimensionUniverse>) -> Self {
        Self {
            group: DimensionGroup::empty(universe),
            values: BTreeMap::new(),
            records: None,
        }
    }

    /// Validate `values` against `group`, or against the closure of the
    /// given keys when no group is passed.
    pub fn standardize<I, K, V>(
        universe: &Arc<DimensionUniverse>,
        values: I,
        group: Option<&DimensionGroup>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DataIdValue>,
    {
        let given: BTreeMap<String, DataIdValue> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let group = match group {
            Some(group) => group.clone(),
            None => DimensionGroup::new(universe, given.keys())?,
        };

        for (name, value) in &given {
            let element = universe.element(name)?;
            if !group.contains(name) {
                return Err(ButlerError::InvalidDataId(format!(
                    "dimension '{}' is not part of {}",
                    name, group
                )));
            }
            if element.key_type() != Some(value.key_type()) {
                return Err(ButlerError::InvalidDataId(format!(
                    "value {} has the wrong type for dimension '{}'",
                    value, name
                )));
            }
        }

        let missing: Vec<&str> = group
            .required()
            .iter()
            .filter(|n| !given.contains_key(n.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ButlerError::InvalidDataId(format!(
                "missing values for required dimensions {:?} of {}",
                missing, group
            )));
        }

        Ok(Self {
            group,
            values: given,
            records: None,
        })
    }

    pub fn from_simple(
        universe: &Arc<DimensionUniverse>,
        simple: &SerializedDataId,
        group: Option<&DimensionGroup>,
    ) -> Result<Self> {
        Self::standardize(universe, simple.clone(), group)
    }

    /// Known values (required and, when available, implied).
    pub fn to_simple(&self) -> SerializedDataId {
        self.values.clone()
    }

    pub fn group(&self) -> &DimensionGroup {
        &self.group
    }

    pub fn universe(&self) -> &Arc<DimensionUniverse> {
        self.group.universe()
    }

    pub fn value(&self, dimension: &str) -> Option<&DataIdValue> {
        self.values.get(dimension)
    }

    pub fn values(&self) -> &BTreeMap<String, DataIdValue> {
        &self.values
    }

    /// Required values in universe order.
    pub fn required_values(&self) -> Vec<&DataIdValue> {
        self.group
            .required()
            .iter()
            .filter_map(|n| self.values.get(n))
            .collect()
    }

    /// True if values for implied dimensions are known too.
    pub fn has_full(&self) -> bool {
        self.group
            .implied()
            .iter()
            .all(|n| self.values.contains_key(n))
    }

    /// True once implied values and records have been attached.
    pub fn is_expanded(&self) -> bool {
        self.records.is_some()
    }

    pub fn record(&self, element: &str) -> Option<&Arc<DimensionRecord>> {
        self.records.as_ref().and_then(|r| r.get(element))
    }

    pub fn records(&self) -> Option<&BTreeMap<String, Arc<DimensionRecord>>> {
        self.records.as_ref()
    }

    /// Restrict to a subset of this coordinate's dimensions.
    pub fn subset(&self, group: &DimensionGroup) -> Result<Self> {
        if !group.is_subset(&self.group) {
            return Err(ButlerError::InvalidDataId(format!(
                "{} is not a subset of {}",
                group, self.group
            )));
        }
        let values: BTreeMap<String, DataIdValue> = self
            .values
            .iter()
            .filter(|(k, _)| group.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut subset = Self::standardize(self.universe(), values, Some(group))?;
        if let Some(records) = &self.records {
            let elements: Vec<&str> = group.elements().iter().map(|e| e.name()).collect();
            subset.records = Some(
                records
                    .iter()
                    .filter(|(k, _)| elements.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), Arc::clone(v)))
                    .collect(),
            );
        }
        Ok(subset)
    }

    /// Merge with another coordinate; shared dimensions must agree.
    pub fn union(&self, other: &DataCoordinate) -> Result<Self> {
        let mut values = self.values.clone();
        for (name, value) in &other.values {
            match values.get(name) {
                Some(existing) if existing != value => {
                    return Err(ButlerError::InvalidDataId(format!(
                        "inconsistent values for '{}': {} != {}",
                        name, existing, value
                    )));
                }
                Some(_) => {}
                None => {
                    values.insert(name.clone(), value.clone());
                }
            }
        }
        let group = self.group.union(&other.group)?;
        Self::standardize(self.universe(), values, Some(&group))
    }

    /// Attach implied values and records.
    pub(crate) fn expanded(
        mut self,
        implied: BTreeMap<String, DataIdValue>,
        records: BTreeMap<String, Arc<DimensionRecord>>,
    ) -> Self {
        for (name, value) in implied {
            if self.group.contains(&name) {
                self.values.entry(name).or_insert(value);
            }
        }
        self.records = Some(records);
        self
    }
}

impl PartialEq for DataCoordinate {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.required_values() == other.required_values()
    }
}

impl Eq for DataCoordinate {}

impl Hash for DataCoordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.required_values().hash(state);
    }
}

impl PartialOrd for DataCoordinate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataCoordinate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.group
            .names()
            .cmp(other.group.names())
            .then_with(|| self.required_values().cmp(&other.required_values()))
    }
}

impl fmt::Debug for DataCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataCoordinate({})", self)
    }
}

impl fmt::Display for DataCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .group
            .names()
            .iter()
            .filter_map(|n| self.values.get(n).map(|v| format!("{}: {}", n, v)))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standardize_infers_group() {
        let universe = DimensionUniverse::default_universe();
        let data_id = DataCoordinate::standardize(
            &universe,
            [
                ("instrument", DataIdValue::from("HSC")),
                ("visit", DataIdValue::from(903334)),
            ],
            None,
        )
        .unwrap();
        assert_eq!(data_id.group().required(), &["instrument", "visit"]);
        assert!(!data_id.has_full());
        assert_eq!(data_id.to_string(), "{instrument: 'HSC', visit: 903334}");
    }

    #[test]
    fn test_missing_required_value() {
        let universe = DimensionUniverse::default_universe();
        let err =
            DataCoordinate::standardize(&universe, [("visit", DataIdValue::from(1))], None)
                .unwrap_err();
        assert!(matches!(err, ButlerError::InvalidDataId(_)));
    }

    #[test]
    fn test_wrong_key_type() {
        let universe = DimensionUniverse::default_universe();
        let result = DataCoordinate::standardize(
            &universe,
            [
                ("instrument", DataIdValue::from(1)),
                ("detector", DataIdValue::from(2)),
            ],
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_subset_and_union() {
        let universe = DimensionUniverse::default_universe();
        let full = DataCoordinate::standardize(
            &universe,
            [
                ("instrument", DataIdValue::from("HSC")),
                ("visit", DataIdValue::from(10)),
                ("detector", DataIdValue::from(5)),
            ],
            None,
        )
        .unwrap();
        let group = DimensionGroup::new(&universe, ["detector"]).unwrap();
        let det = full.subset(&group).unwrap();
        assert_eq!(det.value("detector"), Some(&DataIdValue::Int(5)));
        assert_eq!(det.value("visit"), None);

        let merged = det.union(&full).unwrap();
        assert_eq!(merged, full);

        let other = DataCoordinate::standardize(
            &universe,
            [
                ("instrument", DataIdValue::from("LSSTCam")),
                ("detector", DataIdValue::from(5)),
            ],
            None,
        )
        .unwrap();
        assert!(other.union(&full).is_err());
    }

    #[test]
    fn test_equality_ignores_implied_values() {
        let universe = DimensionUniverse::default_universe();
        let a = DataCoordinate::standardize(
            &universe,
            [
                ("instrument", DataIdValue::from("HSC")),
                ("physical_filter", DataIdValue::from("HSC-R")),
            ],
            None,
        )
        .unwrap();
        let b = DataCoordinate::standardize(
            &universe,
            [
                ("instrument", DataIdValue::from("HSC")),
                ("physical_filter", DataIdValue::from("HSC-R")),
                ("band", DataIdValue::from("r")),
            ],
            None,
        )
        .unwrap();
        assert!(b.has_full());
        assert_eq!(a, b);
    }
}
