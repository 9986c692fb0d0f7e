//! Dependency-closed sets of dimensions.

use super::{DimensionElement, DimensionUniverse};
use crate::error::{ButlerError, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A set of dimensions closed under required and implied dependencies,
/// ordered as in the universe.
#[derive(Clone)]
pub struct DimensionGroup {
    universe: Arc<DimensionUniverse>,
    names: Vec<String>,
    required: Vec<String>,
    implied: Vec<String>,
}

impl DimensionGroup {
    /// Build the closure of `names`. Every name must be a dimension.
    pub fn new<I, S>(universe: &Arc<DimensionUniverse>, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut members: BTreeSet<usize> = BTreeSet::new();
        let mut pending: Vec<usize> = Vec::new();

        for name in names {
            let name = name.as_ref();
            let element = universe.element(name)?;
            if !element.is_dimension() {
                return Err(ButlerError::InvalidDataId(format!(
                    "'{}' is a join element, not a dimension",
                    name
                )));
            }
            pending.extend(universe.position(name));
        }

        while let Some(position) = pending.pop() {
            if !members.insert(position) {
                continue;
            }
            let element = &universe.elements()[position];
            for dep in element.required().iter().chain(element.implied()) {
                pending.extend(universe.position(dep));
            }
        }

        let names: Vec<String> = members
            .iter()
            .map(|&i| universe.elements()[i].name().to_string())
            .collect();

        let implied_set: BTreeSet<&str> = names
            .iter()
            .filter_map(|n| universe.get(n))
            .flat_map(|e| e.implied().iter().map(String::as_str))
            .collect();

        let (implied, required): (Vec<String>, Vec<String>) = names
            .iter()
            .cloned()
            .partition(|n| implied_set.contains(n.as_str()));

        Ok(Self {
            universe: Arc::clone(universe),
            names,
            required,
            implied,
        })
    }

    pub fn empty(universe: &Arc<DimensionUniverse>) -> Self {
        Self {
            universe: Arc::clone(universe),
            names: Vec::new(),
            required: Vec::new(),
            implied: Vec::new(),
        }
    }

    pub fn universe(&self) -> &Arc<DimensionUniverse> {
        &self.universe
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Dimensions whose values must be given to identify a row.
    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Dimensions whose values follow from the records of others.
    pub fn implied(&self) -> &[String] {
        &self.implied
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn is_subset(&self, other: &DimensionGroup) -> bool {
        self.names.iter().all(|n| other.contains(n))
    }

    pub fn union(&self, other: &DimensionGroup) -> Result<DimensionGroup> {
        Self::new(&self.universe, self.names.iter().chain(other.names.iter()))
    }

    pub fn governors(&self) -> Vec<&str> {
        self.names
            .iter()
            .filter(|n| self.universe.get(n).is_some_and(|e| e.is_governor()))
            .map(String::as_str)
            .collect()
    }

    /// All elements (dimensions and join elements) whose key dimensions are
    /// members of this group.
    pub fn elements(&self) -> Vec<&DimensionElement> {
        self.universe
            .elements()
            .iter()
            .filter(|e| e.key_dimensions().iter().all(|d| self.contains(d)))
            .collect()
    }
}

impl PartialEq for DimensionGroup {
    fn eq(&self, other: &Self) -> bool {
        self.names == other.names
    }
}

impl Eq for DimensionGroup {}

impl Hash for DimensionGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.names.hash(state);
    }
}

impl fmt::Debug for DimensionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DimensionGroup({:?})", self.names)
    }
}

impl fmt::Display for DimensionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_adds_required_and_implied() {
        let universe = DimensionUniverse::default_universe();
        let group = DimensionGroup::new(&universe, ["visit"]).unwrap();
        assert_eq!(
            group.names(),
            &["instrument", "band", "physical_filter", "day_obs", "visit"]
        );
        assert_eq!(group.required(), &["instrument", "visit"]);
        assert_eq!(group.implied(), &["band", "physical_filter", "day_obs"]);
    }

    #[test]
    fn test_elements_include_join_elements() {
        let universe = DimensionUniverse::default_universe();
        let group = DimensionGroup::new(&universe, ["visit", "detector"]).unwrap();
        let names: Vec<&str> = group.elements().iter().map(|e| e.name()).collect();
        assert!(names.contains(&"visit_detector_region"));
        assert!(!names.contains(&"exposure"));
    }

    #[test]
    fn test_union_and_subset() {
        let universe = DimensionUniverse::default_universe();
        let a = DimensionGroup::new(&universe, ["detector"]).unwrap();
        let b = DimensionGroup::new(&universe, ["visit"]).unwrap();
        let u = a.union(&b).unwrap();
        assert!(a.is_subset(&u));
        assert!(b.is_subset(&u));
        assert_eq!(u.governors(), vec!["instrument"]);
    }

    #[test]
    fn test_join_element_is_rejected() {
        let universe = DimensionUniverse::default_universe();
        assert!(DimensionGroup::new(&universe, ["visit_detector_region"]).is_err());
        assert!(DimensionGroup::new(&universe, ["nope"]).is_err());
    }
}
