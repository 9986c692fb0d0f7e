//! RUN, TAGGED and CHAINED collections.

use crate::dimensions::DataIdValue;
use crate::error::{ButlerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Identity of a dataset within a RUN or TAGGED collection: dataset type
/// name plus required data ID values.
pub(crate) type DatasetKey = (String, Vec<DataIdValue>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectionType {
    Run,
    Tagged,
    Chained,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::Run => "RUN",
            CollectionType::Tagged => "TAGGED",
            CollectionType::Chained => "CHAINED",
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum CollectionRecord {
    Run,
    Tagged { members: BTreeMap<DatasetKey, Uuid> },
    Chained { children: Vec<String> },
}

impl CollectionRecord {
    fn collection_type(&self) -> CollectionType {
        match self {
            CollectionRecord::Run => CollectionType::Run,
            CollectionRecord::Tagged { .. } => CollectionType::Tagged,
            CollectionRecord::Chained { .. } => CollectionType::Chained,
        }
    }
}

/// All collections of a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct CollectionManager {
    records: BTreeMap<String, CollectionRecord>,
}

impl CollectionManager {
    /// Register a collection. Returns `false` if it already exists with the
    /// same type.
    pub fn register(&mut self, name: &str, collection_type: CollectionType) -> Result<bool> {
        validate_name(name)?;
        if let Some(existing) = self.records.get(name) {
            let actual = existing.collection_type();
            if actual != collection_type {
                return Err(ButlerError::CollectionTypeMismatch {
                    name: name.to_string(),
                    expected: collection_type.to_string(),
                    actual: actual.to_string(),
                });
            }
            return Ok(false);
        }
        let record = match collection_type {
            CollectionType::Run => CollectionRecord::Run,
            CollectionType::Tagged => CollectionRecord::Tagged {
                members: BTreeMap::new(),
            },
            CollectionType::Chained => CollectionRecord::Chained {
                children: Vec::new(),
            },
        };
        self.records.insert(name.to_string(), record);
        Ok(true)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn collection_type(&self, name: &str) -> Result<CollectionType> {
        self.records
            .get(name)
            .map(CollectionRecord::collection_type)
            .ok_or_else(|| ButlerError::MissingCollection(name.to_string()))
    }

    pub fn require_type(&self, name: &str, expected: CollectionType) -> Result<()> {
        let actual = self.collection_type(name)?;
        if actual != expected {
            return Err(ButlerError::CollectionTypeMismatch {
                name: name.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_chain<S: AsRef<str>>(&mut self, parent: &str, children: &[S]) -> Result<()> {
        self.require_type(parent, CollectionType::Chained)?;
        let mut unique: Vec<String> = Vec::with_capacity(children.len());
        for child in children {
            let child = child.as_ref();
            if !self.records.contains_key(child) {
                return Err(ButlerError::MissingCollection(child.to_string()));
            }
            if child == parent || self.reaches(child, parent) {
                return Err(ButlerError::ChainCycle {
                    parent: parent.to_string(),
                    child: child.to_string(),
                });
            }
            if !unique.iter().any(|c| c == child) {
                unique.push(child.to_string());
            }
        }
        if let Some(CollectionRecord::Chained { children }) = self.records.get_mut(parent) {
            *children = unique;
        }
        Ok(())
    }

    /// True if the chain rooted at `from` contains `target`.
    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(name) = stack.pop() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(CollectionRecord::Chained { children }) = self.records.get(name) {
                for child in children {
                    if child == target {
                        return true;
                    }
                    stack.push(child);
                }
            }
        }
        false
    }

    pub fn get_chain(&self, name: &str) -> Result<Vec<String>> {
        match self.records.get(name) {
            Some(CollectionRecord::Chained { children }) => Ok(children.clone()),
            Some(other) => Err(ButlerError::CollectionTypeMismatch {
                name: name.to_string(),
                expected: CollectionType::Chained.to_string(),
                actual: other.collection_type().to_string(),
            }),
            None => Err(ButlerError::MissingCollection(name.to_string())),
        }
    }

    /// Chains that list `name` directly.
    pub fn parents(&self, name: &str) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|(parent, record)| match record {
                CollectionRecord::Chained { children } if children.iter().any(|c| c == name) => {
                    Some(parent.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Remove a collection that no chain refers to. RUN ownership of
    /// datasets is checked by the caller.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if !self.records.contains_key(name) {
            return Err(ButlerError::MissingCollection(name.to_string()));
        }
        let parents = self.parents(name);
        if !parents.is_empty() {
            return Err(ButlerError::CollectionInUse {
                name: name.to_string(),
                reason: format!("it is a child of {:?}", parents),
            });
        }
        self.records.remove(name);
        Ok(())
    }

    /// Flatten chains depth-first into an ordered search path of RUN and
    /// TAGGED collections, keeping the first occurrence of each.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<String>> {
        let mut resolved = Vec::new();
        let mut seen = BTreeSet::new();
        for name in names {
            self.resolve_into(name.as_ref(), &mut resolved, &mut seen)?;
        }
        Ok(resolved)
    }

    fn resolve_into(
        &self,
        name: &str,
        resolved: &mut Vec<String>,
        seen: &mut BTreeSet<String>,
    ) -> Result<()> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| ButlerError::MissingCollection(name.to_string()))?;
        match record {
            CollectionRecord::Chained { children } => {
                for child in children {
                    self.resolve_into(child, resolved, seen)?;
                }
            }
            _ => {
                if seen.insert(name.to_string()) {
                    resolved.push(name.to_string());
                }
            }
        }
        Ok(())
    }

    /// Collection names matching a `*` glob, sorted.
    pub fn query(&self, pattern: &str) -> Vec<(String, CollectionType)> {
        self.records
            .iter()
            .filter(|(name, _)| glob_match(pattern, name))
            .map(|(name, record)| (name.clone(), record.collection_type()))
            .collect()
    }

    pub fn associate(&mut self, tag: &str, entries: Vec<(DatasetKey, Uuid)>) -> Result<()> {
        self.require_type(tag, CollectionType::Tagged)?;
        let Some(CollectionRecord::Tagged { members }) = self.records.get_mut(tag) else {
            return Err(ButlerError::MissingCollection(tag.to_string()));
        };
        for (key, id) in &entries {
            if let Some(existing) = members.get(key) {
                if existing != id {
                    return Err(ButlerError::ConflictingDataset(format!(
                        "tag '{}' already holds {} for dataset type '{}' and the same data ID",
                        tag, existing, key.0
                    )));
                }
            }
        }
        members.extend(entries);
        Ok(())
    }

    pub fn disassociate(&mut self, tag: &str, ids: &BTreeSet<Uuid>) -> Result<()> {
        self.require_type(tag, CollectionType::Tagged)?;
        if let Some(CollectionRecord::Tagged { members }) = self.records.get_mut(tag) {
            members.retain(|_, id| !ids.contains(id));
        }
        Ok(())
    }

    /// Dataset IDs held by a TAGGED collection.
    pub fn tagged_members(&self, tag: &str) -> Vec<Uuid> {
        match self.records.get(tag) {
            Some(CollectionRecord::Tagged { members }) => members.values().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn tagged_lookup(&self, tag: &str, key: &DatasetKey) -> Option<Uuid> {
        match self.records.get(tag) {
            Some(CollectionRecord::Tagged { members }) => members.get(key).copied(),
            _ => None,
        }
    }

    /// Drop removed datasets from every tag.
    pub fn forget_datasets(&mut self, ids: &BTreeSet<Uuid>) {
        for record in self.records.values_mut() {
            if let CollectionRecord::Tagged { members } = record {
                members.retain(|_, id| !ids.contains(id));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '+'));
    if ok {
        Ok(())
    } else {
        Err(ButlerError::InvalidConfig(format!(
            "invalid collection name '{}'",
            name
        )))
    }
}

/// Match `name` against a pattern where `*` matches any run of characters.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first) || name.len() < first.len() + last.len() || !name.ends_with(last) {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CollectionManager {
        let mut m = CollectionManager::default();
        m.register("run1", CollectionType::Run).unwrap();
        m.register("run2", CollectionType::Run).unwrap();
        m.register("tag", CollectionType::Tagged).unwrap();
        m.register("chain", CollectionType::Chained).unwrap();
        m
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut m = manager();
        assert!(!m.register("run1", CollectionType::Run).unwrap());
        assert!(matches!(
            m.register("run1", CollectionType::Tagged),
            Err(ButlerError::CollectionTypeMismatch { .. })
        ));
        assert!(m.register("bad name", CollectionType::Run).is_err());
    }

    #[test]
    fn test_chain_resolution_is_depth_first_and_unique() {
        let mut m = manager();
        m.register("inner", CollectionType::Chained).unwrap();
        m.set_chain("inner", &["run2", "tag"]).unwrap();
        m.set_chain("chain", &["run1", "inner", "run2"])
            .unwrap();
        let resolved = m.resolve(&["chain", "run1"]).unwrap();
        assert_eq!(resolved, vec!["run1", "run2", "tag"]);
    }

    #[test]
    fn test_chain_cycles_rejected() {
        let mut m = manager();
        m.register("other", CollectionType::Chained).unwrap();
        m.set_chain("chain", &["other"]).unwrap();
        assert!(matches!(
            m.set_chain("other", &["chain"]),
            Err(ButlerError::ChainCycle { .. })
        ));
        assert!(m.set_chain("chain", &["chain"]).is_err());
        assert!(m.set_chain("run1", &["run2"]).is_err());
        assert!(m.set_chain("chain", &["missing"]).is_err());
    }

    #[test]
    fn test_remove_child_of_chain_fails() {
        let mut m = manager();
        m.set_chain("chain", &["run1"]).unwrap();
        assert!(matches!(
            m.remove("run1"),
            Err(ButlerError::CollectionInUse { .. })
        ));
        m.remove("chain").unwrap();
        m.remove("run1").unwrap();
        assert!(!m.contains("run1"));
    }

    #[test]
    fn test_associate_conflicts() {
        let mut m = manager();
        let key: DatasetKey = ("raw".into(), vec![DataIdValue::from("HSC")]);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        m.associate("tag", vec![(key.clone(), a)]).unwrap();
        m.associate("tag", vec![(key.clone(), a)]).unwrap();
        assert!(m.associate("tag", vec![(key, b)]).is_err());
        assert!(m.associate("run1", vec![]).is_err());
        m.disassociate("tag", &[a].into_iter().collect()).unwrap();
        assert!(m.tagged_members("tag").is_empty());
    }

    #[test]
    fn test_glob() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("run*", "run1"));
        assert!(glob_match("*/raw", "HSC/raw"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("a*c*e", "abde"));
        assert!(!glob_match("ab*ba", "aba"));
        assert!(glob_match("exact", "exact"));
        let m = manager();
        let names: Vec<String> = m.query("run*").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["run1", "run2"]);
    }
}
