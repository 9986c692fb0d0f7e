//! In-process iteration engine for relation trees.

use super::{ColumnTag, DatasetField, LeafRelation, Relation, Row, Value};
use crate::error::{ButlerError, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;

/// Supplies the rows of leaf relations.
pub trait RelationSource {
    /// Rows of `leaf`, each carrying exactly the leaf's columns.
    fn leaf_rows(&self, leaf: &LeafRelation) -> Result<Vec<Row>>;
}

/// Evaluate a whole relation tree.
///
/// Joins preserve the order of their left input, then of matching right
/// rows, so filtering an input before or after a join yields rows in the
/// same relative order.
pub fn execute(relation: &Relation, source: &dyn RelationSource) -> Result<Vec<Row>> {
    match relation {
        Relation::Leaf(leaf) => source.leaf_rows(leaf),
        Relation::Join(lhs, rhs) => {
            let shared: Vec<ColumnTag> = {
                let rhs_columns = rhs.columns();
                lhs.columns()
                    .into_iter()
                    .filter(|c| rhs_columns.contains(c))
                    .collect()
            };
            let left = execute(lhs, source)?;
            let right = execute(rhs, source)?;
            Ok(hash_join(left, right, &shared))
        }
        Relation::Selection { input, predicate } => {
            let rows = execute(input, source)?;
            Ok(rows
                .into_iter()
                .filter(|row| predicate.evaluate(row) == Some(true))
                .collect())
        }
        Relation::Projection { input, columns } => {
            let rows = execute(input, source)?;
            Ok(rows
                .into_iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                        .collect()
                })
                .collect())
        }
        Relation::Distinct(input) => {
            let rows = execute(input, source)?;
            let mut seen: FxHashSet<Row> = FxHashSet::default();
            Ok(rows
                .into_iter()
                .filter(|row| seen.insert(row.clone()))
                .collect())
        }
        Relation::Union(branches) => {
            let mut rows = Vec::new();
            for branch in branches {
                rows.extend(execute(branch, source)?);
            }
            Ok(rows)
        }
        Relation::FindFirst {
            input,
            dataset_type,
        } => {
            let rows = execute(input, source)?;
            find_first(rows, dataset_type)
        }
        Relation::Sort { input, terms } => {
            let mut rows = execute(input, source)?;
            rows.sort_by(|a, b| {
                for term in terms {
                    let ordering = term.expr.evaluate(a).sort_cmp(&term.expr.evaluate(b));
                    let ordering = if term.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
            Ok(rows)
        }
        Relation::Slice {
            input,
            offset,
            limit,
        } => {
            let rows = execute(input, source)?;
            let rows = rows.into_iter().skip(*offset);
            Ok(match limit {
                Some(limit) => rows.take(*limit).collect(),
                None => rows.collect(),
            })
        }
        Relation::Transfer(input) => execute(input, source),
    }
}

fn hash_join(left: Vec<Row>, right: Vec<Row>, shared: &[ColumnTag]) -> Vec<Row> {
    let key_of = |row: &Row| -> Option<Vec<Value>> {
        shared
            .iter()
            .map(|c| row.get(c).filter(|v| !v.is_null()).cloned())
            .collect()
    };

    let mut index: FxHashMap<Vec<Value>, Vec<usize>> = FxHashMap::default();
    for (i, row) in right.iter().enumerate() {
        // SQL never matches NULL join keys.
        if let Some(key) = key_of(row) {
            index.entry(key).or_default().push(i);
        }
    }

    let mut out = Vec::new();
    for row in &left {
        let Some(key) = key_of(row) else {
            continue;
        };
        if let Some(matches) = index.get(&key) {
            for &i in matches {
                let mut joined = row.clone();
                for (tag, value) in &right[i] {
                    joined.entry(tag.clone()).or_insert_with(|| value.clone());
                }
                out.push(joined);
            }
        }
    }
    out
}

fn find_first(rows: Vec<Row>, dataset_type: &str) -> Result<Vec<Row>> {
    let rank_tag = ColumnTag::dataset(dataset_type, DatasetField::Rank);
    let is_own = |tag: &ColumnTag| {
        matches!(tag, ColumnTag::Dataset { dataset_type: dt, .. } if dt == dataset_type)
    };

    let mut groups: FxHashMap<Vec<(ColumnTag, Value)>, usize> = FxHashMap::default();
    let mut best: Vec<(i64, Row)> = Vec::new();
    for row in rows {
        let rank = match row.get(&rank_tag) {
            Some(Value::Int(rank)) => *rank,
            _ => {
                return Err(ButlerError::InvalidQuery(format!(
                    "find-first over '{}' requires a rank column",
                    dataset_type
                )));
            }
        };
        let key: Vec<(ColumnTag, Value)> = row
            .iter()
            .filter(|(tag, _)| !is_own(tag))
            .map(|(tag, value)| (tag.clone(), value.clone()))
            .collect();
        match groups.get(&key) {
            Some(&slot) => {
                if rank < best[slot].0 {
                    best[slot] = (rank, row);
                }
            }
            None => {
                groups.insert(key, best.len());
                best.push((rank, row));
            }
        }
    }
    Ok(best.into_iter().map(|(_, row)| row).collect())
}
