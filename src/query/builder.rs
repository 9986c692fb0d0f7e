use super::{Placement, QuerySummary};
use crate::datasets::DatasetType;
use crate::error::{ButlerError, Result};
use crate::relation::{
    ColumnTag, DatasetField, LeafRelation, Predicate, Relation, RelationSource, Row, SqlQuery,
    execute, render_sql,
};
use std::collections::BTreeSet;

/// A planned query.
#[derive(Debug, Clone)]
pub struct Query {
    relation: Relation,
    columns: Vec<ColumnTag>,
    placement: Placement,
}

impl Query {
    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// Output columns of every row.
    pub fn columns(&self) -> &[ColumnTag] {
        &self.columns
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// SQL for the part of the tree below the transfer.
    pub fn sql(&self) -> Result<SqlQuery> {
        render_sql(&self.relation)
    }

    /// Operations evaluated after the transfer, innermost first.
    pub fn postprocessing(&self) -> Vec<String> {
        self.relation.postprocessing()
    }

    pub fn execute(&self, source: &dyn RelationSource) -> Result<Vec<Row>> {
        execute(&self.relation, source)
    }

    /// Every leaf of the tree, in join order.
    pub fn leaves(&self) -> Vec<&LeafRelation> {
        let mut leaves = Vec::new();
        collect_leaves(&self.relation, &mut leaves);
        leaves
    }
}

fn collect_leaves<'a>(relation: &'a Relation, out: &mut Vec<&'a LeafRelation>) {
    match relation {
        Relation::Leaf(leaf) => out.push(leaf),
        Relation::Join(a, b) => {
            collect_leaves(a, out);
            collect_leaves(b, out);
        }
        Relation::Union(branches) => {
            for branch in branches {
                collect_leaves(branch, out);
            }
        }
        Relation::Selection { input, .. }
        | Relation::Projection { input, .. }
        | Relation::Distinct(input)
        | Relation::FindFirst { input, .. }
        | Relation::Sort { input, .. }
        | Relation::Slice { input, .. }
        | Relation::Transfer(input) => collect_leaves(input, out),
    }
}

/// Columns a dataset search provides for `dataset_type`.
pub(crate) fn dataset_search_columns(dataset_type: &DatasetType) -> Vec<ColumnTag> {
    let name = dataset_type.name();
    let mut columns: Vec<ColumnTag> = dataset_type
        .dimensions()
        .names()
        .iter()
        .map(|d| ColumnTag::key(d.as_str()))
        .collect();
    for field in [
        DatasetField::DatasetId,
        DatasetField::Run,
        DatasetField::IngestDate,
        DatasetField::Rank,
    ] {
        columns.push(ColumnTag::dataset(name, field));
    }
    columns
}

/// Turns a [`QuerySummary`] into a relation tree.
pub struct QueryBuilder<'a> {
    summary: &'a QuerySummary,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(summary: &'a QuerySummary) -> Self {
        Self { summary }
    }

    /// Plan a query whose rows carry exactly `output`.
    pub fn build(&self, output: Vec<ColumnTag>, placement: Placement) -> Result<Query> {
        let summary = self.summary;
        let mut units = self.dimension_tables();
        units.extend(self.dataset_searches());

        let mut sql_conjuncts = Vec::new();
        let mut post_conjuncts = Vec::new();
        for conjunct in summary.where_clause.predicate.conjuncts() {
            if conjunct.is_true() {
                continue;
            }
            if conjunct.is_sql_compatible() {
                sql_conjuncts.push(conjunct.clone());
            } else {
                post_conjuncts.push(conjunct.clone());
            }
        }
        if let Some(region) = &summary.where_clause.region {
            post_conjuncts.push(region.clone());
        }

        let relation = match placement {
            Placement::Pushdown => {
                let mut remaining = Vec::new();
                for conjunct in sql_conjuncts {
                    let columns = conjunct.columns();
                    let target = if columns.is_empty() {
                        None
                    } else {
                        units.iter_mut().find(|unit| {
                            let provided = unit.columns();
                            columns.iter().all(|c| provided.contains(c))
                        })
                    };
                    match target {
                        Some(unit) => {
                            log::debug!("Pushing '{}' down to its table", conjunct);
                            let taken = std::mem::replace(unit, Relation::Union(Vec::new()));
                            *unit = taken.select(conjunct);
                        }
                        None => remaining.push(conjunct),
                    }
                }
                let joined = join_all(units)?.select(Predicate::and(remaining));
                if post_conjuncts.is_empty() {
                    Relation::Transfer(Box::new(self.finish(joined, &output)))
                } else {
                    log::debug!("Region constraint forces post-processing after the transfer");
                    let transferred =
                        Relation::Transfer(Box::new(joined)).select(Predicate::and(post_conjuncts));
                    self.finish(transferred, &output)
                }
            }
            Placement::Postprocess => {
                let mut all = sql_conjuncts;
                all.extend(post_conjuncts);
                let transferred =
                    Relation::Transfer(Box::new(join_all(units)?)).select(Predicate::and(all));
                self.finish(transferred, &output)
            }
        };

        Ok(Query {
            relation,
            columns: output,
            placement,
        })
    }

    /// Dimension element tables, in universe order.
    fn dimension_tables(&self) -> Vec<Relation> {
        let summary = self.summary;
        let referenced = summary.referenced_elements();
        let covered: BTreeSet<&str> = summary
            .datasets
            .iter()
            .flat_map(|d| d.dimensions().names().iter().map(String::as_str))
            .collect();

        let mut tables = Vec::new();
        for element in summary.dimensions.elements() {
            let name = element.name();
            let is_referenced = referenced.contains(name);
            if !element.is_dimension() && !is_referenced {
                continue;
            }
            let mut keys = element.key_dimensions();
            keys.extend(element.implied().iter().map(String::as_str));
            if !is_referenced && keys.iter().all(|k| covered.contains(k)) {
                continue;
            }
            let mut columns: Vec<ColumnTag> = keys.into_iter().map(ColumnTag::key).collect();
            columns.extend(summary.record_columns(name));
            tables.push(Relation::Leaf(LeafRelation::DimensionTable {
                element: name.to_string(),
                columns,
            }));
        }
        tables
    }

    /// One union of per-collection searches for each dataset type.
    fn dataset_searches(&self) -> Vec<Relation> {
        let summary = self.summary;
        summary
            .datasets
            .iter()
            .map(|dataset_type| {
                let columns = dataset_search_columns(dataset_type);
                let mut branches: Vec<Relation> = summary
                    .collections
                    .iter()
                    .enumerate()
                    .map(|(rank, collection)| {
                        Relation::Leaf(LeafRelation::DatasetSearch {
                            dataset_type: dataset_type.name().to_string(),
                            collection: collection.clone(),
                            rank,
                            columns: columns.clone(),
                        })
                    })
                    .collect();
                if branches.len() == 1 {
                    branches.remove(0)
                } else {
                    Relation::Union(branches)
                }
            })
            .collect()
    }

    /// Find-first, projection, deduplication, sort and slicing, applied in
    /// that order on top of `relation`.
    fn finish(&self, mut relation: Relation, output: &[ColumnTag]) -> Relation {
        let summary = self.summary;
        if !summary.find_first.is_empty() {
            let others: BTreeSet<&str> = summary
                .datasets
                .iter()
                .map(DatasetType::name)
                .filter(|name| !summary.find_first.iter().any(|f| f == name))
                .collect();
            if !others.is_empty() {
                let keep: Vec<ColumnTag> = relation
                    .columns()
                    .into_iter()
                    .filter(|c| match c {
                        ColumnTag::Dataset { dataset_type, .. } => !others.contains(dataset_type.as_str()),
                        _ => true,
                    })
                    .collect();
                relation = Relation::Distinct(Box::new(Relation::Projection {
                    input: Box::new(relation),
                    columns: keep,
                }));
            }
            for dataset_type in &summary.find_first {
                relation = Relation::FindFirst {
                    input: Box::new(relation),
                    dataset_type: dataset_type.clone(),
                };
            }
        }
        // Deduplicate before sorting so that the sort sits directly under
        // the slice. Sort columns are record fields of requested elements,
        // so carrying them through the distinct adds no rows.
        let terms = summary.order_by.sort_terms();
        let mut carried = output.to_vec();
        let mut sort_columns = BTreeSet::new();
        for term in &terms {
            term.expr.columns(&mut sort_columns);
        }
        for column in sort_columns {
            if !carried.contains(&column) {
                carried.push(column);
            }
        }
        let widened = carried.len() > output.len();
        relation = Relation::Distinct(Box::new(Relation::Projection {
            input: Box::new(relation),
            columns: carried,
        }));
        if !terms.is_empty() {
            relation = Relation::Sort {
                input: Box::new(relation),
                terms,
            };
        }
        if summary.limit.is_some() || summary.offset > 0 {
            relation = Relation::Slice {
                input: Box::new(relation),
                offset: summary.offset,
                limit: summary.limit,
            };
        }
        if widened {
            relation = Relation::Projection {
                input: Box::new(relation),
                columns: output.to_vec(),
            };
        }
        relation
    }
}

fn join_all(units: Vec<Relation>) -> Result<Relation> {
    let mut iter = units.into_iter();
    let first = iter.next().ok_or_else(|| {
        ButlerError::InvalidQuery("query has no dimensions and no dataset constraints".to_string())
    })?;
    Ok(iter.fold(first, Relation::join))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::StorageClass;
    use crate::dimensions::{DimensionGroup, DimensionUniverse};
    use crate::query::QueryArgs;
    use std::collections::BTreeMap;

    fn summary(args: QueryArgs, dims: &[&str], datasets: Vec<DatasetType>) -> QuerySummary {
        let universe = DimensionUniverse::default_universe();
        let requested = DimensionGroup::new(&universe, dims).unwrap();
        QuerySummary::new(
            requested,
            &args,
            datasets,
            vec!["run/a".to_string(), "run/b".to_string()],
            &BTreeMap::new(),
            None,
        )
        .unwrap()
    }

    fn flat(name: &str, dims: &[&str]) -> DatasetType {
        let universe = DimensionUniverse::default_universe();
        DatasetType::new(
            name,
            DimensionGroup::new(&universe, dims).unwrap(),
            StorageClass::new("StructuredData"),
        )
        .unwrap()
    }

    fn output(summary: &QuerySummary) -> Vec<ColumnTag> {
        summary.requested.names().iter().map(|d| ColumnTag::key(d.as_str())).collect()
    }

    #[test]
    fn test_pushdown_places_everything_under_transfer() {
        let s = summary(
            QueryArgs::new().where_clause("instrument = 'HSC' AND detector > 3"),
            &["detector"],
            vec![],
        );
        let query = QueryBuilder::new(&s).build(output(&s), Placement::Pushdown).unwrap();
        assert!(matches!(query.relation(), Relation::Transfer(_)));
        assert!(query.postprocessing().is_empty());
        let sql = query.sql().unwrap();
        assert!(sql.sql.contains("WHERE"), "{}", sql.sql);
        assert_eq!(query.leaves().len(), 2);
    }

    #[test]
    fn test_postprocess_keeps_sql_plain() {
        let s = summary(
            QueryArgs::new().where_clause("instrument = 'HSC' AND detector > 3"),
            &["detector"],
            vec![],
        );
        let query = QueryBuilder::new(&s).build(output(&s), Placement::Postprocess).unwrap();
        let steps = query.postprocessing();
        assert!(steps[0].starts_with("filter"), "{:?}", steps);
        assert!(!query.sql().unwrap().sql.contains("WHERE"));
    }

    #[test]
    fn test_dataset_covering_dimensions_skips_tables() {
        let bias = flat("bias", &["instrument", "detector"]);
        let s = summary(
            QueryArgs::new().data_id_value("instrument", "HSC").find_first(true),
            &["instrument", "detector"],
            vec![bias],
        );
        let query = QueryBuilder::new(&s).build(output(&s), Placement::Pushdown).unwrap();
        assert!(
            query
                .leaves()
                .iter()
                .all(|leaf| matches!(leaf, LeafRelation::DatasetSearch { .. }))
        );
        assert_eq!(query.leaves().len(), 2);
        assert!(query.sql().unwrap().sql.contains("ROW_NUMBER()"));
    }

    #[test]
    fn test_record_reference_joins_table() {
        let bias = flat("bias", &["instrument", "detector"]);
        let s = summary(
            QueryArgs::new().where_clause("instrument = 'HSC' AND detector.purpose = 'SCIENCE'"),
            &["detector"],
            vec![bias],
        );
        let query = QueryBuilder::new(&s).build(output(&s), Placement::Pushdown).unwrap();
        assert!(query.leaves().iter().any(|leaf| matches!(
            leaf,
            LeafRelation::DimensionTable { element, .. } if element == "detector"
        )));
    }

    #[test]
    fn test_region_stays_in_postprocessing() {
        let square = geo::Polygon::new(
            geo::LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]),
            vec![],
        );
        let s = summary(
            QueryArgs::new()
                .data_id_value("skymap", "rings")
                .region(square)
                .order_by(["patch"])
                .limit(3, None),
            &["patch"],
            vec![],
        );
        let query = QueryBuilder::new(&s).build(output(&s), Placement::Pushdown).unwrap();
        let steps = query.postprocessing();
        assert_eq!(steps.len(), 5, "{:?}", steps);
        assert!(steps[0].starts_with("filter"));
        assert!(steps[4].starts_with("slice"));
        assert!(query.sql().is_ok());
    }

    #[test]
    fn test_order_by_shares_a_select_with_limit() {
        let s = summary(
            QueryArgs::new().order_by(["-visit"]).limit(2, Some(1)),
            &["visit", "detector"],
            vec![],
        );
        for placement in [Placement::Pushdown, Placement::Postprocess] {
            let query = QueryBuilder::new(&s).build(output(&s), placement).unwrap();
            if placement == Placement::Pushdown {
                let sql = query.sql().unwrap().sql;
                let order = sql.rfind(" ORDER BY ").unwrap();
                let limit = sql.rfind(" LIMIT 2 OFFSET 1").unwrap();
                assert!(order < limit, "{}", sql);
                assert!(!sql[order..limit].contains(')'), "{}", sql);
                assert!(sql.find("DISTINCT").unwrap() < order, "{}", sql);
            } else {
                let steps = query.postprocessing();
                let sort = steps.iter().position(|s| s.starts_with("sort")).unwrap();
                let distinct = steps.iter().position(|s| s == "deduplicate").unwrap();
                assert!(distinct < sort, "{:?}", steps);
                assert!(steps.last().unwrap().starts_with("slice"));
            }
        }
    }

    #[test]
    fn test_empty_query_is_an_error() {
        let s = summary(QueryArgs::new(), &[], vec![]);
        assert!(QueryBuilder::new(&s).build(vec![], Placement::Pushdown).is_err());
    }
}
