use super::{OrderByClause, QueryArgs, QueryWhereClause};
use crate::datasets::DatasetType;
use crate::dimensions::{DataIdValue, DimensionGroup};
use crate::error::{ButlerError, Result};
use crate::relation::ColumnTag;
use std::collections::{BTreeMap, BTreeSet};

/// Everything needed to plan one query.
#[derive(Debug, Clone)]
pub struct QuerySummary {
    /// Dimensions of the result rows.
    pub requested: DimensionGroup,
    /// Requested dimensions plus those the constraints and datasets need.
    pub dimensions: DimensionGroup,
    pub where_clause: QueryWhereClause,
    pub order_by: OrderByClause,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Dataset types whose existence constrains the results.
    pub datasets: Vec<DatasetType>,
    /// Flattened RUN and TAGGED collections, in search order.
    pub collections: Vec<String>,
    /// Dataset types reduced to the first match in search order.
    pub find_first: Vec<String>,
}

impl QuerySummary {
    /// Summarise `args` for results with dimensions `requested`.
    ///
    /// `order_by_element` switches ORDER BY parsing to the fields of a
    /// single element, as used by dimension record queries.
    pub fn new(
        requested: DimensionGroup,
        args: &QueryArgs,
        datasets: Vec<DatasetType>,
        collections: Vec<String>,
        defaults: &BTreeMap<String, DataIdValue>,
        order_by_element: Option<&str>,
    ) -> Result<Self> {
        let universe = requested.universe().clone();
        let mut base = requested.clone();
        for dataset_type in &datasets {
            base = base.union(dataset_type.dimensions())?;
        }

        let names: Vec<String> = datasets.iter().map(|d| d.name().to_string()).collect();
        let where_clause = QueryWhereClause::combine(&base, args, defaults, &names)?;
        let mut dimensions = where_clause.dimensions.clone();

        let order_by = match order_by_element {
            Some(element) => OrderByClause::parse_element(&args.order_by, universe.element(element)?)?,
            None => OrderByClause::parse_general(&args.order_by, &dimensions)?,
        };
        let order_elements: Vec<String> = order_by
            .elements()
            .filter_map(|e| universe.get(e))
            .flat_map(|e| e.key_dimensions().into_iter().map(str::to_string))
            .collect();
        if !order_elements.is_empty() {
            dimensions = dimensions.union(&DimensionGroup::new(&universe, &order_elements)?)?;
        }

        if !datasets.is_empty() && collections.is_empty() {
            return Err(ButlerError::InvalidQuery(
                "dataset constraints need at least one collection to search".to_string(),
            ));
        }

        let find_first = if args.find_first {
            names.clone()
        } else {
            Vec::new()
        };

        Ok(Self {
            requested,
            dimensions,
            where_clause,
            order_by,
            limit: args.limit,
            offset: args.offset,
            datasets,
            collections,
            find_first,
        })
    }

    /// Elements whose records some constraint or ORDER BY term reads.
    pub fn referenced_elements(&self) -> BTreeSet<String> {
        let mut elements = self.where_clause.elements.clone();
        elements.extend(self.order_by.elements().map(str::to_string));
        elements
    }

    /// Record columns of `element` the query reads.
    pub fn record_columns(&self, element: &str) -> Vec<ColumnTag> {
        let mut columns = self.where_clause.predicate.columns();
        if let Some(region) = &self.where_clause.region {
            columns.extend(region.columns());
        }
        for term in &self.order_by.terms {
            term.term.expr.columns(&mut columns);
        }
        columns
            .into_iter()
            .filter(|c| matches!(c, ColumnTag::DimensionRecord { element: e, .. } if e == element))
            .collect()
    }

    /// Dataset columns referenced by constraints, grouped by dataset type.
    pub fn dataset_columns(&self) -> BTreeSet<ColumnTag> {
        self.where_clause
            .predicate
            .columns()
            .into_iter()
            .filter(|c| matches!(c, ColumnTag::Dataset { .. }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::StorageClass;
    use crate::dimensions::DimensionUniverse;

    #[test]
    fn test_summary_expands_dimensions() {
        let universe = DimensionUniverse::default_universe();
        let requested = DimensionGroup::new(&universe, ["detector"]).unwrap();
        let calexp = DatasetType::new(
            "calexp",
            DimensionGroup::new(&universe, ["visit", "detector"]).unwrap(),
            StorageClass::new("ExposureF"),
        )
        .unwrap();
        let args = QueryArgs::new()
            .data_id_value("instrument", "HSC")
            .order_by(["-visit.exposure_time"])
            .find_first(true);
        let summary = QuerySummary::new(
            requested,
            &args,
            vec![calexp],
            vec!["run1".to_string()],
            &BTreeMap::new(),
            None,
        )
        .unwrap();
        assert!(summary.dimensions.contains("visit"));
        assert!(summary.dimensions.contains("band"));
        assert_eq!(summary.find_first, vec!["calexp"]);
        assert_eq!(
            summary.record_columns("visit"),
            vec![ColumnTag::record("visit", "exposure_time")]
        );
        assert!(summary.referenced_elements().contains("visit"));
    }

    #[test]
    fn test_summary_needs_collections_for_datasets() {
        let universe = DimensionUniverse::default_universe();
        let requested = DimensionGroup::new(&universe, ["detector"]).unwrap();
        let bias = DatasetType::new(
            "bias",
            DimensionGroup::new(&universe, ["detector"]).unwrap(),
            StorageClass::new("ExposureF"),
        )
        .unwrap();
        let args = QueryArgs::new().data_id_value("instrument", "HSC");
        let err = QuerySummary::new(requested, &args, vec![bias], vec![], &BTreeMap::new(), None);
        assert!(matches!(err, Err(ButlerError::InvalidQuery(_))));
    }
}
