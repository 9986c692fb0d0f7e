//! Query arguments, planning and results.
//!
//! A query is described by [`QueryArgs`], summarised into a
//! [`QuerySummary`] (which dimensions, which constraints, which datasets),
//! planned by [`QueryBuilder`] into a [`Query`] relation tree and finally
//! evaluated by one of the results types.

mod builder;
mod results;
mod summary;

pub use builder::{Query, QueryBuilder};
pub use results::{
    DataCoordinateQueryResults, DatasetQueryResults, DimensionRecordQueryResults,
};
pub use summary::QuerySummary;
pub(crate) use results::{row_dataset_id, row_values};

use crate::dimensions::{DataCoordinate, DataIdValue, DimensionElement, DimensionGroup, DimensionUniverse};
use crate::error::{ButlerError, Result};
use crate::expr::{BindValue, ConversionContext, convert, parse};
use crate::relation::{ColumnExpr, ColumnTag, Predicate, SortTerm, Value};
use crate::time::Timespan;
use geo::Polygon;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Where predicates and find-first operations are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// As much as possible inside the SQL part of the tree.
    #[default]
    Pushdown,
    /// Everything after the transfer, in post-processing.
    Postprocess,
}

/// Arguments shared by all query methods.
#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    pub(crate) where_clause: String,
    pub(crate) bind: BTreeMap<String, BindValue>,
    pub(crate) data_id: BTreeMap<String, DataIdValue>,
    pub(crate) collections: Option<Vec<String>>,
    pub(crate) datasets: Vec<String>,
    pub(crate) find_first: bool,
    pub(crate) region: Option<Polygon<f64>>,
    pub(crate) timespan: Option<Timespan>,
    pub(crate) order_by: Vec<String>,
    pub(crate) limit: Option<usize>,
    pub(crate) offset: usize,
    pub(crate) allow_orphans: bool,
    pub(crate) placement: Placement,
}

impl QueryArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_clause(mut self, expression: impl Into<String>) -> Self {
        self.where_clause = expression.into();
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<BindValue>) -> Self {
        self.bind.insert(name.into(), value.into());
        self
    }

    /// Constrain every result to this data ID.
    pub fn data_id(mut self, data_id: &DataCoordinate) -> Self {
        for (name, value) in data_id.values() {
            self.data_id.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn data_id_value(mut self, dimension: impl Into<String>, value: impl Into<DataIdValue>) -> Self {
        self.data_id.insert(dimension.into(), value.into());
        self
    }

    pub fn collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    /// Dataset types that must exist for each result.
    pub fn datasets<I, S>(mut self, dataset_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.datasets = dataset_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn find_first(mut self, find_first: bool) -> Self {
        self.find_first = find_first;
        self
    }

    /// Keep only results whose most specific region overlaps `region`.
    pub fn region(mut self, region: Polygon<f64>) -> Self {
        self.region = Some(region);
        self
    }

    /// Keep only results whose most specific timespan overlaps `timespan`.
    pub fn timespan(mut self, timespan: Timespan) -> Self {
        self.timespan = Some(timespan);
        self
    }

    pub fn order_by<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by = terms.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: usize, offset: Option<usize>) -> Self {
        self.limit = Some(limit);
        self.offset = offset.unwrap_or(0);
        self
    }

    pub fn allow_orphans(mut self, allow: bool) -> Self {
        self.allow_orphans = allow;
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }
}

/// The combined constraints of a query.
#[derive(Debug, Clone)]
pub struct QueryWhereClause {
    /// Expression, data ID, default and timespan constraints.
    pub predicate: Predicate,
    /// Region constraint; never rendered as SQL.
    pub region: Option<Predicate>,
    /// Every dimension the constraints involve, plus the base dimensions.
    pub dimensions: DimensionGroup,
    /// Elements whose records the constraints read.
    pub elements: BTreeSet<String>,
    /// Data ID values, including applied governor defaults.
    pub data_id: BTreeMap<String, DataIdValue>,
    pub governor_constraints: BTreeMap<String, BTreeSet<DataIdValue>>,
}

impl QueryWhereClause {
    /// Parse and convert the expression and merge it with the data ID,
    /// governor defaults, region and timespan.
    pub fn combine(
        base: &DimensionGroup,
        args: &QueryArgs,
        defaults: &BTreeMap<String, DataIdValue>,
        dataset_types: &[String],
    ) -> Result<Self> {
        let universe = base.universe().clone();

        let converted = match parse(&args.where_clause)? {
            Some(tree) => {
                let context = ConversionContext {
                    universe: &universe,
                    bind: &args.bind,
                    dataset_types,
                };
                Some(convert(&tree, &context)?)
            }
            None => None,
        };

        let mut data_id = BTreeMap::new();
        for (name, value) in &args.data_id {
            check_key(&universe, name, value)?;
            data_id.insert(name.clone(), value.clone());
        }

        let mut names: BTreeSet<String> = base.names().iter().cloned().collect();
        names.extend(data_id.keys().cloned());
        let mut elements = BTreeSet::new();
        let mut governor_constraints = BTreeMap::new();
        let mut conjuncts = Vec::new();
        let mut referenced = BTreeSet::new();
        if let Some(converted) = converted {
            names.extend(converted.dimensions.iter().cloned());
            elements = converted.elements;
            governor_constraints = converted.governor_constraints;
            referenced = converted.dimensions;
            conjuncts.push(converted.predicate);
        }
        let mut dimensions = DimensionGroup::new(&universe, &names)?;

        for governor in dimensions.governors() {
            if data_id.contains_key(governor) || governor_constraints.contains_key(governor) {
                continue;
            }
            if let Some(value) = defaults.get(governor) {
                check_key(&universe, governor, value)?;
                log::debug!("Applying default {}={} to query", governor, value);
                data_id.insert(governor.to_string(), value.clone());
            }
        }

        if !args.allow_orphans {
            let mut missing = BTreeSet::new();
            for name in &referenced {
                let element = universe.element(name)?;
                for dep in element.required() {
                    let is_governor = universe.get(dep).is_some_and(|e| e.is_governor());
                    if is_governor
                        && !data_id.contains_key(dep)
                        && !governor_constraints.contains_key(dep)
                    {
                        missing.insert(dep.clone());
                    }
                }
            }
            if !missing.is_empty() {
                return Err(ButlerError::MissingGovernor {
                    governors: missing.into_iter().collect(),
                });
            }
        }

        for (name, value) in &data_id {
            conjuncts.push(Predicate::eq(ColumnTag::key(name.as_str()), Value::from(value)));
        }

        if let Some(timespan) = &args.timespan {
            let element = last_element(&dimensions, DimensionElement::has_timespan).ok_or_else(|| {
                ButlerError::InvalidQuery(format!(
                    "a timespan constraint needs a dimension with a timespan, but the query has {}",
                    dimensions
                ))
            })?;
            elements.insert(element.clone());
            conjuncts.push(Predicate::Overlaps {
                lhs: ColumnExpr::column(ColumnTag::record(element, "timespan")),
                rhs: ColumnExpr::literal(*timespan),
            });
        }

        let region = match &args.region {
            Some(region) => {
                let element = last_element(&dimensions, DimensionElement::has_region).ok_or_else(|| {
                    ButlerError::InvalidQuery(format!(
                        "a region constraint needs a dimension with a region, but the query has {}",
                        dimensions
                    ))
                })?;
                elements.insert(element.clone());
                Some(Predicate::RegionOverlaps {
                    column: ColumnTag::record(element, "region"),
                    region: region.clone(),
                })
            }
            None => None,
        };

        // Record references can pull in join elements' dimensions.
        let extra: Vec<String> = elements
            .iter()
            .filter_map(|e| universe.get(e))
            .flat_map(|e| e.key_dimensions().into_iter().map(str::to_string))
            .filter(|d| !dimensions.contains(d))
            .collect();
        if !extra.is_empty() {
            dimensions = dimensions.union(&DimensionGroup::new(&universe, &extra)?)?;
        }

        Ok(Self {
            predicate: Predicate::and(conjuncts),
            region,
            dimensions,
            elements,
            data_id,
            governor_constraints,
        })
    }
}

fn check_key(universe: &DimensionUniverse, name: &str, value: &DataIdValue) -> Result<()> {
    let element = universe.element(name)?;
    match element.key_type() {
        Some(key_type) if key_type == value.key_type() => Ok(()),
        Some(key_type) => Err(ButlerError::InvalidDataId(format!(
            "value {} for '{}' should be of type {:?}",
            value, name, key_type
        ))),
        None => Err(ButlerError::InvalidDataId(format!(
            "'{}' is not a dimension",
            name
        ))),
    }
}

/// The last element of `group` (in universe order) satisfying `pred`.
fn last_element(group: &DimensionGroup, pred: fn(&DimensionElement) -> bool) -> Option<String> {
    group
        .elements()
        .into_iter()
        .rev()
        .find(|e| pred(e))
        .map(|e| e.name().to_string())
}

/// One parsed ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByTerm {
    pub term: SortTerm,
    /// Element whose record the term reads, if any.
    pub element: Option<String>,
}

/// Parsed ORDER BY clause.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderByClause {
    pub terms: Vec<OrderByTerm>,
}

impl OrderByClause {
    /// Terms naming `<dimension>`, `<dimension>.<key>`, `<element>.<field>`,
    /// `<element>.timespan.(begin|end)`, `timespan.(begin|end)` or a bare
    /// field name that is unique among the group's elements.
    pub fn parse_general<S: AsRef<str>>(terms: &[S], group: &DimensionGroup) -> Result<Self> {
        let universe = group.universe();
        let mut parsed = Vec::with_capacity(terms.len());
        for raw in terms {
            let (name, descending) = split_direction(raw.as_ref())?;
            let parts: Vec<&str> = name.split('.').collect();

            let term = match parts.as_slice() {
                [dim] | [dim, _] if group.contains(dim) && is_key_ref(universe, &parts) => {
                    OrderByTerm {
                        term: sort(ColumnExpr::column(ColumnTag::key(*dim)), descending),
                        element: None,
                    }
                }
                ["timespan", bound] => {
                    let element = last_element(group, DimensionElement::has_timespan)
                        .ok_or_else(|| order_error(name, "no dimension in the query has a timespan"))?;
                    timespan_term(element, bound, name, descending)?
                }
                [element, "timespan", bound] => {
                    require_element(group, element, name)?;
                    if !universe.element(element)?.has_timespan() {
                        return Err(order_error(name, "element has no timespan"));
                    }
                    timespan_term(element.to_string(), bound, name, descending)?
                }
                [element, field] => {
                    require_element(group, element, name)?;
                    if universe.element(element)?.field(field).is_none() {
                        return Err(order_error(name, "unknown field"));
                    }
                    record_term(element, field, descending)
                }
                [field] => {
                    let owners: Vec<&str> = group
                        .elements()
                        .into_iter()
                        .filter(|e| e.field(field).is_some())
                        .map(|e| e.name())
                        .collect();
                    match owners.as_slice() {
                        [owner] => record_term(owner, field, descending),
                        [] => return Err(order_error(name, "not a dimension or field of the query")),
                        _ => {
                            return Err(order_error(
                                name,
                                &format!("field is ambiguous between {:?}", owners),
                            ));
                        }
                    }
                }
                _ => return Err(order_error(name, "unrecognized term")),
            };
            parsed.push(term);
        }
        Ok(Self { terms: parsed })
    }

    /// Terms naming fields of one element, its key dimensions, or
    /// `timespan.(begin|end)`.
    pub fn parse_element<S: AsRef<str>>(terms: &[S], element: &DimensionElement) -> Result<Self> {
        let mut parsed = Vec::with_capacity(terms.len());
        for raw in terms {
            let (name, descending) = split_direction(raw.as_ref())?;
            let parts: Vec<&str> = name.split('.').collect();
            let term = match parts.as_slice() {
                [key] if element.key_dimensions().contains(key) => OrderByTerm {
                    term: sort(ColumnExpr::column(ColumnTag::key(*key)), descending),
                    element: None,
                },
                [pk] if *pk == element.primary_key() && element.is_dimension() => OrderByTerm {
                    term: sort(ColumnExpr::column(ColumnTag::key(element.name())), descending),
                    element: None,
                },
                ["timespan", bound] if element.has_timespan() => {
                    timespan_term(element.name().to_string(), bound, name, descending)?
                }
                [field] if element.field(field).is_some() => record_term(element.name(), field, descending),
                _ => {
                    return Err(order_error(
                        name,
                        &format!("not a field or key of '{}'", element.name()),
                    ));
                }
            };
            parsed.push(term);
        }
        Ok(Self { terms: parsed })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().filter_map(|t| t.element.as_deref())
    }

    pub fn sort_terms(&self) -> Vec<SortTerm> {
        self.terms.iter().map(|t| t.term.clone()).collect()
    }
}

fn split_direction(raw: &str) -> Result<(&str, bool)> {
    let trimmed = raw.trim();
    let (name, descending) = match trimmed.strip_prefix('-') {
        Some(rest) => (rest.trim(), true),
        None => (trimmed, false),
    };
    if name.is_empty() {
        return Err(ButlerError::InvalidQuery(
            "empty dimension name in ORDER BY".to_string(),
        ));
    }
    Ok((name, descending))
}

fn is_key_ref(universe: &Arc<DimensionUniverse>, parts: &[&str]) -> bool {
    match parts {
        [_] => true,
        [dim, key] => universe.get(dim).is_some_and(|e| e.primary_key() == *key),
        _ => false,
    }
}

fn require_element(group: &DimensionGroup, element: &str, term: &str) -> Result<()> {
    if group.elements().iter().any(|e| e.name() == element) {
        Ok(())
    } else {
        Err(order_error(term, "element is not part of the query"))
    }
}

fn sort(expr: ColumnExpr, descending: bool) -> SortTerm {
    SortTerm { expr, descending }
}

fn record_term(element: &str, field: &str, descending: bool) -> OrderByTerm {
    OrderByTerm {
        term: sort(ColumnExpr::column(ColumnTag::record(element, field)), descending),
        element: Some(element.to_string()),
    }
}

fn timespan_term(element: String, bound: &str, term: &str, descending: bool) -> Result<OrderByTerm> {
    let column = Box::new(ColumnExpr::column(ColumnTag::record(element.as_str(), "timespan")));
    let expr = match bound {
        "begin" => ColumnExpr::TimespanBegin(column),
        "end" => ColumnExpr::TimespanEnd(column),
        _ => return Err(order_error(term, "timespan terms must end in .begin or .end")),
    };
    Ok(OrderByTerm {
        term: sort(expr, descending),
        element: Some(element),
    })
}

fn order_error(term: &str, reason: &str) -> ButlerError {
    ButlerError::InvalidQuery(format!("invalid ORDER BY term '{}': {}", term, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(names: &[&str]) -> DimensionGroup {
        DimensionGroup::new(&DimensionUniverse::default_universe(), names).unwrap()
    }

    #[test]
    fn test_order_by_general() {
        let g = group(&["visit", "detector"]);
        let clause =
            OrderByClause::parse_general(&["-visit", "detector.id", "exposure_time", "timespan.begin"], &g)
                .unwrap();
        assert_eq!(clause.terms.len(), 4);
        assert!(clause.terms[0].term.descending);
        assert_eq!(clause.terms[2].element.as_deref(), Some("visit"));
        assert_eq!(clause.terms[3].element.as_deref(), Some("visit"));

        assert!(OrderByClause::parse_general(&["-"], &g).is_err());
        assert!(OrderByClause::parse_general(&[""], &g).is_err());
        assert!(OrderByClause::parse_general(&["tract"], &g).is_err());
        assert!(OrderByClause::parse_general(&["visit.nonsense"], &g).is_err());
        assert!(OrderByClause::parse_general(&["timespan.middle"], &g).is_err());
    }

    #[test]
    fn test_order_by_element() {
        let universe = DimensionUniverse::default_universe();
        let detector = universe.element("detector").unwrap();
        let clause = OrderByClause::parse_element(&["purpose", "-id", "instrument"], detector).unwrap();
        assert_eq!(clause.terms.len(), 3);
        assert!(clause.terms[1].term.descending);
        assert!(OrderByClause::parse_element(&["timespan.begin"], detector).is_err());
    }

    #[test]
    fn test_where_requires_governor() {
        let g = group(&["visit"]);
        let args = QueryArgs::new().where_clause("visit > 10");
        let err = QueryWhereClause::combine(&g, &args, &BTreeMap::new(), &[]).unwrap_err();
        assert!(matches!(err, ButlerError::MissingGovernor { .. }));

        let orphan = args.clone().allow_orphans(true);
        assert!(QueryWhereClause::combine(&g, &orphan, &BTreeMap::new(), &[]).is_ok());

        let with_id = args.clone().data_id_value("instrument", "HSC");
        assert!(QueryWhereClause::combine(&g, &with_id, &BTreeMap::new(), &[]).is_ok());

        let defaults = BTreeMap::from([("instrument".to_string(), DataIdValue::from("HSC"))]);
        let clause = QueryWhereClause::combine(&g, &args, &defaults, &[]).unwrap();
        assert_eq!(clause.data_id["instrument"], DataIdValue::from("HSC"));
        assert_eq!(clause.predicate.conjuncts().len(), 2);
    }

    #[test]
    fn test_where_in_expression_satisfies_governor() {
        let g = group(&["detector"]);
        let args = QueryArgs::new().where_clause("instrument IN ('HSC', 'LSSTCam') AND detector < 5");
        let clause = QueryWhereClause::combine(&g, &args, &BTreeMap::new(), &[]).unwrap();
        assert_eq!(clause.governor_constraints["instrument"].len(), 2);
    }

    #[test]
    fn test_where_region_and_timespan_elements() {
        let g = group(&["visit", "detector"]);
        let square = geo::Polygon::new(
            geo::LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]),
            vec![],
        );
        let args = QueryArgs::new()
            .data_id_value("instrument", "HSC")
            .region(square)
            .timespan(Timespan::unbounded());
        let clause = QueryWhereClause::combine(&g, &args, &BTreeMap::new(), &[]).unwrap();
        assert!(clause.elements.contains("visit_detector_region"));
        assert!(clause.elements.contains("visit"));
        assert!(matches!(
            clause.region,
            Some(Predicate::RegionOverlaps { ref column, .. }) if column == &ColumnTag::record("visit_detector_region", "region")
        ));
    }

    #[test]
    fn test_where_rejects_bad_data_id() {
        let g = group(&["detector"]);
        let args = QueryArgs::new().data_id_value("instrument", 1);
        assert!(QueryWhereClause::combine(&g, &args, &BTreeMap::new(), &[]).is_err());
    }
}
